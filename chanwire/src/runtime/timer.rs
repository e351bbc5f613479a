//! Delayed and fixed-rate periodic callbacks on one background thread.
//!
//! Tasks sit in a binary min-heap ordered by deadline (ties broken by
//! insertion order). The timer thread sleeps on a condition variable until
//! the head is due, re-checking the head whenever a task is inserted.
//!
//! Cancellation is lazy: [`TimerHandle::cancel`] only flags the task, and the
//! flagged entry is discarded when it reaches the head of the heap. A
//! callback that is already running is never waited for.
//!
//! Periodic tasks run at a fixed rate: the next deadline is the previous
//! *scheduled* time plus the period, so a slow callback does not make the
//! schedule drift.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::trace::{debug, error};

/// Callback invoked with the time it was scheduled to run.
type Callback = dyn Fn(Instant) + Send + Sync;

/// Error scheduling a task.
#[derive(Debug, Error)]
pub enum TimerError {
    /// The timer has been shut down.
    #[error("timer is shut down")]
    Shutdown,
    /// A periodic task needs a non-zero period.
    #[error("periodic task needs a non-zero period")]
    ZeroPeriod,
}

struct Task {
    callback: Box<Callback>,
    period: Option<Duration>,
    cancelled: AtomicBool,
}

impl Task {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// Handle to a scheduled task.
///
/// Cloning the handle does not clone the task; every clone cancels the same
/// task.
#[derive(Clone)]
pub struct TimerHandle(Arc<Task>);

impl TimerHandle {
    /// Prevents any future invocation. Safe to call repeatedly and from any
    /// thread, including from inside the task's own callback.
    pub fn cancel(&self) {
        self.0.cancelled.store(true, AtomicOrdering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    #[must_use]
    pub fn is_periodic(&self) -> bool {
        self.0.period.is_some()
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("period", &self.0.period)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    task: Arc<Task>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Reversed: BinaryHeap is a max-heap, the earliest deadline must surface.
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
    shutdown: bool,
}

impl Queue {
    fn push(&mut self, deadline: Instant, task: Arc<Task>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Scheduled {
            deadline,
            seq,
            task,
        });
    }
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// Single-thread task scheduler.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Starts the timer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn new(name: &str) -> io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || {
                debug!("timer thread started");
                run(&worker);
                debug!("timer thread exiting");
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Runs `task` once after `delay`.
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::Shutdown`] after [`Timer::shutdown`].
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Result<TimerHandle, TimerError>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        self.schedule(Instant::now() + delay, None, Box::new(task))
    }

    /// Runs `task` every `period`, the first time after `first` (zero means
    /// as soon as possible).
    ///
    /// # Errors
    ///
    /// Returns [`TimerError::ZeroPeriod`] for a zero period and
    /// [`TimerError::Shutdown`] after [`Timer::shutdown`].
    pub fn schedule_periodic<F>(
        &self,
        period: Duration,
        first: Duration,
        task: F,
    ) -> Result<TimerHandle, TimerError>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(TimerError::ZeroPeriod);
        }
        self.schedule(Instant::now() + first, Some(period), Box::new(task))
    }

    /// Same as [`TimerHandle::cancel`].
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.cancel();
    }

    /// Number of entries in the heap, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }

    /// Stops the thread and discards every pending task.
    ///
    /// Joins the thread unless called from a timer callback.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.shutdown {
                return;
            }
            queue.shutdown = true;
            queue.heap.clear();
        }
        self.shared.wakeup.notify_all();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            error!("timer thread panicked");
        }
    }

    fn schedule(
        &self,
        deadline: Instant,
        period: Option<Duration>,
        callback: Box<Callback>,
    ) -> Result<TimerHandle, TimerError> {
        let task = Arc::new(Task {
            callback,
            period,
            cancelled: AtomicBool::new(false),
        });

        let mut queue = self.shared.queue.lock();
        if queue.shutdown {
            return Err(TimerError::Shutdown);
        }
        let becomes_head = queue.heap.peek().is_none_or(|head| deadline < head.deadline);
        queue.push(deadline, Arc::clone(&task));
        drop(queue);

        if becomes_head {
            self.shared.wakeup.notify_one();
        }
        Ok(TimerHandle(task))
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(shared: &Shared) {
    let mut queue = shared.queue.lock();
    loop {
        if queue.shutdown {
            return;
        }

        let Some(head) = queue.heap.peek() else {
            shared.wakeup.wait(&mut queue);
            continue;
        };
        if head.task.is_cancelled() {
            queue.heap.pop();
            continue;
        }
        let deadline = head.deadline;
        if deadline > Instant::now() {
            shared.wakeup.wait_until(&mut queue, deadline);
            continue;
        }

        let Some(due) = queue.heap.pop() else {
            continue;
        };
        if let Some(period) = due.task.period {
            queue.push(due.deadline + period, Arc::clone(&due.task));
        }

        MutexGuard::unlocked(&mut queue, || fire(&due));
    }
}

fn fire(due: &Scheduled) {
    if due.task.is_cancelled() {
        return;
    }
    let result = panic::catch_unwind(AssertUnwindSafe(|| (due.task.callback)(due.deadline)));
    if result.is_err() {
        error!("timer callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn one_shot_tasks_fire_in_deadline_order() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = unbounded();

        for (label, delay) in [("d3", 60), ("d1", 20), ("d2", 40)] {
            let tx = tx.clone();
            timer
                .schedule_after(Duration::from_millis(delay), move |_| {
                    tx.send(label).unwrap();
                })
                .unwrap();
        }

        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn cancelled_task_never_fires() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = unbounded();

        let mut handles = Vec::new();
        for (label, delay) in [("d1", 20), ("d2", 40), ("d3", 60)] {
            let tx = tx.clone();
            handles.push(
                timer
                    .schedule_after(Duration::from_millis(delay), move |_| {
                        tx.send(label).unwrap();
                    })
                    .unwrap(),
            );
        }
        handles[1].cancel();
        handles[1].cancel();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "d1");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "d3");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn periodic_is_fixed_rate() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = unbounded();
        let period = Duration::from_millis(20);

        let slow_once = AtomicBool::new(true);
        let t0 = Instant::now();
        let handle = timer
            .schedule_periodic(period, period, move |scheduled| {
                // A slow first run must not shift later deadlines.
                if slow_once.swap(false, AtomicOrdering::Relaxed) {
                    thread::sleep(Duration::from_millis(35));
                }
                let _ = tx.send(scheduled);
            })
            .unwrap();

        let fired: Vec<Instant> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        handle.cancel();

        let first = fired[0];
        assert!(first >= t0 + period);
        for (k, at) in fired.iter().enumerate() {
            assert_eq!(*at, first + period * k as u32);
        }
    }

    #[test]
    fn zero_period_is_rejected() {
        let timer = Timer::new("test-timer").unwrap();
        let err = timer
            .schedule_periodic(Duration::ZERO, Duration::ZERO, |_| {})
            .unwrap_err();
        assert!(matches!(err, TimerError::ZeroPeriod));
    }

    #[test]
    fn cancel_from_inside_callback() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = unbounded();
        let slot: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&slot);
        let handle = timer
            .schedule_periodic(Duration::from_millis(5), Duration::from_millis(20), move |_| {
                tx.send(()).unwrap();
                if let Some(h) = inner.lock().as_ref() {
                    h.cancel();
                }
            })
            .unwrap();
        *slot.lock() = Some(handle.clone());

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rx.try_iter().count(), 0, "task kept firing after cancel");
        assert!(handle.is_cancelled());
    }

    #[test]
    fn panicking_callback_does_not_stop_timer() {
        let timer = Timer::new("test-timer").unwrap();
        let (tx, rx) = unbounded();

        timer
            .schedule_after(Duration::from_millis(5), |_| panic!("boom"))
            .unwrap();
        timer
            .schedule_after(Duration::from_millis(20), move |_| tx.send(()).unwrap())
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn shutdown_rejects_new_tasks() {
        let timer = Timer::new("test-timer").unwrap();
        timer
            .schedule_after(Duration::from_secs(60), |_| {})
            .unwrap();
        assert_eq!(timer.pending(), 1);

        timer.shutdown();
        assert_eq!(timer.pending(), 0);
        assert!(matches!(
            timer.schedule_after(Duration::ZERO, |_| {}),
            Err(TimerError::Shutdown)
        ));
        timer.shutdown();
    }
}
