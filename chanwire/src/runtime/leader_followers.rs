//! Leader/followers thread pool driving the [`Reactor`].
//!
//! Exactly one pool thread at a time (the leader) is inside
//! [`Reactor::process`]. When it picks up a ready key it:
//!
//! 1. disables the key, so no other thread can be dispatched for that channel;
//! 2. promotes a follower by queueing a new leader task;
//! 3. runs the channel's handler;
//! 4. re-enables the key (also when the handler panics).
//!
//! Handlers for distinct channels therefore run in parallel, bounded by the
//! pool size, while each channel sees at most one handler at a time.
//!
//! Threads take work from a crossbeam task channel; the same channel carries
//! auxiliary tasks submitted with [`LeaderFollowers::execute`].

use std::io;
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;

use super::reactor::{Key, Ops, Reactor, ReactorError, ReactorHandler, Step};
use crate::trace::{debug, error, info, warn};

/// Pool size used when the configuration does not say otherwise.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// One leader plus at least one follower.
pub const MIN_POOL_SIZE: usize = 2;

/// How long [`LeaderFollowers::shutdown`] waits for workers to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type Task = Box<dyn FnOnce() + Send>;

/// Pool failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[source] io::Error),
    /// The pool has stopped accepting tasks.
    #[error("pool is shut down")]
    Stopped,
    #[error(transparent)]
    Reactor(#[from] ReactorError),
}

struct Shared {
    tasks: Mutex<Option<Sender<Task>>>,
}

impl Shared {
    fn execute(&self, task: Task) -> Result<(), PoolError> {
        match &*self.tasks.lock() {
            Some(tasks) => tasks.send(task).map_err(|_| PoolError::Stopped),
            None => Err(PoolError::Stopped),
        }
    }

    /// Dropping the sender lets workers finish queued tasks and exit.
    fn stop(&self) {
        if self.tasks.lock().take().is_some() {
            debug!("pool stopped accepting tasks");
        }
    }

    fn promote_leader(self: &Arc<Self>, reactor: &Arc<Reactor>) -> bool {
        let shared = Arc::clone(self);
        let reactor = Arc::clone(reactor);
        self.execute(Box::new(move || lead(&shared, &reactor))).is_ok()
    }
}

/// Body of a leader task: process until one handler ran.
fn lead(shared: &Arc<Shared>, reactor: &Reactor) {
    loop {
        match reactor.process_once() {
            Step::Idle => {}
            Step::Dispatched => return,
            Step::Shutdown => {
                shared.stop();
                return;
            }
        }
    }
}

/// Wraps an application handler with the leader hand-off.
struct LeaderFollowersHandler {
    reactor: Weak<Reactor>,
    shared: Arc<Shared>,
    inner: Arc<dyn ReactorHandler>,
}

struct EnableOnDrop<'a> {
    reactor: &'a Reactor,
    key: Key,
}

impl Drop for EnableOnDrop<'_> {
    fn drop(&mut self) {
        self.reactor.enable_key(self.key);
    }
}

impl ReactorHandler for LeaderFollowersHandler {
    fn handle_event(&self, key: Key, ready: Ops) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };

        if !reactor.disable_key(key) {
            // Deregistered after it was picked.
            self.shared.promote_leader(&reactor);
            return;
        }

        self.shared.promote_leader(&reactor);

        let _enable = EnableOnDrop {
            reactor: &reactor,
            key,
        };
        self.inner.handle_event(key, ready);
    }

    fn deregistered(&self, key: Key) {
        self.inner.deregistered(key);
    }
}

/// Fixed pool of threads taking turns as reactor leader.
pub struct LeaderFollowers {
    reactor: Arc<Reactor>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exited: Receiver<()>,
    size: usize,
}

impl LeaderFollowers {
    /// Spawns `size` threads (at least [`MIN_POOL_SIZE`]) and the first
    /// leader.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Spawn`] if a thread cannot be created; threads
    /// already started are stopped again.
    pub fn start(reactor: Arc<Reactor>, size: usize) -> Result<Self, PoolError> {
        let size = size.max(MIN_POOL_SIZE);
        let (task_tx, task_rx) = crossbeam_channel::unbounded::<Task>();
        let (exit_tx, exit_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Shared {
            tasks: Mutex::new(Some(task_tx)),
        });

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let tasks = task_rx.clone();
            let exit = exit_tx.clone();
            let spawned = thread::Builder::new()
                .name(format!("chanwire-lf-{index}"))
                .spawn(move || work(&tasks, &exit));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(error = %e, index, "failed to spawn pool thread");
                    shared.stop();
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        let pool = Self {
            reactor,
            shared,
            workers: Mutex::new(workers),
            exited: exit_rx,
            size,
        };
        if !pool.shared.promote_leader(&pool.reactor) {
            return Err(PoolError::Stopped);
        }
        info!(size, "leader/followers pool started");
        Ok(pool)
    }

    /// Registers `channel` so its events are dispatched through the pool.
    ///
    /// # Errors
    ///
    /// See [`Reactor::register`].
    pub fn register<C>(
        &self,
        channel: &C,
        ops: Ops,
        handler: Arc<dyn ReactorHandler>,
    ) -> Result<Key, ReactorError>
    where
        C: AsRawFd + ?Sized,
    {
        let wrapped = Arc::new(LeaderFollowersHandler {
            reactor: Arc::downgrade(&self.reactor),
            shared: Arc::clone(&self.shared),
            inner: handler,
        });
        self.reactor.register(channel, ops, wrapped)
    }

    /// Runs `task` on a pool thread.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Stopped`] once the pool is shutting down.
    pub fn execute<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.execute(Box::new(task))
    }

    #[must_use]
    pub const fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Closes the reactor, stops accepting tasks, lets queued tasks drain and
    /// joins the workers. Threads still busy after one second are detached.
    pub fn shutdown(&self) {
        self.reactor.shutdown();
        self.shared.stop();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        let mut finished = 0;
        while finished < workers.len() {
            if self.exited.recv_deadline(deadline).is_err() {
                break;
            }
            finished += 1;
        }

        let current = thread::current().id();
        let mut detached = 0;
        for handle in workers {
            if handle.thread().id() != current && handle.is_finished() {
                let _ = handle.join();
            } else {
                detached += 1;
            }
        }
        if detached > 0 {
            warn!(detached, "pool threads still busy after shutdown grace period");
        }
        info!("leader/followers pool stopped");
    }
}

impl Drop for LeaderFollowers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn work(tasks: &Receiver<Task>, exit: &Sender<()>) {
    while let Ok(task) = tasks.recv() {
        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("pool task panicked");
        }
    }
    let _ = exit.send(());
}
