//! Pending requests keyed by correlation id.
//!
//! A request that expects an answer registers with the [`ResponseRegistry`]
//! and puts the returned [`Ioid`] in the outgoing message (`parameter2`).
//! The answer, a remote error, a timeout or a cancel then finds it again:
//!
//! ```text
//!   register ──► Ioid ──┬── deliver(response)   ─┐
//!                       ├── exception(status)   ─┤ Done  → unregistered
//!                       ├── timeout             ─┤
//!                       └── cancel              ─┘
//! ```
//!
//! Each request is unregistered exactly once; further lookups and
//! unregisters for the id are no-ops. Ids increase monotonically, skip 0
//! and any id still registered after wrap-around.

pub mod subscription;
pub mod waiter;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::protocol::{Header, Status};
use crate::runtime::{Timer, TimerError, TimerHandle};
use crate::trace::{debug, trace};

pub use subscription::{MonitorEvent, Subscription};
pub use waiter::{Reply, ReplyWaiter};

/// Request correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ioid(pub u32);

impl fmt::Display for Ioid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ioid#{}", self.0)
    }
}

/// Whether a request is finished after a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Unregister the request.
    Done,
    /// Keep it registered (subscriptions).
    Pending,
}

/// A request waiting for its answer.
///
/// A response may still be running when a timeout or cancel for the same id
/// fires on another thread. Implementations keep the first terminal outcome
/// and ignore the rest.
pub trait ResponseRequest: Send + Sync {
    fn response(&self, ioid: Ioid, header: &Header, payload: &[u8]) -> Completion;

    fn exception(&self, ioid: Ioid, status: Status, message: Option<&str>) -> Completion;

    /// The request was unregistered before any answer arrived.
    fn cancel(&self, _ioid: Ioid) {}

    /// No answer in time. The request is already unregistered; by default
    /// the cancel path runs and the waiter sees [`Status::Timeout`].
    fn timeout(&self, ioid: Ioid) {
        self.cancel(ioid);
        let _ = self.exception(ioid, Status::Timeout, None);
    }
}

struct Inner {
    requests: HashMap<Ioid, Arc<dyn ResponseRequest>>,
    last: u32,
}

/// Map from [`Ioid`] to pending request.
pub struct ResponseRegistry {
    inner: Mutex<Inner>,
}

impl ResponseRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                requests: HashMap::new(),
                last: 0,
            }),
        }
    }

    /// Assigns the next free id to `request`.
    pub fn register(&self, request: Arc<dyn ResponseRequest>) -> Ioid {
        let mut inner = self.inner.lock();
        loop {
            inner.last = inner.last.wrapping_add(1);
            let ioid = Ioid(inner.last);
            if ioid.0 == 0 || inner.requests.contains_key(&ioid) {
                continue;
            }
            inner.requests.insert(ioid, request);
            trace!(%ioid, "request registered");
            return ioid;
        }
    }

    #[must_use]
    pub fn get(&self, ioid: Ioid) -> Option<Arc<dyn ResponseRequest>> {
        self.inner.lock().requests.get(&ioid).cloned()
    }

    /// Removes `ioid`. A second call returns `None`.
    pub fn unregister(&self, ioid: Ioid) -> Option<Arc<dyn ResponseRequest>> {
        self.inner.lock().requests.remove(&ioid)
    }

    /// Unregisters `ioid` and runs its timeout path. Returns `false` if it
    /// had already completed.
    pub fn timeout(&self, ioid: Ioid) -> bool {
        let Some(request) = self.unregister(ioid) else {
            return false;
        };
        debug!(%ioid, "request timed out");
        request.timeout(ioid);
        true
    }

    /// Unregisters `ioid` and runs its cancel path.
    pub fn cancel(&self, ioid: Ioid) -> bool {
        let Some(request) = self.unregister(ioid) else {
            return false;
        };
        request.cancel(ioid);
        true
    }

    /// Hands a response to `ioid`'s request. Returns `false` for an unknown
    /// id (late answer after a timeout or cancel).
    pub fn deliver(&self, ioid: Ioid, header: &Header, payload: &[u8]) -> bool {
        let Some(request) = self.get(ioid) else {
            debug!(%ioid, command = header.command, "response for unknown request dropped");
            return false;
        };
        if request.response(ioid, header, payload) == Completion::Done {
            self.unregister_exact(ioid, &request);
        }
        true
    }

    /// Hands a remote error to `ioid`'s request.
    pub fn exception(&self, ioid: Ioid, status: Status, message: Option<&str>) -> bool {
        let Some(request) = self.get(ioid) else {
            debug!(%ioid, %status, "error for unknown request dropped");
            return false;
        };
        if request.exception(ioid, status, message) == Completion::Done {
            self.unregister_exact(ioid, &request);
        }
        true
    }

    /// Schedules [`ResponseRegistry::timeout`] for `ioid` after `delay`.
    ///
    /// The timer holds only a weak reference to the registry. Cancel the
    /// returned handle once the answer arrived.
    ///
    /// # Errors
    ///
    /// [`TimerError::Shutdown`] if the timer is stopped.
    pub fn arm_timeout(
        self: &Arc<Self>,
        timer: &Timer,
        ioid: Ioid,
        delay: Duration,
    ) -> Result<TimerHandle, TimerError> {
        let registry = Arc::downgrade(self);
        timer.schedule_after(delay, move |_| {
            if let Some(registry) = registry.upgrade() {
                registry.timeout(ioid);
            }
        })
    }

    /// Cancels every pending request. Returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let requests: Vec<_> = self.inner.lock().requests.drain().collect();
        let count = requests.len();
        for (ioid, request) in requests {
            request.cancel(ioid);
        }
        if count > 0 {
            debug!(count, "pending requests cancelled");
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().requests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().requests.is_empty()
    }

    /// Unregisters `ioid` only while it still maps to `request`.
    fn unregister_exact(&self, ioid: Ioid, request: &Arc<dyn ResponseRequest>) {
        let mut inner = self.inner.lock();
        if inner
            .requests
            .get(&ioid)
            .is_some_and(|current| Arc::ptr_eq(current, request))
        {
            inner.requests.remove(&ioid);
        }
    }
}

impl Default for ResponseRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::command;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        responses: AtomicUsize,
        exceptions: AtomicUsize,
        cancels: AtomicUsize,
        keep: bool,
    }

    impl ResponseRequest for Counting {
        fn response(&self, _: Ioid, _: &Header, _: &[u8]) -> Completion {
            self.responses.fetch_add(1, Ordering::SeqCst);
            if self.keep {
                Completion::Pending
            } else {
                Completion::Done
            }
        }

        fn exception(&self, _: Ioid, _: Status, _: Option<&str>) -> Completion {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
            Completion::Done
        }

        fn cancel(&self, _: Ioid) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ids_are_unique_and_skip_zero() {
        let registry = ResponseRegistry::new();
        let a = registry.register(Arc::new(Counting::default()));
        let b = registry.register(Arc::new(Counting::default()));
        assert_eq!(a, Ioid(1));
        assert_eq!(b, Ioid(2));

        registry.inner.lock().last = u32::MAX - 1;
        let c = registry.register(Arc::new(Counting::default()));
        assert_eq!(c, Ioid(u32::MAX));
        // Wraps past 0 and the ids still registered.
        let d = registry.register(Arc::new(Counting::default()));
        assert_eq!(d, Ioid(3));
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = ResponseRegistry::new();
        let ioid = registry.register(Arc::new(Counting::default()));
        assert!(registry.unregister(ioid).is_some());
        assert!(registry.unregister(ioid).is_none());
        assert!(registry.get(ioid).is_none());
        assert!(!registry.timeout(ioid));
        assert!(!registry.cancel(ioid));
    }

    #[test]
    fn done_response_unregisters() {
        let registry = ResponseRegistry::new();
        let request = Arc::new(Counting::default());
        let ioid = registry.register(request.clone());

        let header = Header::new(command::READ_NOTIFY);
        assert!(registry.deliver(ioid, &header, &[]));
        assert!(!registry.deliver(ioid, &header, &[]));
        assert_eq!(request.responses.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn pending_response_stays_registered() {
        let registry = ResponseRegistry::new();
        let request = Arc::new(Counting {
            keep: true,
            ..Counting::default()
        });
        let ioid = registry.register(request.clone());

        let header = Header::new(command::EVENT_ADD);
        for _ in 0..3 {
            assert!(registry.deliver(ioid, &header, &[]));
        }
        assert_eq!(request.responses.load(Ordering::SeqCst), 3);
        assert!(registry.cancel(ioid));
        assert_eq!(request.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_cancels_then_reports() {
        let registry = ResponseRegistry::new();
        let request = Arc::new(Counting::default());
        let ioid = registry.register(request.clone());

        assert!(registry.timeout(ioid));
        assert_eq!(request.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(request.exceptions.load(Ordering::SeqCst), 1);
        assert!(!registry.timeout(ioid));
    }

    #[test]
    fn armed_timeout_fires() {
        let registry = Arc::new(ResponseRegistry::new());
        let timer = Timer::new("test-timer").unwrap();
        let request = Arc::new(Counting::default());
        let ioid = registry.register(request.clone());

        registry
            .arm_timeout(&timer, ioid, Duration::from_millis(10))
            .unwrap();
        for _ in 0..200 {
            if registry.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(registry.is_empty());
        timer.shutdown();
        assert_eq!(request.exceptions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_all_empties() {
        let registry = ResponseRegistry::new();
        let request = Arc::new(Counting::default());
        for _ in 0..4 {
            registry.register(request.clone());
        }
        assert_eq!(registry.cancel_all(), 4);
        assert_eq!(request.cancels.load(Ordering::SeqCst), 4);
        assert!(registry.is_empty());
    }

    #[test]
    fn late_answer_after_timeout_is_not_a_second_outcome() {
        let registry = ResponseRegistry::new();
        let subscription = Arc::new(Subscription::new(crate::sync::OverflowPolicy::DropOldest));
        let ioid = registry.register(subscription.clone());

        // A response thread looked the request up just before the timeout.
        let in_flight = registry.get(ioid).unwrap();
        assert!(registry.timeout(ioid));
        let late = Header::new(command::EVENT_ADD);
        assert_eq!(in_flight.response(ioid, &late, &[]), Completion::Done);
        assert_eq!(
            in_flight.exception(ioid, Status::BadType, None),
            Completion::Done
        );

        assert_eq!(
            subscription.events().drain(),
            [MonitorEvent::Cancelled, MonitorEvent::Error(Status::Timeout)]
        );
        assert!(!registry.deliver(ioid, &late, &[]));
    }

    #[test]
    fn waiter_keeps_the_timeout_over_a_late_answer() {
        let registry = ResponseRegistry::new();
        let waiter = Arc::new(ReplyWaiter::new());
        let ioid = registry.register(waiter.clone());

        let in_flight = registry.get(ioid).unwrap();
        assert!(registry.timeout(ioid));
        in_flight.response(ioid, &Header::new(command::READ_NOTIFY), &[1]);

        assert!(matches!(
            waiter.wait(Duration::ZERO),
            Some(Reply::Failed {
                status: Status::Timeout,
                ..
            })
        ));
        assert_eq!(waiter.wait(Duration::ZERO), None);
    }
}
