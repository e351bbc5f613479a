//! Readiness multiplexer with queued mutations.
//!
//! The [`Reactor`] owns the single [`mio::Poll`]. Registration,
//! deregistration and interest changes coming from other threads are pushed
//! as request objects onto mutex-protected lists and the poll is woken with a
//! [`mio::Waker`]; the thread inside [`Reactor::process`] drains them between
//! waits. When no thread is inside `process` the caller drains its own
//! request directly.
//!
//! # Processing
//!
//! ```text
//! process():
//!   1. drain deregistrations        (handler dropped, channel closed)
//!   2. drain interest changes
//!   3. poll, unless ready keys are already buffered
//!   4. shutdown requested?          → close, return false
//!   5. drain registrations
//!   6. nothing ready?               → return true
//!   7. take ONE ready key, clear its write interest, dispatch, return true
//! ```
//!
//! Readiness for a key disabled with [`Reactor::disable_key`] stays buffered
//! until [`Reactor::enable_key`]; mio is edge-triggered, so dropping it would
//! lose the event.
//!
//! Channels are registered by raw fd and stay owned by their handler. Write
//! interest is one-shot: it is cleared every time the key is dispatched, and
//! a handler that still has bytes to write asks for it again.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::ops::{BitOr, BitOrAssign};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;

use crate::trace::{debug, error, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

/// How often a caller blocked on a queued request re-checks for shutdown.
const REQUEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identifies one registered channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(usize);

impl Key {
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// Interest and readiness bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Ops(u8);

impl Ops {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(0b01);
    pub const WRITE: Self = Self(0b10);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    fn interest(self) -> Option<Interest> {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn from_event(event: &Event) -> Self {
        let mut ops = Self::NONE;
        // Hang-ups and errors surface as readable so the handler's next read
        // observes them.
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ops |= Self::READ;
        }
        if event.is_writable() || event.is_write_closed() {
            ops |= Self::WRITE;
        }
        ops
    }
}

impl BitOr for Ops {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for Ops {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Receives readiness for a registered channel.
pub trait ReactorHandler: Send + Sync {
    /// Called with the ready subset of the key's interest.
    fn handle_event(&self, key: Key, ready: Ops);

    /// Called once the reactor has forgotten the key, on deregistration or
    /// reactor shutdown. The handler closes its channel here.
    fn deregistered(&self, _key: Key) {}
}

/// Reactor failures.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// The OS multiplexer could not be created.
    #[error("failed to create poll: {0}")]
    Poll(#[source] io::Error),
    /// mio refused the registration.
    #[error("failed to register channel: {0}")]
    Register(#[source] io::Error),
    /// The reactor has been shut down.
    #[error("reactor is shut down")]
    Shutdown,
    /// The key is not registered.
    #[error("unknown {0}")]
    UnknownKey(Key),
}

/// Result of one pass of [`Reactor::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// Nothing was ready; call again.
    Idle,
    /// One handler was invoked.
    Dispatched,
    /// The reactor is closed.
    Shutdown,
}

struct Registration {
    key: Key,
    fd: RawFd,
    ops: Ops,
    handler: Arc<dyn ReactorHandler>,
    done: Sender<io::Result<()>>,
}

struct Deregistration {
    key: Key,
    done: Sender<()>,
}

#[derive(Default)]
struct Pending {
    registrations: Vec<Registration>,
    deregistrations: Vec<Deregistration>,
    interest: Vec<(Key, Ops)>,
}

/// Per-key state visible without the poll lock.
#[derive(Default)]
struct KeyState {
    disabled: bool,
    /// Interest requested while disabled, applied on enable.
    deferred: Option<Ops>,
}

struct Channel {
    fd: RawFd,
    ops: Ops,
    /// Whether mio currently knows the fd (interest zero is not representable
    /// in mio, so such channels are deregistered from it).
    polled: bool,
    handler: Arc<dyn ReactorHandler>,
}

struct Selector {
    poll: Poll,
    events: Events,
    channels: HashMap<Key, Channel>,
    ready_order: VecDeque<Key>,
    ready: HashMap<Key, Ops>,
}

/// Readiness multiplexer.
pub struct Reactor {
    selector: Mutex<Selector>,
    registry: Registry,
    waker: Waker,
    pending: Mutex<Pending>,
    keys: Mutex<HashMap<Key, KeyState>>,
    next_key: AtomicUsize,
    shutdown: AtomicBool,
    closed: AtomicBool,
}

impl Reactor {
    /// Creates the OS multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Poll`] if the poll or its waker cannot be
    /// created. This is fatal for the owning context.
    pub fn new() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Poll)?;
        let registry = poll.registry().try_clone().map_err(ReactorError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ReactorError::Poll)?;

        Ok(Self {
            selector: Mutex::new(Selector {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
                channels: HashMap::new(),
                ready_order: VecDeque::new(),
                ready: HashMap::new(),
            }),
            registry,
            waker,
            pending: Mutex::new(Pending::default()),
            keys: Mutex::new(HashMap::new()),
            next_key: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Registers `channel` with `ops` interest.
    ///
    /// Blocks until the reactor thread has applied the registration.
    ///
    /// # Errors
    ///
    /// [`ReactorError::Shutdown`] if the reactor is (or becomes) shut down,
    /// [`ReactorError::Register`] if mio rejects the fd.
    pub fn register<C>(
        &self,
        channel: &C,
        ops: Ops,
        handler: Arc<dyn ReactorHandler>,
    ) -> Result<Key, ReactorError>
    where
        C: AsRawFd + ?Sized,
    {
        if self.is_shutdown() {
            return Err(ReactorError::Shutdown);
        }

        let key = Key(self.next_key.fetch_add(1, Ordering::Relaxed));
        let (done, completion) = crossbeam_channel::bounded(1);
        self.pending.lock().registrations.push(Registration {
            key,
            fd: channel.as_raw_fd(),
            ops,
            handler,
            done,
        });
        self.kick();

        match self.await_completion(&completion)? {
            Ok(()) => {
                debug!(%key, fd = channel.as_raw_fd(), "channel registered");
                Ok(key)
            }
            Err(e) => Err(ReactorError::Register(e)),
        }
    }

    /// Removes `key`; its handler gets [`ReactorHandler::deregistered`].
    ///
    /// Blocks until the reactor thread has applied the request. Unknown keys
    /// and a closed reactor are not errors.
    pub fn deregister(&self, key: Key) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (done, completion) = crossbeam_channel::bounded(1);
        self.pending
            .lock()
            .deregistrations
            .push(Deregistration { key, done });
        self.kick();
        let _ = self.await_completion(&completion);
    }

    /// Replaces the interest set of `key`.
    ///
    /// For a disabled key the new set is remembered and applied on
    /// [`Reactor::enable_key`].
    ///
    /// # Errors
    ///
    /// [`ReactorError::UnknownKey`] if `key` is not registered.
    pub fn set_interest_ops(&self, key: Key, ops: Ops) -> Result<(), ReactorError> {
        {
            let mut keys = self.keys.lock();
            let state = keys.get_mut(&key).ok_or(ReactorError::UnknownKey(key))?;
            if state.disabled {
                state.deferred = Some(ops);
                return Ok(());
            }
        }
        self.pending.lock().interest.push((key, ops));
        self.kick();
        Ok(())
    }

    /// Suppresses dispatch for `key` until [`Reactor::enable_key`].
    ///
    /// Returns `false` if the key is not registered.
    pub fn disable_key(&self, key: Key) -> bool {
        match self.keys.lock().get_mut(&key) {
            Some(state) => {
                state.disabled = true;
                true
            }
            None => false,
        }
    }

    /// Re-enables dispatch for `key`, applying interest set while disabled.
    pub fn enable_key(&self, key: Key) {
        let deferred = {
            let mut keys = self.keys.lock();
            let Some(state) = keys.get_mut(&key) else {
                return;
            };
            state.disabled = false;
            state.deferred.take()
        };
        if let Some(ops) = deferred {
            self.pending.lock().interest.push((key, ops));
        }
        // Buffered readiness may be waiting for this key.
        self.wake();
    }

    /// Whether `key` is currently registered.
    pub fn is_registered(&self, key: Key) -> bool {
        self.keys.lock().contains_key(&key)
    }

    /// Number of registered channels.
    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    /// Runs one pass; see the module docs. Returns `false` once the reactor
    /// is closed.
    pub fn process(&self) -> bool {
        self.process_once() != Step::Shutdown
    }

    /// Requests shutdown and waits briefly for the reactor to close.
    ///
    /// Pending registrations fail with [`ReactorError::Shutdown`]; every
    /// registered handler gets [`ReactorHandler::deregistered`].
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("reactor shutdown requested");
        self.wake();

        // A leader blocked in poll closes on its own; otherwise do it here.
        match self.selector.try_lock_for(Duration::from_secs(1)) {
            Some(mut selector) => {
                if !self.closed.load(Ordering::Acquire) {
                    self.close(&mut selector);
                }
            }
            None => {
                warn!("reactor still busy after shutdown request");
            }
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn process_once(&self) -> Step {
        self.process_timeout(None)
    }

    /// One pass with a bounded poll wait; `None` blocks until readiness or a
    /// wake-up.
    pub(crate) fn process_timeout(&self, timeout: Option<Duration>) -> Step {
        let mut guard = self.selector.lock();
        if self.closed.load(Ordering::Acquire) {
            return Step::Shutdown;
        }
        let selector = &mut *guard;

        self.drain_deregistrations(selector);
        self.drain_interest(selector);

        if !self.has_dispatchable(selector) {
            match selector.poll.poll(&mut selector.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(error = %e, "poll failed");
                }
            }
            for event in &selector.events {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let key = Key(event.token().0);
                let Some(channel) = selector.channels.get(&key) else {
                    continue;
                };
                let ops = Ops::from_event(event).intersect(channel.ops);
                if ops.is_empty() {
                    continue;
                }
                match selector.ready.get_mut(&key) {
                    Some(buffered) => *buffered |= ops,
                    None => {
                        selector.ready.insert(key, ops);
                        selector.ready_order.push_back(key);
                    }
                }
            }
        }

        if self.shutdown.load(Ordering::Acquire) {
            self.close(selector);
            return Step::Shutdown;
        }

        self.drain_registrations(selector);

        let Some((key, ready)) = self.take_ready(selector) else {
            return Step::Idle;
        };
        let Some(channel) = selector.channels.get_mut(&key) else {
            return Step::Idle;
        };
        if channel.ops.contains(Ops::WRITE) {
            let ops = channel.ops.without(Ops::WRITE);
            Self::apply_interest(&self.registry, key, channel, ops);
        }
        let handler = Arc::clone(&channel.handler);
        drop(guard);

        trace!(%key, ?ready, "dispatching");
        handler.handle_event(key, ready);
        Step::Dispatched
    }

    fn has_dispatchable(&self, selector: &Selector) -> bool {
        if selector.ready_order.is_empty() {
            return false;
        }
        let keys = self.keys.lock();
        selector
            .ready_order
            .iter()
            .any(|key| keys.get(key).is_some_and(|state| !state.disabled))
    }

    fn take_ready(&self, selector: &mut Selector) -> Option<(Key, Ops)> {
        let keys = self.keys.lock();
        let position = selector
            .ready_order
            .iter()
            .position(|key| keys.get(key).is_some_and(|state| !state.disabled))?;
        drop(keys);
        let key = selector.ready_order.remove(position)?;
        let ops = selector.ready.remove(&key)?;
        Some((key, ops))
    }

    fn drain_registrations(&self, selector: &mut Selector) {
        let registrations = std::mem::take(&mut self.pending.lock().registrations);
        for reg in registrations {
            let mut channel = Channel {
                fd: reg.fd,
                ops: Ops::NONE,
                polled: false,
                handler: reg.handler,
            };
            let result = match reg.ops.interest() {
                Some(interest) => self
                    .registry
                    .register(&mut SourceFd(&reg.fd), Token(reg.key.0), interest)
                    .map(|()| channel.polled = true),
                None => Ok(()),
            };
            match result {
                Ok(()) => {
                    channel.ops = reg.ops;
                    selector.channels.insert(reg.key, channel);
                    self.keys.lock().insert(reg.key, KeyState::default());
                    let _ = reg.done.send(Ok(()));
                }
                Err(e) => {
                    warn!(key = %reg.key, fd = reg.fd, error = %e, "registration failed");
                    let _ = reg.done.send(Err(e));
                }
            }
        }
    }

    fn drain_deregistrations(&self, selector: &mut Selector) {
        let deregistrations = std::mem::take(&mut self.pending.lock().deregistrations);
        for dereg in deregistrations {
            self.keys.lock().remove(&dereg.key);
            if selector.ready.remove(&dereg.key).is_some() {
                selector.ready_order.retain(|k| *k != dereg.key);
            }
            if let Some(channel) = selector.channels.remove(&dereg.key) {
                if channel.polled {
                    let _ = self.registry.deregister(&mut SourceFd(&channel.fd));
                }
                debug!(key = %dereg.key, fd = channel.fd, "channel deregistered");
                channel.handler.deregistered(dereg.key);
            }
            let _ = dereg.done.send(());
        }
    }

    fn drain_interest(&self, selector: &mut Selector) {
        let changes = std::mem::take(&mut self.pending.lock().interest);
        for (key, ops) in changes {
            if let Some(channel) = selector.channels.get_mut(&key) {
                Self::apply_interest(&self.registry, key, channel, ops);
            }
        }
    }

    fn apply_interest(registry: &Registry, key: Key, channel: &mut Channel, ops: Ops) {
        if channel.ops == ops {
            return;
        }
        let mut source = SourceFd(&channel.fd);
        let result = match (ops.interest(), channel.polled) {
            (Some(interest), true) => registry.reregister(&mut source, Token(key.0), interest),
            (Some(interest), false) => registry.register(&mut source, Token(key.0), interest),
            (None, true) => registry.deregister(&mut source),
            (None, false) => Ok(()),
        };
        match result {
            Ok(()) => {
                channel.ops = ops;
                channel.polled = !ops.is_empty();
            }
            Err(e) => {
                warn!(%key, ?ops, error = %e, "interest change failed");
            }
        }
    }

    fn close(&self, selector: &mut Selector) {
        self.closed.store(true, Ordering::Release);

        let pending = std::mem::take(&mut *self.pending.lock());
        // Dropping the completion senders fails the waiting callers.
        drop(pending.registrations);
        for dereg in pending.deregistrations {
            let _ = dereg.done.send(());
        }

        self.keys.lock().clear();
        selector.ready.clear();
        selector.ready_order.clear();
        for (key, channel) in selector.channels.drain() {
            if channel.polled {
                let _ = self.registry.deregister(&mut SourceFd(&channel.fd));
            }
            channel.handler.deregistered(key);
        }
        info!("reactor closed");
    }

    /// Applies queued requests now if no thread is in `process`, otherwise
    /// wakes that thread.
    fn kick(&self) {
        match self.selector.try_lock() {
            Some(mut guard) => {
                let selector = &mut *guard;
                if self.closed.load(Ordering::Acquire) {
                    let pending = std::mem::take(&mut *self.pending.lock());
                    for dereg in pending.deregistrations {
                        let _ = dereg.done.send(());
                    }
                    return;
                }
                self.drain_deregistrations(selector);
                self.drain_interest(selector);
                self.drain_registrations(selector);
            }
            None => self.wake(),
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "failed to wake reactor");
        }
    }

    fn await_completion<T>(
        &self,
        completion: &crossbeam_channel::Receiver<T>,
    ) -> Result<T, ReactorError> {
        loop {
            match completion.recv_timeout(REQUEST_POLL_INTERVAL) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Disconnected) => return Err(ReactorError::Shutdown),
                Err(RecvTimeoutError::Timeout) => {
                    if self.closed.load(Ordering::Acquire) {
                        return Err(ReactorError::Shutdown);
                    }
                    // The leader may have consumed the wake-up before our
                    // request was queued.
                    self.kick();
                }
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.shutdown.store(true, Ordering::Release);
            let selector = self.selector.get_mut();
            let pending = std::mem::take(self.pending.get_mut());
            drop(pending);
            self.keys.get_mut().clear();
            for (key, channel) in selector.channels.drain() {
                channel.handler.deregistered(key);
            }
            self.closed.store(true, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        events: AtomicUsize,
        closed: AtomicBool,
        last: Mutex<Ops>,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                last: Mutex::new(Ops::NONE),
            })
        }
    }

    impl ReactorHandler for Counting {
        fn handle_event(&self, _key: Key, ready: Ops) {
            self.events.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = ready;
        }

        fn deregistered(&self, _key: Key) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn socket_pair() -> (UdpSocket, UdpSocket) {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.set_nonblocking(true).unwrap();
        b.connect(a.local_addr().unwrap()).unwrap();
        (a, b)
    }

    const PASS: Option<Duration> = Some(Duration::from_millis(50));

    fn process_until_dispatched(reactor: &Reactor) {
        for _ in 0..50 {
            if reactor.process_timeout(PASS) == Step::Dispatched {
                return;
            }
        }
        panic!("no event dispatched");
    }

    #[test]
    fn ops_bits() {
        let rw = Ops::READ | Ops::WRITE;
        assert!(rw.contains(Ops::READ));
        assert!(rw.contains(Ops::WRITE));
        assert_eq!(rw.without(Ops::WRITE), Ops::READ);
        assert!(!Ops::NONE.contains(Ops::NONE));
        assert!(Ops::NONE.interest().is_none());
    }

    #[test]
    fn register_without_leader_applies_directly() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let handler = Counting::new();

        let key = reactor.register(&rx, Ops::READ, handler.clone()).unwrap();
        assert!(reactor.is_registered(key));
        assert_eq!(reactor.len(), 1);
    }

    #[test]
    fn readable_socket_is_dispatched_once_per_pass() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let handler = Counting::new();
        reactor.register(&rx, Ops::READ, handler.clone()).unwrap();

        tx.send(b"ping").unwrap();
        process_until_dispatched(&reactor);
        assert_eq!(handler.events.load(Ordering::SeqCst), 1);
        assert_eq!(*handler.last.lock(), Ops::READ);
    }

    #[test]
    fn disabled_key_keeps_readiness_buffered() {
        let reactor = Reactor::new().unwrap();
        let (rx, tx) = socket_pair();
        let handler = Counting::new();
        let key = reactor.register(&rx, Ops::READ, handler.clone()).unwrap();

        assert!(reactor.disable_key(key));
        tx.send(b"ping").unwrap();
        // The event is collected but not dispatched.
        assert_eq!(reactor.process_timeout(PASS), Step::Idle);
        assert_eq!(handler.events.load(Ordering::SeqCst), 0);

        reactor.enable_key(key);
        process_until_dispatched(&reactor);
        assert_eq!(handler.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn interest_set_while_disabled_is_deferred() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let handler = Counting::new();
        let key = reactor.register(&rx, Ops::NONE, handler.clone()).unwrap();

        assert!(reactor.disable_key(key));
        reactor.set_interest_ops(key, Ops::WRITE).unwrap();
        reactor.enable_key(key);

        // An idle UDP socket is writable.
        process_until_dispatched(&reactor);
        assert_eq!(*handler.last.lock(), Ops::WRITE);

        // Write interest was cleared on dispatch.
        assert_eq!(reactor.process_timeout(PASS), Step::Idle);
        assert_eq!(handler.events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deregister_notifies_handler() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let handler = Counting::new();
        let key = reactor.register(&rx, Ops::READ, handler.clone()).unwrap();

        reactor.deregister(key);
        assert!(handler.closed.load(Ordering::SeqCst));
        assert!(!reactor.is_registered(key));
        assert!(matches!(
            reactor.set_interest_ops(key, Ops::READ),
            Err(ReactorError::UnknownKey(_))
        ));
        // Second deregistration is a no-op.
        reactor.deregister(key);
    }

    #[test]
    fn shutdown_closes_and_rejects_registrations() {
        let reactor = Reactor::new().unwrap();
        let (rx, _tx) = socket_pair();
        let handler = Counting::new();
        reactor.register(&rx, Ops::READ, handler.clone()).unwrap();

        reactor.shutdown();
        assert!(reactor.is_closed());
        assert!(handler.closed.load(Ordering::SeqCst));
        assert!(!reactor.process());
        assert!(matches!(
            reactor.register(&rx, Ops::READ, Counting::new()),
            Err(ReactorError::Shutdown)
        ));
    }

    #[test]
    fn shutdown_wakes_blocked_process() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let worker = {
            let reactor = Arc::clone(&reactor);
            std::thread::spawn(move || while reactor.process() {})
        };
        std::thread::sleep(Duration::from_millis(20));
        reactor.shutdown();
        worker.join().unwrap();
        assert!(reactor.is_closed());
    }
}
