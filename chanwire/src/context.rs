//! One protocol engine instance.
//!
//! A [`Context`] owns every shared component. Construction order follows
//! the dependencies; [`Context::shutdown`] tears them down in reverse:
//!
//! ```text
//!   Reactor ─► LeaderFollowers ─► Timer
//!      ResponseRegistry, TransportRegistry
//!      BeaconMonitor ─► DispatchTable
//!      DatagramTransport (attached to the pool) ─► Connector
//!      repeater registration
//! ```
//!
//! Nothing here is process-wide: two contexts in one process share no
//! state.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::beacon::{BeaconEmitter, BeaconMonitor, TransportLookup};
use crate::config::ContextConfig;
use crate::dispatch::{DispatchTable, ResponseHandler};
use crate::protocol::{Header, Message, command};
use crate::response::{Ioid, ReplyWaiter, ResponseRegistry, Subscription};
use crate::runtime::{LeaderFollowers, PoolError, Reactor, ReactorError, Timer, TimerError, TimerHandle};
use crate::sync::OverflowPolicy;
use crate::trace::{debug, info};
use crate::transport::{
    Connector, DatagramTransport, SendPriority, StreamTransport, Transport, TransportClient,
    TransportError, TransportRegistry,
};

/// First wait for the relay's confirmation before retrying in the background.
const REPEATER_CONFIRM_WAIT: Duration = Duration::from_millis(100);

/// Retry period of the relay registration.
const REPEATER_RETRY_PERIOD: Duration = Duration::from_secs(1);

/// Context construction and request failures.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Timer(#[from] TimerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to start timer thread: {0}")]
    Spawn(#[source] io::Error),
    #[error("failed to bind datagram socket {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("context is shut down")]
    Closed,
}

/// Registration with the discovery relay on this host.
struct RepeaterRegistration {
    confirmed: Mutex<bool>,
    signal: Condvar,
    retry: Mutex<Option<TimerHandle>>,
}

impl RepeaterRegistration {
    fn new() -> Self {
        Self {
            confirmed: Mutex::new(false),
            signal: Condvar::new(),
            retry: Mutex::new(None),
        }
    }

    fn is_confirmed(&self) -> bool {
        *self.confirmed.lock()
    }

    /// Waits up to `timeout` for the confirmation.
    fn wait(&self, timeout: Duration) -> bool {
        let mut confirmed = self.confirmed.lock();
        if !*confirmed {
            let _ = self.signal.wait_for(&mut confirmed, timeout);
        }
        *confirmed
    }

    fn request(datagram: &DatagramTransport, relay: SocketAddr) {
        let register = Message::repeater_register(Ipv4Addr::LOCALHOST);
        match datagram.send_to(&register, relay) {
            Ok(()) => {
                debug!(%relay, "repeater registration sent");
            }
            Err(e) => {
                debug!(%relay, error = %e, "repeater registration failed");
            }
        }
    }

    fn stop_retrying(&self) {
        if let Some(handle) = self.retry.lock().take() {
            handle.cancel();
        }
    }
}

impl ResponseHandler for RepeaterRegistration {
    fn handle_response(&self, from: SocketAddr, _: &dyn Transport, _: &Header, _: &[u8]) {
        {
            let mut confirmed = self.confirmed.lock();
            if *confirmed {
                return;
            }
            *confirmed = true;
        }
        self.signal.notify_all();
        self.stop_retrying();
        info!(repeater = %from, "repeater confirmed registration");
    }
}

/// A running protocol engine.
pub struct Context {
    config: ContextConfig,
    pool: Arc<LeaderFollowers>,
    timer: Arc<Timer>,
    responses: Arc<ResponseRegistry>,
    transports: Arc<TransportRegistry<StreamTransport>>,
    beacons: Arc<BeaconMonitor>,
    dispatch: Arc<DispatchTable>,
    datagram: Arc<DatagramTransport>,
    connector: Connector,
    repeater: Arc<RepeaterRegistration>,
    emitter: Mutex<Option<Arc<BeaconEmitter>>>,
    closed: AtomicBool,
}

impl Context {
    /// Starts the engine threads and binds the datagram transport.
    ///
    /// # Errors
    ///
    /// Fails if the poll instance, a pool or timer thread, or the datagram
    /// socket cannot be created. Whatever was started is stopped again.
    pub fn new(config: ContextConfig) -> Result<Self, ContextError> {
        let reactor = Arc::new(Reactor::new()?);
        let pool = match LeaderFollowers::start(Arc::clone(&reactor), config.pool_size) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                reactor.shutdown();
                return Err(e.into());
            }
        };
        let timer = match Timer::new("chanwire-timer") {
            Ok(timer) => Arc::new(timer),
            Err(e) => {
                pool.shutdown();
                return Err(ContextError::Spawn(e));
            }
        };

        match Self::assemble(config, Arc::clone(&pool), Arc::clone(&timer)) {
            Ok(context) => Ok(context),
            Err(e) => {
                pool.shutdown();
                timer.shutdown();
                Err(e)
            }
        }
    }

    fn assemble(
        config: ContextConfig,
        pool: Arc<LeaderFollowers>,
        timer: Arc<Timer>,
    ) -> Result<Self, ContextError> {
        let responses = Arc::new(ResponseRegistry::new());
        let transports: Arc<TransportRegistry<StreamTransport>> = Arc::new(TransportRegistry::new());
        let lookup: Arc<dyn TransportLookup> = transports.clone();
        let beacons = Arc::new(BeaconMonitor::new(config.server_port, Arc::downgrade(&lookup)));
        let repeater = Arc::new(RepeaterRegistration::new());

        let mut table = DispatchTable::with_defaults(Arc::clone(&responses), Arc::clone(&beacons));
        table.set(command::REPEATER_CONFIRM, repeater.clone());
        let dispatch = Arc::new(table);

        let shared = config.bind_address.port() != 0;
        let datagram = DatagramTransport::bind(config.bind_address, shared, dispatch.clone())
            .map_err(|source| ContextError::Bind {
                addr: config.bind_address,
                source,
            })?;
        datagram.set_broadcast_addresses(config.broadcast_targets());
        datagram.set_ignored_addresses(config.ignore_addresses.clone());
        datagram.attach(&pool)?;

        let connector = Connector::new(
            Arc::clone(&pool),
            Arc::clone(&timer),
            Arc::clone(&transports),
            dispatch.clone(),
            config.connector_options(),
        );

        let context = Self {
            config,
            pool,
            timer,
            responses,
            transports,
            beacons,
            dispatch,
            datagram,
            connector,
            repeater,
            emitter: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if context.config.repeater_registration {
            context.register_with_repeater()?;
        }
        info!(
            local = %context.datagram.local_address(),
            pool = context.pool.size(),
            "context started"
        );
        Ok(context)
    }

    /// Sends the relay registration and waits briefly for the confirmation;
    /// unconfirmed registrations are retried every second.
    fn register_with_repeater(&self) -> Result<(), ContextError> {
        let relay = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.repeater_port));
        RepeaterRegistration::request(&self.datagram, relay);
        if self.repeater.wait(REPEATER_CONFIRM_WAIT) {
            return Ok(());
        }

        let datagram: Weak<DatagramTransport> = Arc::downgrade(&self.datagram);
        let registration = Arc::downgrade(&self.repeater);
        let handle = self.timer.schedule_periodic(
            REPEATER_RETRY_PERIOD,
            REPEATER_RETRY_PERIOD,
            move |_| {
                let (Some(datagram), Some(registration)) =
                    (datagram.upgrade(), registration.upgrade())
                else {
                    return;
                };
                if !registration.is_confirmed() {
                    RepeaterRegistration::request(&datagram, relay);
                }
            },
        )?;
        *self.repeater.retry.lock() = Some(handle);
        // The confirmation may have raced the scheduling.
        if self.repeater.is_confirmed() {
            self.repeater.stop_retrying();
        }
        Ok(())
    }

    #[must_use]
    pub const fn config(&self) -> &ContextConfig {
        &self.config
    }

    #[must_use]
    pub const fn pool(&self) -> &Arc<LeaderFollowers> {
        &self.pool
    }

    #[must_use]
    pub const fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    #[must_use]
    pub const fn responses(&self) -> &Arc<ResponseRegistry> {
        &self.responses
    }

    #[must_use]
    pub const fn transports(&self) -> &Arc<TransportRegistry<StreamTransport>> {
        &self.transports
    }

    #[must_use]
    pub const fn beacons(&self) -> &Arc<BeaconMonitor> {
        &self.beacons
    }

    #[must_use]
    pub const fn dispatch(&self) -> &Arc<DispatchTable> {
        &self.dispatch
    }

    #[must_use]
    pub const fn datagram(&self) -> &Arc<DatagramTransport> {
        &self.datagram
    }

    /// Whether the local discovery relay acknowledged us.
    #[must_use]
    pub fn is_repeater_confirmed(&self) -> bool {
        self.repeater.is_confirmed()
    }

    /// Stream transport to `address` at `priority`, shared with other
    /// clients of the same server.
    ///
    /// # Errors
    ///
    /// [`ContextError::Closed`] after shutdown, otherwise see
    /// [`Connector::connect`].
    pub fn connect(
        &self,
        client: Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Result<Arc<StreamTransport>, ContextError> {
        self.ensure_open()?;
        Ok(self.connector.connect(client, address, priority)?)
    }

    /// Sends `message` to every broadcast address.
    ///
    /// # Errors
    ///
    /// See [`Transport::submit`].
    pub fn broadcast(&self, message: &Message) -> Result<(), ContextError> {
        self.ensure_open()?;
        Ok(self.datagram.submit(message, SendPriority::Normal)?)
    }

    /// Registers a one-shot request that times out after `timeout`.
    ///
    /// # Errors
    ///
    /// [`ContextError::Timer`] if the timeout cannot be armed; the request is
    /// unregistered again.
    pub fn request(&self, timeout: Duration) -> Result<(Ioid, Arc<ReplyWaiter>), ContextError> {
        self.ensure_open()?;
        let waiter = Arc::new(ReplyWaiter::new());
        let ioid = self.responses.register(waiter.clone());
        match self.responses.arm_timeout(&self.timer, ioid, timeout) {
            Ok(handle) => waiter.set_deadline(handle),
            Err(e) => {
                self.responses.unregister(ioid);
                return Err(e.into());
            }
        }
        Ok((ioid, waiter))
    }

    /// Registers a subscription with the configured overflow policy.
    pub fn subscribe(&self) -> (Ioid, Arc<Subscription>) {
        self.subscribe_with(self.config.monitor_policy)
    }

    pub fn subscribe_with(&self, policy: OverflowPolicy) -> (Ioid, Arc<Subscription>) {
        let subscription = Arc::new(Subscription::new(policy));
        let ioid = self.responses.register(subscription.clone());
        (ioid, subscription)
    }

    /// Starts announcing a server at `address:server_port` with the
    /// configured period ceiling. A second call returns the running emitter.
    ///
    /// # Errors
    ///
    /// [`ContextError::Closed`] after shutdown, [`ContextError::Timer`] if
    /// the first beacon cannot be scheduled.
    pub fn start_beacons(
        &self,
        server_port: u16,
        address: Ipv4Addr,
    ) -> Result<Arc<BeaconEmitter>, ContextError> {
        self.ensure_open()?;
        let mut slot = self.emitter.lock();
        if let Some(emitter) = slot.as_ref() {
            return Ok(Arc::clone(emitter));
        }
        let emitter = BeaconEmitter::new(
            self.datagram.clone(),
            Arc::clone(&self.timer),
            server_port,
            address,
            self.config.beacon_period,
        );
        emitter.start()?;
        *slot = Some(Arc::clone(&emitter));
        Ok(emitter)
    }

    /// Stops everything in reverse construction order. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(emitter) = self.emitter.lock().take() {
            emitter.destroy();
        }
        self.repeater.stop_retrying();

        let cancelled = self.responses.cancel_all();
        let transports = self.transports.clear();
        let closed = transports.len();
        for transport in transports {
            transport.close(true);
        }
        self.datagram.close(true);

        self.pool.shutdown();
        self.timer.shutdown();
        info!(cancelled, closed, "context stopped");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), ContextError> {
        if self.is_closed() {
            Err(ContextError::Closed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Status, command};
    use crate::response::{MonitorEvent, Reply};

    fn quiet() -> ContextConfig {
        ContextConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            auto_broadcast: false,
            repeater_registration: false,
            pool_size: 2,
            ..ContextConfig::default()
        }
    }

    #[test]
    fn request_times_out() {
        let context = Context::new(quiet()).unwrap();
        let (ioid, waiter) = context.request(Duration::from_millis(20)).unwrap();
        assert_eq!(
            waiter.wait(Duration::from_secs(2)),
            Some(Reply::Failed {
                status: Status::Timeout,
                message: None,
            })
        );
        assert!(context.responses().get(ioid).is_none());
        context.shutdown();
    }

    #[test]
    fn answered_request_disarms_its_timeout() {
        let context = Context::new(quiet()).unwrap();
        let (ioid, waiter) = context.request(Duration::from_secs(60)).unwrap();
        let deadline = waiter.deadline().unwrap();
        assert!(!deadline.is_cancelled());

        let header = Header {
            data_type: 6,
            data_count: 1,
            ..Header::new(command::READ_NOTIFY)
        };
        assert!(context.responses().deliver(ioid, &header, &[7]));
        assert!(deadline.is_cancelled());
        assert!(waiter.deadline().is_none());
        assert!(matches!(
            waiter.wait(Duration::ZERO),
            Some(Reply::Data { payload, .. }) if payload == [7]
        ));
        context.shutdown();
    }

    #[test]
    fn subscription_uses_configured_policy() {
        let context = Context::new(ContextConfig {
            monitor_policy: OverflowPolicy::Replace,
            ..quiet()
        })
        .unwrap();
        let (_, subscription) = context.subscribe();
        assert_eq!(subscription.events().policy(), OverflowPolicy::Replace);
        let (_, other) = context.subscribe_with(OverflowPolicy::DropOldest);
        assert_eq!(other.events().policy(), OverflowPolicy::DropOldest);
        assert_eq!(context.responses().len(), 2);
    }

    #[test]
    fn shutdown_cancels_and_refuses() {
        let context = Context::new(quiet()).unwrap();
        let (_, subscription) = context.subscribe();
        context.shutdown();
        context.shutdown();

        assert!(context.is_closed());
        assert!(context.responses().is_empty());
        assert_eq!(subscription.take_timeout(Duration::ZERO), Some(MonitorEvent::Cancelled));
        assert!(matches!(
            context.request(Duration::from_secs(1)),
            Err(ContextError::Closed)
        ));
        assert!(matches!(
            context.broadcast(&Message::echo()),
            Err(ContextError::Closed)
        ));
    }

    #[test]
    fn repeater_confirmation_over_udp() {
        let relay = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        relay.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        let answer = std::thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, from) = relay.recv_from(&mut buf).unwrap();
            let (header, _) = Header::decode(&buf[..n]).unwrap();
            assert_eq!(header.command, command::REPEATER_REGISTER);
            let confirm = Message::repeater_confirm(Ipv4Addr::LOCALHOST)
                .to_bytes(crate::protocol::MINOR_REVISION)
                .unwrap();
            relay.send_to(&confirm, from).unwrap();
        });

        let context = Context::new(ContextConfig {
            repeater_port: relay_port,
            repeater_registration: true,
            ..quiet()
        })
        .unwrap();
        answer.join().unwrap();
        for _ in 0..200 {
            if context.is_repeater_confirmed() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(context.is_repeater_confirmed());
    }
}
