//! Outbound stream connections, one per `(server, priority)`.
//!
//! ```text
//!   connect(client, addr, prio)
//!     ├─ registry hit and acquire ok?  → reuse
//!     ├─ named lock on addr (bounded)
//!     ├─ registry hit again?           → reuse
//!     ├─ TCP connect (retries), NODELAY + keep-alive
//!     ├─ store in registry
//!     ├─ register with the pool's reactor for READ
//!     ├─ send VERSION
//!     └─ closed meanwhile?             → drop the entry, fail
//! ```
//!
//! Two threads connecting to the same server serialize on the address lock,
//! so the second one finds the first one's transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::registry::TransportRegistry;
use super::stream::{StreamOptions, StreamTransport};
use super::{SendPriority, Transport, TransportClient, TransportError};
use crate::dispatch::ResponseHandler;
use crate::net;
use crate::protocol::Message;
use crate::runtime::{LeaderFollowers, Timer};
use crate::sync::NamedLock;
use crate::trace::{debug, info};

/// Connection attempts per [`Connector::connect`].
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Pause between connection attempts.
pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Timeouts and per-connection defaults for the connector.
#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub lock_timeout: Duration,
    pub connect_timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
    /// Template for new transports; `priority` is overridden per call.
    pub stream: StreamOptions,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(5),
            attempts: CONNECT_ATTEMPTS,
            retry_delay: CONNECT_RETRY_DELAY,
            stream: StreamOptions::default(),
        }
    }
}

/// Creates and caches stream transports.
pub struct Connector {
    pool: Arc<LeaderFollowers>,
    timer: Arc<Timer>,
    registry: Arc<TransportRegistry<StreamTransport>>,
    handler: Arc<dyn ResponseHandler>,
    locks: NamedLock<SocketAddr>,
    options: ConnectorOptions,
}

impl Connector {
    #[must_use]
    pub fn new(
        pool: Arc<LeaderFollowers>,
        timer: Arc<Timer>,
        registry: Arc<TransportRegistry<StreamTransport>>,
        handler: Arc<dyn ResponseHandler>,
        options: ConnectorOptions,
    ) -> Self {
        Self {
            pool,
            timer,
            registry,
            handler,
            locks: NamedLock::new(),
            options,
        }
    }

    /// Returns a transport to `address` at `priority` with `client` acquired
    /// on it, connecting if none exists.
    ///
    /// # Errors
    ///
    /// [`TransportError::LockTimeout`] if another connect to the same
    /// address holds the lock too long, [`TransportError::Connect`] when every
    /// attempt fails, [`TransportError::Reactor`] if the socket cannot be
    /// registered.
    pub fn connect(
        &self,
        client: Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Result<Arc<StreamTransport>, TransportError> {
        if let Some(transport) = self.reuse(&client, address, priority) {
            return Ok(transport);
        }

        let Some(_guard) = self.locks.lock(address, self.options.lock_timeout) else {
            return Err(TransportError::LockTimeout(address));
        };

        if let Some(transport) = self.reuse(&client, address, priority) {
            return Ok(transport);
        }

        debug!(remote = %address, priority, "connecting");
        let stream = net::tcp::connect(
            address,
            self.options.attempts,
            self.options.retry_delay,
            self.options.connect_timeout,
        )
        .map_err(|source| TransportError::Connect {
            remote: address,
            attempts: self.options.attempts.max(1),
            source,
        })?;

        let options = StreamOptions {
            priority,
            ..self.options.stream.clone()
        };
        let transport = StreamTransport::new(
            stream,
            address,
            options,
            Arc::clone(&self.handler),
            Arc::clone(&self.timer),
            Arc::downgrade(&self.registry),
        );
        transport.acquire(client);
        self.install(&transport, priority)?;
        info!(remote = %address, priority, "stream transport connected");
        Ok(transport)
    }

    /// Stores `transport`, arms it on the reactor and sends the version
    /// handshake. The entry goes in before the socket is armed, so a close
    /// from the read path always finds and removes it.
    fn install(
        &self,
        transport: &Arc<StreamTransport>,
        priority: u16,
    ) -> Result<(), TransportError> {
        self.registry.put(Arc::clone(transport));

        let installed = transport.attach(&self.pool).map(|_| ()).and_then(|()| {
            transport.submit(&Message::version(priority), SendPriority::Normal)
        });
        if let Err(e) = installed {
            transport.close(true);
            self.registry.remove_transport(transport);
            return Err(e);
        }
        transport.flush();

        if transport.is_closed() {
            self.registry.remove_transport(transport);
            debug!(remote = %transport.remote_address(), "transport closed during setup");
            return Err(TransportError::Closed(transport.remote_address()));
        }
        Ok(())
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TransportRegistry<StreamTransport>> {
        &self.registry
    }

    fn reuse(
        &self,
        client: &Arc<dyn TransportClient>,
        address: SocketAddr,
        priority: u16,
    ) -> Option<Arc<StreamTransport>> {
        let transport = self.registry.get(address, priority)?;
        if transport.acquire(Arc::clone(client)) {
            debug!(remote = %address, priority, "reusing stream transport");
            Some(transport)
        } else {
            None
        }
    }
}
