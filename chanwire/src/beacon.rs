//! Server presence beacons.
//!
//! Servers announce themselves with periodic `BEACON` datagrams
//! ([`BeaconEmitter`]). Clients feed every received beacon through a
//! per-server [`BeaconHandler`]; the [`BeaconMonitor`] turns the verdicts
//! into transport notifications:
//!
//! ```text
//!   BEACON ──► BeaconMonitor ──► BeaconHandler[server]
//!                                  │
//!                 Arrival ─────────┼──► transport.beacon_arrival()   (every priority)
//!                 Anomaly ─────────┼──► anomaly listener
//!                 Anomaly{reset} ──┴──► transport.beacon_anomaly()   → transport_changed
//! ```

pub mod emitter;
pub mod handler;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::dispatch::ResponseHandler;
use crate::protocol::{DEFAULT_SERVER_PORT, Header};
use crate::trace::{debug, trace};
use crate::transport::{Transport, TransportRegistry};

pub use emitter::BeaconEmitter;
pub use handler::{BeaconEvent, BeaconHandler};

/// Lookup of the transports connected to one server.
pub trait TransportLookup: Send + Sync {
    fn transports_for(&self, address: SocketAddr) -> Vec<Arc<dyn Transport>>;
}

impl<T: Transport + 'static> TransportLookup for TransportRegistry<T> {
    fn transports_for(&self, address: SocketAddr) -> Vec<Arc<dyn Transport>> {
        self.get_all(address)
            .into_iter()
            .map(|transport| transport as Arc<dyn Transport>)
            .collect()
    }
}

type AnomalyListener = Box<dyn Fn(SocketAddr) + Send + Sync>;

/// Beacon statistics for every server heard from.
pub struct BeaconMonitor {
    handlers: Mutex<HashMap<SocketAddr, BeaconHandler>>,
    start: minstant::Instant,
    default_port: u16,
    transports: Option<Weak<dyn TransportLookup>>,
    on_anomaly: Option<AnomalyListener>,
}

impl BeaconMonitor {
    /// Monitor that notifies the transports found in `transports`.
    #[must_use]
    pub fn new(default_port: u16, transports: Weak<dyn TransportLookup>) -> Self {
        Self {
            transports: Some(transports),
            default_port,
            ..Self::detached()
        }
    }

    /// Monitor that only classifies.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            start: minstant::Instant::now(),
            default_port: DEFAULT_SERVER_PORT,
            transports: None,
            on_anomaly: None,
        }
    }

    /// Called with the server address on every anomaly, resets included.
    #[must_use]
    pub fn with_anomaly_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(SocketAddr) + Send + Sync + 'static,
    {
        self.on_anomaly = Some(Box::new(listener));
        self
    }

    /// Classifies a beacon from `server`.
    pub fn beacon_arrived(&self, server: SocketAddr, revision: u16, sequence: u32) -> BeaconEvent {
        let now = self.start.elapsed();
        let (event, first) = {
            let mut handlers = self.handlers.lock();
            let handler = handlers.entry(server).or_default();
            let first = !handler.has_heard();
            (handler.notify(revision, now, sequence), first)
        };

        match event {
            BeaconEvent::Arrival => {
                trace!(%server, sequence, "beacon");
                for transport in self.transports_for(server) {
                    transport.beacon_arrival();
                }
            }
            BeaconEvent::Anomaly { reset } => {
                debug!(%server, sequence, reset, "beacon anomaly");
                if let Some(listener) = &self.on_anomaly {
                    listener(server);
                }
                if reset {
                    for transport in self.transports_for(server) {
                        transport.beacon_anomaly();
                    }
                } else if first {
                    // A newly heard server is alive as well.
                    for transport in self.transports_for(server) {
                        transport.beacon_arrival();
                    }
                }
            }
            BeaconEvent::Discarded => {
                trace!(%server, sequence, "beacon discarded");
            }
        }
        event
    }

    /// Number of servers heard from.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Server address carried by a beacon received from `from`.
    fn server_address(&self, from: SocketAddr, header: &Header) -> SocketAddr {
        let port = match u16::try_from(header.data_count) {
            Ok(0) | Err(_) => self.default_port,
            Ok(port) => port,
        };
        let ip = match header.parameter2 {
            0 => from.ip(),
            raw => IpAddr::V4(Ipv4Addr::from(raw)),
        };
        SocketAddr::new(ip, port)
    }

    fn transports_for(&self, server: SocketAddr) -> Vec<Arc<dyn Transport>> {
        self.transports
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|lookup| lookup.transports_for(server))
            .unwrap_or_default()
    }
}

impl ResponseHandler for BeaconMonitor {
    fn handle_response(&self, from: SocketAddr, _: &dyn Transport, header: &Header, _: &[u8]) {
        let server = self.server_address(from, header);
        self.beacon_arrived(server, header.data_type, header.parameter1);
    }
}
