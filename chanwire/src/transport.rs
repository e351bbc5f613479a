//! Byte transports carrying protocol messages.
//!
//! Two variants share the [`Transport`] contract:
//!
//! ```text
//!                 ┌────────────────────┐
//!   submit() ───► │ StreamTransport    │ ──► TCP, one per (server, priority)
//!                 │  send queue        │
//!                 │  FrameAssembler    │ ◄── partial reads
//!                 │  liveness watchdog │
//!                 └────────────────────┘
//!                 ┌────────────────────┐
//!   submit() ───► │ DatagramTransport  │ ──► UDP, broadcast list
//!   send_to() ──► │  ignore list       │ ◄── packed datagrams
//!                 └────────────────────┘
//! ```
//!
//! Inbound messages from either variant go to a
//! [`ResponseHandler`](crate::dispatch::ResponseHandler), normally the
//! context's [`DispatchTable`](crate::dispatch::DispatchTable).

pub mod connector;
pub mod datagram;
pub mod framing;
pub mod liveness;
pub mod registry;
pub mod stream;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::{Message, ProtocolError, SEND_IMMEDIATELY_PRIORITY};
use crate::runtime::ReactorError;

pub use connector::Connector;
pub use datagram::DatagramTransport;
pub use framing::{FrameAssembler, FramingError};
pub use liveness::Liveness;
pub use registry::TransportRegistry;
pub use stream::{StreamOptions, StreamTransport};

/// Default send threshold: queued bytes that trigger a flush.
pub const SEND_THRESHOLD: usize = 16 * 1024;

/// Transport kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Stream,
    Datagram,
}

/// How urgently a submitted message goes out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SendPriority {
    /// Queued and written on the next flush.
    #[default]
    Normal,
    /// Written synchronously, ahead of queued messages.
    Immediate,
}

impl SendPriority {
    /// Maps a numeric submit priority onto the two send paths.
    #[must_use]
    pub const fn from_level(level: u16) -> Self {
        if level >= SEND_IMMEDIATELY_PRIORITY {
            Self::Immediate
        } else {
            Self::Normal
        }
    }
}

/// Transport failures reported to callers.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("I/O error on transport to {remote}: {source}")]
    Io {
        remote: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("transport to {0} is closed")]
    Closed(SocketAddr),
    #[error(transparent)]
    Reactor(#[from] ReactorError),
    #[error("failed to connect to {remote} after {attempts} attempts: {source}")]
    Connect {
        remote: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("timed out waiting for the connection lock on {0}")]
    LockTimeout(SocketAddr),
}

/// A bidirectional message carrier.
pub trait Transport: Send + Sync {
    /// Encodes `message` for this peer's revision and sends or queues it.
    ///
    /// # Errors
    ///
    /// [`TransportError::Protocol`] when the message cannot be encoded for
    /// the peer, [`TransportError::Io`] when a synchronous write fails,
    /// [`TransportError::Closed`] after [`Transport::close`].
    fn submit(&self, message: &Message, priority: SendPriority) -> Result<(), TransportError>;

    /// Writes queued bytes. Returns `false` if some remain queued.
    fn flush(&self) -> bool;

    fn remote_address(&self) -> SocketAddr;

    /// Minor revision negotiated with the peer.
    fn minor_revision(&self) -> u16;

    fn set_minor_revision(&self, _revision: u16) {}

    fn priority(&self) -> u16;

    fn protocol(&self) -> Protocol;

    /// Closes the transport. `forced` skips the final flush.
    fn close(&self, forced: bool);

    fn is_closed(&self) -> bool;

    /// A beacon from this transport's server arrived.
    fn beacon_arrival(&self) {}

    /// The server's beacon pattern changed (restart or network change).
    fn beacon_anomaly(&self) {}

    /// An echo reply arrived.
    fn echo_received(&self) {}
}

/// Something using a transport, told about its state changes.
pub trait TransportClient: Send + Sync {
    fn transport_closed(&self, transport: &dyn Transport);

    fn transport_unresponsive(&self, _transport: &dyn Transport) {}

    fn transport_responsive(&self, _transport: &dyn Transport) {}

    /// The peer may have restarted; cached state should be revalidated.
    fn transport_changed(&self, _transport: &dyn Transport) {}
}
