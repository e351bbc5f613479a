//! Channel Access style protocol engine.
//!
//! The crate provides the machinery beneath a process-variable client or
//! server: the binary message codec, stream and datagram transports, a
//! reactor driven by a leader/followers thread pool, request/response
//! correlation, beacon based liveness, and a discovery relay.
//!
//! ```text
//!   Context
//!    ├─ runtime    Reactor · LeaderFollowers · Timer
//!    ├─ transport  StreamTransport (TCP) · DatagramTransport (UDP) · registry
//!    ├─ dispatch   command → handler
//!    ├─ response   Ioid → pending request
//!    └─ beacon     emitter · per-server classifier
//! ```
//!
//! Start with [`Context::new`]; every tunable is in [`ContextConfig`].

pub mod beacon;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod net;
pub mod protocol;
pub mod repeater;
pub mod response;
pub mod runtime;
pub mod sync;
pub mod transport;

mod trace;

pub use config::ContextConfig;
pub use context::{Context, ContextError};
pub use protocol::{Header, Message, Status};
pub use trace::init_tracing;
