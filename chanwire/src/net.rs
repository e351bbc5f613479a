//! Socket setup shared by the transports and the discovery relay.
//!
//! Everything is mio-based and non-blocking once handed out; socket options
//! mio does not expose go through rustix.

pub mod socket;
pub mod tcp;

pub use socket::UdpSocket;
