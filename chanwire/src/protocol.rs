//! Channel Access wire protocol: message framing, command ids, status codes.
//!
//! # Wire Format
//!
//! Every message is a fixed header followed by a payload. All integers are
//! big-endian (network byte order). The payload is zero-padded so that the
//! encoded message length is a multiple of [`ALIGNMENT`]; this lets several
//! messages be packed back-to-back into one datagram and parsed again with
//! [`for_each_message`].
//!
//! ```text
//! ┌──────────────────────┬───────────────────────────┬─────────┐
//! │ Header (16 or 24)    │ Payload (payload_size)    │ Pad → 8 │
//! └──────────────────────┴───────────────────────────┴─────────┘
//! ```
//!
//! See [`header`] for the header layouts and [`command`] for the command
//! table. Protocol-level error codes live in [`status`].
//!
//! # Revisions and Ports
//!
//! Ports are conventional offsets from the major revision:
//! `server = PORT_BASE + 2 * MAJOR`, `repeater = server + 1`. Peers
//! negotiate a minor revision on connect; the extended header requires
//! [`header::EXTENDED_HEADER_MIN_REVISION`], beacon sequence ids require
//! [`BEACON_SEQUENCE_MIN_REVISION`].

pub mod command;
pub mod header;
pub mod message;
pub mod status;

use std::time::Duration;

use thiserror::Error;

use crate::trace::warn;

pub use header::{EXTENDED_HEADER_SIZE, HEADER_SIZE, Header};
pub use message::Message;
pub use status::{Disposition, Severity, Status};

/// Protocol major revision.
pub const MAJOR_REVISION: u16 = 4;

/// Protocol minor revision spoken by this engine.
pub const MINOR_REVISION: u16 = 13;

/// Base for the conventional port numbers.
pub const PORT_BASE: u16 = 5056;

/// Default server (search and TCP) port.
pub const DEFAULT_SERVER_PORT: u16 = PORT_BASE + 2 * MAJOR_REVISION;

/// Default discovery relay (repeater) port.
pub const DEFAULT_REPEATER_PORT: u16 = DEFAULT_SERVER_PORT + 1;

/// Largest datagram this engine sends.
pub const MAX_UDP_SEND: usize = 1024;

/// Largest datagram this engine accepts.
pub const MAX_UDP_RECV: usize = 0xFFFF + 16;

/// Receive buffer size for stream transports.
pub const MAX_TCP_RECV: usize = 16 * 1024 + EXTENDED_HEADER_SIZE;

/// First minor revision that answers echo probes.
pub const ECHO_MIN_REVISION: u16 = 3;

/// First minor revision whose beacons carry a sequence id.
pub const BEACON_SEQUENCE_MIN_REVISION: u16 = 10;

/// Wait for an echo reply before a connection counts as unresponsive.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection priority used when the caller has no preference.
pub const DEFAULT_PRIORITY: u16 = 0;

/// Highest connection priority a client may request.
pub const MAX_PRIORITY: u16 = 99;

/// Submit priority at or above which a message skips the send queue.
pub const SEND_IMMEDIATELY_PRIORITY: u16 = 100;

/// Message padding boundary.
pub const ALIGNMENT: usize = 8;

/// Errors during header/message encode and decode.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small to decode a header.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// The message needs the extended header but the peer cannot parse it.
    #[error("extended header requires minor revision 9, peer speaks {revision}")]
    ExtendedHeaderUnsupported { revision: u16 },
    /// Payload length is larger than the receiver accepts.
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    /// Payload is shorter than the message kind requires.
    #[error("truncated payload for command {command}: {len} bytes")]
    TruncatedPayload { command: u16, len: usize },
}

/// Rounds `len` up to the next multiple of [`ALIGNMENT`].
#[inline]
#[must_use]
pub const fn aligned_len(len: usize) -> usize {
    len.div_ceil(ALIGNMENT) * ALIGNMENT
}

/// Pads `buf` with zero bytes up to the next multiple of [`ALIGNMENT`].
pub fn align(buf: &mut Vec<u8>) {
    buf.resize(aligned_len(buf.len()), 0);
}

/// Walks the messages packed into one datagram.
///
/// Calls `f` once per complete message, in order, and returns how many were
/// delivered. Iteration stops when fewer than [`HEADER_SIZE`] bytes remain,
/// or at the first header that cannot be decoded or whose payload runs past
/// the end of the packet; the rest of the packet is discarded.
pub fn for_each_message<F>(packet: &[u8], mut f: F) -> usize
where
    F: FnMut(&Header, &[u8]),
{
    let mut rest = packet;
    let mut delivered = 0;

    while rest.len() >= HEADER_SIZE {
        let (header, header_len) = match Header::decode(rest) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, remaining = rest.len(), "discarding malformed datagram tail");
                break;
            }
        };

        let payload_len = header.payload_size as usize;
        let Some(end) = header_len.checked_add(payload_len).filter(|&end| end <= rest.len())
        else {
            warn!(
                command = header.command,
                payload_len,
                remaining = rest.len() - header_len,
                "discarding truncated message"
            );
            break;
        };

        f(&header, &rest[header_len..end]);
        delivered += 1;
        rest = &rest[end..];
    }

    delivered
}

/// Big-endian writer appending to a caller-owned buffer.
pub(crate) struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> WireWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>) -> Self {
        Self { buf }
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// Big-endian reader over a borrowed slice.
pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub(crate) const fn position(&self) -> usize {
        self.cursor
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.remaining() < N {
            return Err(ProtocolError::BufferTooSmall {
                need: self.cursor + N,
                have: self.buf.len(),
            });
        }
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    pub(crate) fn take_u16(&mut self) -> Result<u16, ProtocolError> {
        self.take::<2>().map(u16::from_be_bytes)
    }

    pub(crate) fn take_u32(&mut self) -> Result<u32, ProtocolError> {
        self.take::<4>().map(u32::from_be_bytes)
    }
}
