//! Message header codec.
//!
//! ```text
//! Standard (16 bytes):
//! ┌─────────┬──────────┬──────────┬──────────┬──────────────┬──────────────┐
//! │ cmd(2)  │ size(2)  │ dtype(2) │ count(2) │ param1(4)    │ param2(4)    │
//! └─────────┴──────────┴──────────┴──────────┴──────────────┴──────────────┘
//!
//! Extended (24 bytes): size = 0xFFFF, count = 0, then
//! ┌──────────────────┬──────────────────┐
//! │ payload size(4)  │ data count(4)    │
//! └──────────────────┴──────────────────┘
//! ```
//!
//! The extended form is chosen automatically when either the payload size or
//! the element count does not fit the 16-bit fields.

use super::{ProtocolError, WireReader, WireWriter};

/// Size of the standard header.
pub const HEADER_SIZE: usize = 16;

/// Size of the extended header.
pub const EXTENDED_HEADER_SIZE: usize = 24;

/// `payload_size` field value announcing the extended form.
pub const EXTENDED_MARKER: u16 = 0xFFFF;

/// Lowest peer minor revision that understands the extended form.
pub const EXTENDED_HEADER_MIN_REVISION: u16 = 9;

/// Decoded message header.
///
/// `payload_size` and `data_count` hold the real values whichever form was
/// used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub data_count: u32,
    pub parameter1: u32,
    pub parameter2: u32,
}

impl Header {
    /// Header for `command` with every other field zero.
    #[must_use]
    pub const fn new(command: u16) -> Self {
        Self {
            command,
            payload_size: 0,
            data_type: 0,
            data_count: 0,
            parameter1: 0,
            parameter2: 0,
        }
    }

    /// Whether this header needs the 24-byte form.
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.payload_size >= EXTENDED_MARKER as u32 || self.data_count >= EXTENDED_MARKER as u32
    }

    /// Number of bytes [`Header::encode_into`] will append.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        if self.is_extended() {
            EXTENDED_HEADER_SIZE
        } else {
            HEADER_SIZE
        }
    }

    /// Header length announced by the first four bytes of a header.
    ///
    /// Stream framing reads the standard header first and uses this to decide
    /// whether eight more bytes follow.
    #[must_use]
    pub fn wire_len(prefix: &[u8]) -> usize {
        match prefix.get(2..4) {
            Some(&[hi, lo]) if u16::from_be_bytes([hi, lo]) == EXTENDED_MARKER => {
                EXTENDED_HEADER_SIZE
            }
            _ => HEADER_SIZE,
        }
    }

    /// Appends the encoded header to `buf`.
    ///
    /// `peer_revision` is the minor revision negotiated with the receiving
    /// transport; it only matters when the extended form is needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ExtendedHeaderUnsupported`] if the extended
    /// form is required and `peer_revision` is below
    /// [`EXTENDED_HEADER_MIN_REVISION`]. Nothing is written in that case.
    pub fn encode_into(&self, buf: &mut Vec<u8>, peer_revision: u16) -> Result<usize, ProtocolError> {
        let extended = self.is_extended();
        if extended && peer_revision < EXTENDED_HEADER_MIN_REVISION {
            return Err(ProtocolError::ExtendedHeaderUnsupported {
                revision: peer_revision,
            });
        }

        let mut w = WireWriter::new(buf);
        w.put_u16(self.command);
        if extended {
            w.put_u16(EXTENDED_MARKER);
            w.put_u16(self.data_type);
            w.put_u16(0);
        } else {
            w.put_u16(self.payload_size as u16);
            w.put_u16(self.data_type);
            w.put_u16(self.data_count as u16);
        }
        w.put_u32(self.parameter1);
        w.put_u32(self.parameter2);
        if extended {
            w.put_u32(self.payload_size);
            w.put_u32(self.data_count);
        }

        Ok(self.encoded_len())
    }

    /// Decodes a header from the front of `bytes`.
    ///
    /// Returns the header and the number of bytes it occupied (16 or 24).
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] if `bytes` is shorter than
    /// the header form it announces.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), ProtocolError> {
        let mut r = WireReader::new(bytes);

        let command = r.take_u16()?;
        let short_size = r.take_u16()?;
        let data_type = r.take_u16()?;
        let short_count = r.take_u16()?;
        let parameter1 = r.take_u32()?;
        let parameter2 = r.take_u32()?;

        let (payload_size, data_count) = if short_size == EXTENDED_MARKER {
            (r.take_u32()?, r.take_u32()?)
        } else {
            (u32::from(short_size), u32::from(short_count))
        };

        let header = Self {
            command,
            payload_size,
            data_type,
            data_count,
            parameter1,
            parameter2,
        };
        Ok((header, r.position()))
    }
}
