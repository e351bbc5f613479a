//! Complete messages and the control messages the engine emits itself.
//!
//! Application payloads (DBR values) are opaque bytes here; only their
//! length and padding matter to the engine.

use std::net::Ipv4Addr;

use super::header::Header;
use super::status::Status;
use super::{MINOR_REVISION, ProtocolError, aligned_len, command};

/// Header plus owned payload.
///
/// The header's `payload_size` always equals the padded payload length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    header: Header,
    payload: Vec<u8>,
}

impl Message {
    /// Message without payload.
    #[must_use]
    pub fn new(header: Header) -> Self {
        Self::with_payload(header, Vec::new())
    }

    /// Message with `payload`; `payload_size` is set to its padded length.
    #[must_use]
    pub fn with_payload(mut header: Header, payload: Vec<u8>) -> Self {
        header.payload_size = aligned_len(payload.len()) as u32;
        Self { header, payload }
    }

    #[must_use]
    pub const fn header(&self) -> &Header {
        &self.header
    }

    /// Payload without padding.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub const fn command(&self) -> u16 {
        self.header.command
    }

    /// Bytes on the wire, padding included.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        self.header.encoded_len() + self.header.payload_size as usize
    }

    /// Appends header, payload and zero padding to `buf`.
    ///
    /// # Errors
    ///
    /// Fails without writing if the message needs the extended header and
    /// `peer_revision` cannot parse it.
    pub fn encode_into(&self, buf: &mut Vec<u8>, peer_revision: u16) -> Result<usize, ProtocolError> {
        let start = buf.len();
        self.header.encode_into(buf, peer_revision)?;
        buf.extend_from_slice(&self.payload);
        buf.resize(start + self.encoded_len(), 0);
        Ok(self.encoded_len())
    }

    /// Encodes into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`Message::encode_into`].
    pub fn to_bytes(&self, peer_revision: u16) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, peer_revision)?;
        Ok(buf)
    }

    /// Version handshake announcing connection priority and our revision.
    #[must_use]
    pub fn version(priority: u16) -> Self {
        Self::new(Header {
            data_type: priority,
            data_count: u32::from(MINOR_REVISION),
            ..Header::new(command::VERSION)
        })
    }

    /// Liveness probe; the peer answers with the same command.
    #[must_use]
    pub fn echo() -> Self {
        Self::new(Header::new(command::ECHO))
    }

    /// Asks the server to stop sending subscription updates.
    #[must_use]
    pub fn events_off() -> Self {
        Self::new(Header::new(command::EVENTS_OFF))
    }

    /// Asks the server to resume subscription updates.
    #[must_use]
    pub fn events_on() -> Self {
        Self::new(Header::new(command::EVENTS_ON))
    }

    /// Server beacon.
    ///
    /// `address` may be unspecified; the discovery relay fills in the
    /// sender's address before fanning the beacon out.
    #[must_use]
    pub fn beacon(sequence: u32, server_port: u16, address: Ipv4Addr) -> Self {
        Self::new(Header {
            data_type: MINOR_REVISION,
            data_count: u32::from(server_port),
            parameter1: sequence,
            parameter2: u32::from(address),
            ..Header::new(command::BEACON)
        })
    }

    /// Registration of a local client with the discovery relay.
    #[must_use]
    pub fn repeater_register(client: Ipv4Addr) -> Self {
        Self::new(Header {
            parameter2: u32::from(client),
            ..Header::new(command::REPEATER_REGISTER)
        })
    }

    /// Relay acknowledgement of a registration.
    #[must_use]
    pub fn repeater_confirm(client: Ipv4Addr) -> Self {
        Self::new(Header {
            parameter2: u32::from(client),
            ..Header::new(command::REPEATER_CONFIRM)
        })
    }

    /// Error report for a failed request, for a peer at `peer_revision`.
    ///
    /// The payload is the offending request's header followed by a
    /// NUL-terminated message.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::ExtendedHeaderUnsupported`] if `original` needs the
    /// extended form and the peer predates it.
    pub fn error(
        cid: u32,
        status: Status,
        original: &Header,
        text: &str,
        peer_revision: u16,
    ) -> Result<Self, ProtocolError> {
        let mut payload = Vec::with_capacity(original.encoded_len() + text.len() + 1);
        original.encode_into(&mut payload, peer_revision)?;
        payload.extend_from_slice(text.as_bytes());
        payload.push(0);
        Ok(Self::with_payload(
            Header {
                parameter1: cid,
                parameter2: status.status_code(),
                ..Header::new(command::ERROR)
            },
            payload,
        ))
    }
}

/// Parsed payload of an [`command::ERROR`] message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Header of the request that failed.
    pub original: Header,
    /// Remote status; `None` if the code is not in the table.
    pub status: Option<Status>,
    /// Channel id from `parameter1`.
    pub cid: u32,
    /// Text up to the first NUL.
    pub text: String,
}

impl ErrorReport {
    /// Parses an error message.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BufferTooSmall`] if the payload does not hold
    /// the embedded header.
    pub fn parse(header: &Header, payload: &[u8]) -> Result<Self, ProtocolError> {
        let (original, used) = Header::decode(payload)?;
        let rest = &payload[used..];
        let text_len = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());

        Ok(Self {
            original,
            status: Status::from_status_code(header.parameter2),
            cid: header.parameter1,
            text: String::from_utf8_lossy(&rest[..text_len]).into_owned(),
        })
    }

    /// Correlation id of the failed request, for commands that carry one.
    #[must_use]
    pub const fn ioid(&self) -> Option<u32> {
        match self.original.command {
            command::EVENT_ADD | command::READ_NOTIFY | command::WRITE_NOTIFY => {
                Some(self.original.parameter2)
            }
            _ => None,
        }
    }
}
