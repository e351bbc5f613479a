//! Reassembly of messages from a byte stream.
//!
//! TCP delivers arbitrary slices of the message sequence. The assembler
//! keeps whatever part of the current message it has seen and hands out a
//! message only once its header and its full payload are present:
//!
//! ```text
//!   ┌─────────────┐ 16 bytes, marker? ┌──────────────┐ payload_size ┌─────────┐
//!   │ header (16) │ ────────────────► │ ext. (+8)    │ ───────────► │ payload │ ─► deliver
//!   └─────────────┘                   └──────────────┘              └─────────┘
//! ```
//!
//! Payloads that arrive whole inside one pushed slice are delivered without
//! copying.

use thiserror::Error;

use crate::protocol::{Header, ProtocolError};

/// Stream framing failures. Both are fatal for the connection.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Incremental message framer for one connection.
#[derive(Debug)]
pub struct FrameAssembler {
    max_payload: usize,
    pending: Vec<u8>,
    header: Option<Header>,
}

impl FrameAssembler {
    #[must_use]
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            pending: Vec::new(),
            header: None,
        }
    }

    #[must_use]
    pub const fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Feeds received bytes, calling `deliver` for every message they
    /// complete. Returns the number of messages delivered.
    ///
    /// # Errors
    ///
    /// [`FramingError::PayloadTooLarge`] when a header announces more than
    /// the configured maximum. The assembler is reset; the connection should
    /// be closed since its byte stream can no longer be trusted.
    pub fn push<F>(&mut self, mut data: &[u8], mut deliver: F) -> Result<usize, FramingError>
    where
        F: FnMut(&Header, &[u8]),
    {
        let mut delivered = 0;

        loop {
            match self.header {
                None => {
                    let want = Header::wire_len(&self.pending);
                    if self.pending.len() < want {
                        if data.is_empty() {
                            break;
                        }
                        let take = (want - self.pending.len()).min(data.len());
                        self.pending.extend_from_slice(&data[..take]);
                        data = &data[take..];
                        continue;
                    }

                    let (header, _) = Header::decode(&self.pending)?;
                    let size = header.payload_size as usize;
                    if size > self.max_payload {
                        self.reset();
                        return Err(FramingError::PayloadTooLarge {
                            size,
                            max: self.max_payload,
                        });
                    }
                    self.pending.clear();
                    self.header = Some(header);
                }
                Some(header) => {
                    let size = header.payload_size as usize;
                    if self.pending.is_empty() && data.len() >= size {
                        deliver(&header, &data[..size]);
                        data = &data[size..];
                    } else if self.pending.len() < size {
                        if data.is_empty() {
                            break;
                        }
                        let take = (size - self.pending.len()).min(data.len());
                        self.pending.extend_from_slice(&data[..take]);
                        data = &data[take..];
                        continue;
                    } else {
                        deliver(&header, &self.pending);
                        self.pending.clear();
                    }
                    self.header = None;
                    delivered += 1;
                }
            }
        }

        Ok(delivered)
    }

    /// True when no partial message is buffered.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.header.is_none() && self.pending.is_empty()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.header = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MINOR_REVISION, Message, command};

    fn collect(assembler: &mut FrameAssembler, data: &[u8]) -> Vec<(u16, Vec<u8>)> {
        let mut out = Vec::new();
        assembler
            .push(data, |h, p| out.push((h.command, p.to_vec())))
            .unwrap();
        out
    }

    fn read_notify(payload: &[u8]) -> Vec<u8> {
        let mut header = Header::new(command::READ_NOTIFY);
        header.parameter2 = 7;
        Message::with_payload(header, payload.to_vec())
            .to_bytes(MINOR_REVISION)
            .unwrap()
    }

    #[test]
    fn byte_at_a_time() {
        let bytes = read_notify(b"value");
        let mut assembler = FrameAssembler::new(1024);

        let mut got = Vec::new();
        for b in &bytes {
            got.extend(collect(&mut assembler, std::slice::from_ref(b)));
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, command::READ_NOTIFY);
        assert_eq!(&got[0].1[..5], b"value");
        assert_eq!(got[0].1.len(), 8);
        assert!(assembler.is_idle());
    }

    #[test]
    fn several_messages_in_one_read() {
        let mut bytes = Message::echo().to_bytes(MINOR_REVISION).unwrap();
        bytes.extend(read_notify(&[1; 20]));
        bytes.extend(Message::echo().to_bytes(MINOR_REVISION).unwrap());

        let mut assembler = FrameAssembler::new(1024);
        let got = collect(&mut assembler, &bytes);
        let commands: Vec<u16> = got.iter().map(|(c, _)| *c).collect();
        assert_eq!(commands, [command::ECHO, command::READ_NOTIFY, command::ECHO]);
        assert_eq!(got[1].1.len(), 24);
    }

    #[test]
    fn split_inside_payload_keeps_remainder() {
        let bytes = read_notify(&[9; 32]);
        let mut assembler = FrameAssembler::new(1024);

        assert!(collect(&mut assembler, &bytes[..20]).is_empty());
        assert!(!assembler.is_idle());
        let got = collect(&mut assembler, &bytes[20..]);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, vec![9; 32]);
    }

    #[test]
    fn extended_header_across_reads() {
        let mut header = Header::new(command::READ_NOTIFY);
        header.data_count = 0x1_0000;
        let bytes = Message::with_payload(header, vec![0; 16])
            .to_bytes(MINOR_REVISION)
            .unwrap();
        assert_eq!(bytes.len(), 24 + 16);

        let mut assembler = FrameAssembler::new(1024);
        assert!(collect(&mut assembler, &bytes[..16]).is_empty());
        assert!(collect(&mut assembler, &bytes[16..30]).is_empty());
        let got = collect(&mut assembler, &bytes[30..]);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let bytes = read_notify(&[0; 64]);
        let mut assembler = FrameAssembler::new(32);

        let err = assembler.push(&bytes, |_, _| panic!("must not deliver")).unwrap_err();
        assert!(matches!(
            err,
            FramingError::PayloadTooLarge { size: 64, max: 32 }
        ));
        assert!(assembler.is_idle());
    }
}
