//! Property tests for the message codec and stream framing.

use proptest::prelude::*;

use chanwire::protocol::header::{EXTENDED_HEADER_MIN_REVISION, EXTENDED_MARKER};
use chanwire::protocol::{
    ALIGNMENT, EXTENDED_HEADER_SIZE, HEADER_SIZE, Header, MINOR_REVISION, Message, ProtocolError,
    aligned_len,
};
use chanwire::transport::FrameAssembler;

/// Sizes and counts clustered around the standard/extended boundary.
fn boundary_u32() -> impl Strategy<Value = u32> {
    prop_oneof![
        0u32..64,
        0xFFF0u32..0x1_0010,
        any::<u32>(),
    ]
}

fn header() -> impl Strategy<Value = Header> {
    (
        any::<u16>(),
        boundary_u32(),
        any::<u16>(),
        boundary_u32(),
        any::<u32>(),
        any::<u32>(),
    )
        .prop_map(
            |(command, payload_size, data_type, data_count, parameter1, parameter2)| Header {
                command,
                payload_size,
                data_type,
                data_count,
                parameter1,
                parameter2,
            },
        )
}

fn message() -> impl Strategy<Value = Message> {
    (0u16..28, any::<u16>(), 0u32..70_000, any::<u32>(), proptest::collection::vec(any::<u8>(), 0..64))
        .prop_map(|(command, data_type, data_count, parameter2, payload)| {
            Message::with_payload(
                Header {
                    command,
                    data_type,
                    data_count,
                    parameter2,
                    ..Header::default()
                },
                payload,
            )
        })
}

proptest! {
    #[test]
    fn header_decodes_to_what_was_encoded(header in header()) {
        let mut buf = Vec::new();
        let written = header.encode_into(&mut buf, MINOR_REVISION).unwrap();
        prop_assert_eq!(written, buf.len());

        let extended = header.payload_size >= u32::from(EXTENDED_MARKER)
            || header.data_count >= u32::from(EXTENDED_MARKER);
        prop_assert_eq!(written, if extended { EXTENDED_HEADER_SIZE } else { HEADER_SIZE });
        prop_assert_eq!(Header::wire_len(&buf), written);

        let (decoded, used) = Header::decode(&buf).unwrap();
        prop_assert_eq!(used, written);
        prop_assert_eq!(decoded, header);
    }

    #[test]
    fn old_peers_never_see_extended_headers(header in header()) {
        let mut buf = Vec::new();
        let result = header.encode_into(&mut buf, EXTENDED_HEADER_MIN_REVISION - 1);
        if header.is_extended() {
            let refused = matches!(result, Err(ProtocolError::ExtendedHeaderUnsupported { .. }));
            prop_assert!(refused);
            prop_assert!(buf.is_empty());
        } else {
            prop_assert_eq!(result.unwrap(), HEADER_SIZE);
        }
    }

    #[test]
    fn alignment_is_minimal(len in 0usize..1_000_000) {
        let aligned = aligned_len(len);
        prop_assert_eq!(aligned % ALIGNMENT, 0);
        prop_assert!(aligned >= len);
        prop_assert!(aligned - len < ALIGNMENT);
    }

    #[test]
    fn encoded_messages_are_aligned(message in message()) {
        let bytes = message.to_bytes(MINOR_REVISION).unwrap();
        prop_assert_eq!(bytes.len() % ALIGNMENT, 0);
        prop_assert_eq!(bytes.len(), message.encoded_len());
    }

    #[test]
    fn framing_survives_any_split(
        messages in proptest::collection::vec(message(), 1..8),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let mut stream = Vec::new();
        for message in &messages {
            message.encode_into(&mut stream, MINOR_REVISION).unwrap();
        }

        let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len() + 1)).collect();
        points.push(0);
        points.push(stream.len());
        points.sort_unstable();
        points.dedup();

        let mut assembler = FrameAssembler::new(1 << 20);
        let mut received = Vec::new();
        for window in points.windows(2) {
            assembler
                .push(&stream[window[0]..window[1]], |header, payload| {
                    received.push((*header, payload.to_vec()));
                })
                .unwrap();
        }

        prop_assert!(assembler.is_idle());
        prop_assert_eq!(received.len(), messages.len());
        for ((header, payload), message) in received.iter().zip(&messages) {
            prop_assert_eq!(header, message.header());
            prop_assert_eq!(&payload[..message.payload().len()], message.payload());
            prop_assert!(payload[message.payload().len()..].iter().all(|&b| b == 0));
        }
    }
}
