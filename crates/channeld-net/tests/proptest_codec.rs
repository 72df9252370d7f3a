//! Property tests for packet framing
//!
//! These check that the stream decoder reassembles packets regardless of how
//! the bytes are split across reads, and that it survives arbitrary input.

use channeld_net::compression::CompressionConfig;
use channeld_net::framing::{FrameDecoder, MAGIC, encode_packet};
use channeld_net::protocol::{CompressionType, MessagePack, Packet};
use proptest::prelude::*;

fn arb_message(max_body: usize) -> impl Strategy<Value = MessagePack> {
    (
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        prop::collection::vec(any::<u8>(), 0..max_body),
    )
        .prop_map(|(channel_id, broadcast, stub_id, msg_type, msg_body)| MessagePack {
            channel_id,
            broadcast,
            stub_id,
            msg_type,
            msg_body,
        })
}

fn arb_compression() -> impl Strategy<Value = CompressionType> {
    prop_oneof![
        Just(CompressionType::NoCompression),
        Just(CompressionType::Lz4),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: arbitrary bytes never panic the decoder
    #[test]
    fn arbitrary_bytes_dont_crash_decoder(
        random_bytes in prop::collection::vec(any::<u8>(), 0..4000),
    ) {
        let mut decoder = FrameDecoder::default();
        let _messages = decoder.decode(&random_bytes);
        // No panic = success
    }

    /// Property: a batch survives framing when fed in arbitrary chunk sizes
    #[test]
    fn chunked_batches_roundtrip(
        messages in prop::collection::vec(arb_message(600), 1..16),
        chunk in 1usize..512,
        mode in arb_compression(),
    ) {
        let packet = Packet { messages: messages.clone() };
        let bytes = encode_packet(&packet, mode, &CompressionConfig::default()).unwrap();

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(chunk) {
            decoded.extend(decoder.decode(piece));
        }

        prop_assert_eq!(decoded, messages);
        prop_assert_eq!(decoder.buffered_len(), 0);
    }

    /// Property: leading garbage without a magic byte is skipped
    #[test]
    fn garbage_prefix_is_skipped(
        garbage in prop::collection::vec(any::<u8>().prop_filter("not magic", |b| *b != MAGIC[0]), 1..64),
        message in arb_message(300),
    ) {
        let packet = Packet { messages: vec![message.clone()] };
        let mut bytes = garbage;
        bytes.extend(encode_packet(&packet, CompressionType::NoCompression, &CompressionConfig::default()).unwrap());

        let mut decoder = FrameDecoder::default();
        prop_assert_eq!(decoder.decode(&bytes), vec![message]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Property: large bodies use the three-byte size header and still roundtrip
    #[test]
    fn large_packets_roundtrip(
        message in arb_message(70_000),
        mode in arb_compression(),
    ) {
        let packet = Packet { messages: vec![message.clone()] };
        let bytes = encode_packet(&packet, mode, &CompressionConfig::default()).unwrap();

        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for piece in bytes.chunks(4096) {
            decoded.extend(decoder.decode(piece));
        }
        prop_assert_eq!(decoded, vec![message]);
    }
}
