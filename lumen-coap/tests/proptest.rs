use lumen_coap::option::OptionSet;
use lumen_coap::{BlockOpt, Code, Message, MsgId, MsgType, Token, decode, encode_vec};
use proptest::prelude::*;

proptest! {
    #[test]
    fn test_message_roundtrip(
        type_bits in 0u8..4,
        code_class in prop_oneof![Just(0u8), Just(2u8), Just(4u8), Just(5u8)],
        code_detail in 1u8..32,
        msg_id in any::<u16>(),
        token in prop::collection::vec(any::<u8>(), 0..=8),
        raw_options in prop::collection::vec((1u16..1000, prop::collection::vec(any::<u8>(), 0..300)), 0..8),
        payload in prop::collection::vec(any::<u8>(), 0..1200),
    ) {
        let msg_type = match type_bits {
            0 => MsgType::Confirmable,
            1 => MsgType::NonConfirmable,
            2 => MsgType::Acknowledgement,
            _ => MsgType::Reset,
        };
        let mut msg = Message::new(
            msg_type,
            Code::new(code_class, code_detail),
            MsgId(msg_id),
            Token::from_slice(&token).unwrap(),
        );
        for (num, value) in raw_options {
            msg.options.push(num, value);
        }
        msg.payload = payload;

        let wire = encode_vec(&msg).unwrap();
        let back = decode(&wire).unwrap();
        prop_assert_eq!(back, msg);
    }

    #[test]
    fn test_options_always_number_sorted(
        raw_options in prop::collection::vec((1u16..2000, prop::collection::vec(any::<u8>(), 0..32)), 0..16),
    ) {
        let mut opts = OptionSet::new();
        for (num, value) in raw_options {
            opts.push(num, value);
        }
        let numbers: Vec<_> = opts.iter().map(|(n, _)| n).collect();
        let mut sorted = numbers.clone();
        sorted.sort_unstable();
        prop_assert_eq!(numbers, sorted);
    }

    #[test]
    fn test_block_raw_roundtrip(num in 0u32..(1 << 20), more in any::<bool>(), szx in 0u8..7) {
        let block = BlockOpt::new(num, more, 1u16 << (szx + 4)).unwrap();
        prop_assert_eq!(BlockOpt::from_raw(block.to_raw()).unwrap(), block);
    }

    #[test]
    fn test_decode_never_panics(junk in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = decode(&junk);
    }
}
