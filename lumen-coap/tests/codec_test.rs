use lumen_coap::option::{self, number};
use lumen_coap::{
    BlockOpt, CoapError, Code, ContentFormat, Message, MsgId, MsgType, Token, decode, encode,
    encode_vec,
};

#[test]
fn test_minimal_get_roundtrip() {
    let token = Token::from_slice(&[0xde, 0xad, 0xbe, 0xef]).unwrap();
    let mut msg = Message::request(Code::GET, MsgId(0x1234), token);
    msg.options.push_uri_path("3");
    msg.options.push_uri_path("0");
    msg.options.push_uri_path("1");

    let wire = encode_vec(&msg).unwrap();
    // Header: ver 1, CON, TKL 4.
    assert_eq!(wire[0], 0x44);
    assert_eq!(wire[1], Code::GET.0);
    assert_eq!(&wire[2..4], &[0x12, 0x34]);
    assert_eq!(&wire[4..8], &[0xde, 0xad, 0xbe, 0xef]);

    let back = decode(&wire).unwrap();
    assert_eq!(back, msg);
    assert_eq!(back.options.uri_path_string(), "/3/0/1");
}

#[test]
fn test_known_wire_form() {
    // ACK 2.05, msg id 0x00aa, no token, Content-Format 0, payload "21.5".
    let mut msg = Message::new(
        MsgType::Acknowledgement,
        Code::CONTENT,
        MsgId(0x00aa),
        Token::EMPTY,
    );
    msg.options.set_content_format(ContentFormat::TEXT_PLAIN);
    msg.payload = b"21.5".to_vec();

    let wire = encode_vec(&msg).unwrap();
    assert_eq!(
        wire,
        vec![0x60, 0x45, 0x00, 0xaa, 0xc0, 0xff, b'2', b'1', b'.', b'5']
    );
}

#[test]
fn test_extended_option_delta() {
    // Block1 (27) needs an extended delta after Content-Format (12), and a
    // custom high option number needs the 2-byte form.
    let mut msg = Message::request(Code::PUT, MsgId(7), Token::from_slice(&[1]).unwrap());
    msg.options.set_content_format(ContentFormat::OCTET_STREAM);
    msg.options
        .set_block1(BlockOpt::new(3, true, 64).unwrap());
    msg.options.push(2048, vec![0xab]);
    msg.payload = vec![0u8; 64];

    let wire = encode_vec(&msg).unwrap();
    let back = decode(&wire).unwrap();
    assert_eq!(back.options.block1().unwrap().unwrap().num, 3);
    assert_eq!(back.options.first(2048), Some([0xab].as_slice()));
    assert_eq!(back.payload.len(), 64);
}

#[test]
fn test_decode_rejects_malformed() {
    assert_eq!(decode(&[0x40, 0x01]), Err(CoapError::Truncated));
    // Version 2.
    assert_eq!(
        decode(&[0x84, 0x01, 0, 0, 0, 0, 0, 0]),
        Err(CoapError::BadVersion)
    );
    // TKL 9.
    assert_eq!(
        decode(&[0x49, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
        Err(CoapError::BadTokenLength(9))
    );
    // Payload marker with nothing after it.
    assert_eq!(
        decode(&[0x40, 0x01, 0, 0, 0xff]),
        Err(CoapError::EmptyPayloadAfterMarker)
    );
    // Option length nibble 15 is reserved.
    assert_eq!(
        decode(&[0x40, 0x01, 0, 0, 0x1f, 0xaa]),
        Err(CoapError::ReservedOptionLength)
    );
    // Option value runs past the datagram.
    assert_eq!(
        decode(&[0x40, 0x01, 0, 0, 0xb4, b'r']),
        Err(CoapError::Truncated)
    );
}

#[test]
fn test_empty_message_is_bare_header() {
    let ack = Message::empty_ack(MsgId(0xbeef));
    let wire = encode_vec(&ack).unwrap();
    assert_eq!(wire, vec![0x60, 0x00, 0xbe, 0xef]);
    assert_eq!(decode(&wire).unwrap(), ack);

    let rst = Message::reset(MsgId(1));
    assert_eq!(decode(&encode_vec(&rst).unwrap()).unwrap(), rst);

    // Empty code with trailing bytes is a format error.
    assert!(decode(&[0x60, 0x00, 0x00, 0x01, 0x11]).is_err());
}

#[test]
fn test_encode_into_too_small_buffer() {
    let mut msg = Message::request(Code::POST, MsgId(1), Token::EMPTY);
    msg.payload = vec![0u8; 128];
    let mut buf = [0u8; 32];
    assert_eq!(encode(&msg, &mut buf), Err(CoapError::MessageTooLarge(32)));
}

#[test]
fn test_observe_and_query_options() {
    let mut msg = Message::request(Code::GET, MsgId(2), Token::from_slice(&[9]).unwrap());
    msg.options.set_observe(option::OBSERVE_REGISTER);
    msg.options.push_uri_query("pmin=30");
    msg.options.push_uri_query("pmax=120");

    let back = decode(&encode_vec(&msg).unwrap()).unwrap();
    assert_eq!(back.options.observe().unwrap(), Some(0));
    let queries: Vec<_> = back
        .options
        .uri_queries()
        .map(|q| String::from_utf8_lossy(q).into_owned())
        .collect();
    assert_eq!(queries, vec!["pmin=30", "pmax=120"]);

    // 24-bit mask on the observe sequence.
    let mut notify = Message::non_response(Code::CONTENT, MsgId(3), msg.token);
    notify.options.set_observe(0x0100_0005);
    assert_eq!(notify.options.observe().unwrap(), Some(5));
}

#[test]
fn test_location_path_roundtrip() {
    let mut msg = Message::piggybacked(
        Code::CREATED,
        &Message::request(Code::POST, MsgId(4), Token::from_slice(&[7, 7]).unwrap()),
    );
    msg.options.push_location_path("rd");
    msg.options.push_location_path("5a3f");

    let back = decode(&encode_vec(&msg).unwrap()).unwrap();
    let segments: Vec<_> = back.options.values(number::LOCATION_PATH).collect();
    assert_eq!(segments, vec![b"rd".as_slice(), b"5a3f".as_slice()]);
}
