use criterion::{Criterion, criterion_group, criterion_main};
use lumen_coap::{BlockOpt, Code, ContentFormat, Message, MsgId, Token, decode, encode};
use std::hint::black_box;

fn sample_message() -> Message {
    let token = Token::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
    let mut msg = Message::request(Code::POST, MsgId(0x4711), token);
    msg.options.push_uri_path("rd");
    msg.options.push_uri_query("ep=urn:dev:os:0023");
    msg.options.push_uri_query("lt=86400");
    msg.options.set_content_format(ContentFormat::LINK_FORMAT);
    msg.options.set_block1(BlockOpt::new(2, true, 512).unwrap());
    msg.payload = vec![b'x'; 512];
    msg
}

fn bench_encode(c: &mut Criterion) {
    let msg = sample_message();
    let mut buf = [0u8; 1280];
    c.bench_function("encode_register_block", |b| {
        b.iter(|| black_box(encode(black_box(&msg), &mut buf).unwrap()))
    });
}

fn bench_decode(c: &mut Criterion) {
    let msg = sample_message();
    let mut buf = [0u8; 1280];
    let len = encode(&msg, &mut buf).unwrap();
    c.bench_function("decode_register_block", |b| {
        b.iter(|| black_box(decode(black_box(&buf[..len])).unwrap()))
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
