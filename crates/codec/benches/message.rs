use coap_codec::message::{Code, CoapOption, Message, Type, option_number};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn sample() -> Message {
    let mut msg = Message::new(Type::Confirmable, Code::GET, 0x9E9E, vec![1, 2, 3, 4]);
    msg.add_option(CoapOption::new(option_number::URI_HOST, b"coap.example.org".to_vec()));
    msg.add_option(CoapOption::new(option_number::URI_PATH, b"sensors".to_vec()));
    msg.add_option(CoapOption::new(option_number::URI_PATH, b"temperature".to_vec()));
    msg
}

fn encode(c: &mut Criterion) {
    let msg = sample();
    c.bench_function("encode", |b| b.iter(|| black_box(&msg).encode().unwrap()));
}

fn decode(c: &mut Criterion) {
    let bytes = sample().encode().unwrap();
    c.bench_function("decode", |b| b.iter(|| Message::decode(black_box(&bytes)).unwrap()));
}

criterion_group!(benches, encode, decode);
criterion_main!(benches);
