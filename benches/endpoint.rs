use std::{net::SocketAddr, sync::Arc};

use coap_codec::message::{Code, Message, Type, option_number};
use coap_core::{CoreError, Endpoint, EndpointOptions, RequestHandler, Transport, behavior::Behavior};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};

#[derive(Default)]
struct SinkTransport;

impl Transport for SinkTransport {
    fn send_to(&self, _bytes: &[u8], _peer: SocketAddr) -> Result<(), CoreError> {
        Ok(())
    }
}

struct BenchHandler;

impl RequestHandler for BenchHandler {
    fn handle_request(&self, request: &Message) -> Message {
        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, request.mid, request.token.clone());
        response.payload = b"hello".to_vec();
        response
    }
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("endpoint");
    group.throughput(Throughput::Elements(1));

    group.bench_function("piggybacked_get", |bencher| {
        let endpoint = Endpoint::new(EndpointOptions {
            behavior: Behavior::default(),
            transport: Arc::new(SinkTransport),
            request_handler: Some(Arc::new(BenchHandler)),
            proxy_handler: None,
        });
        let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();

        let mut request = Message::new(Type::Confirmable, Code::GET, 0, vec![1, 2, 3, 4]);
        request.add_option(coap_codec::message::CoapOption::new(option_number::URI_PATH, b"bench".to_vec()));
        let mut bytes = request.encode().unwrap();

        bencher.iter(|| {
            request.mid = request.mid.wrapping_add(1);
            bytes = request.encode().unwrap();
            endpoint.on_inbound_datagram(&bytes, peer);
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
