//! Whole-binary integration test: boots `startup()` over a real UDP socket
//! and drives it with a real client socket, rather than unit-testing the
//! pieces in isolation.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use coap_codec::message::{Code, Message, Type, option_number};
use coap_endpoint::config::{BehaviorConfig, Config, Listener, Log};
use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};

const SERVER: &str = "127.0.0.1";

fn random_port() -> u16 {
    rand::rng().random_range(20000..40000)
}

async fn spawn_server(bind: SocketAddr) {
    let config = Arc::new(Config {
        listeners: vec![Listener { listen: bind }],
        behavior: BehaviorConfig::default(),
        log: Log::default(),
    });

    tokio::spawn(async move {
        coap_endpoint::startup(config).await.unwrap();
    });

    // Give the listener's receive loop a moment to actually bind and spawn.
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn root_ping_gets_a_piggybacked_content_response() {
    let bind: SocketAddr = format!("{SERVER}:{}", random_port()).parse().unwrap();
    spawn_server(bind).await;

    let client = UdpSocket::bind(format!("{SERVER}:0")).await.unwrap();
    client.connect(bind).await.unwrap();

    let request = Message::new(Type::Confirmable, Code::GET, 0x5E5E, vec![0x01, 0x02]);
    client.send(&request.encode().unwrap()).await.unwrap();

    let mut buf = [0u8; 1500];
    let size = timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
    let response = Message::decode(&buf[..size]).unwrap();

    assert_eq!(response.mid, 0x5E5E);
    assert_eq!(response.token, vec![0x01, 0x02]);
    assert_eq!(response.kind, Type::Acknowledgement);
    assert_eq!(response.code, Code::CONTENT);
    assert_eq!(response.payload, b"coap-endpoint");
}

#[tokio::test]
async fn unknown_path_gets_not_found() {
    let bind: SocketAddr = format!("{SERVER}:{}", random_port()).parse().unwrap();
    spawn_server(bind).await;

    let client = UdpSocket::bind(format!("{SERVER}:0")).await.unwrap();
    client.connect(bind).await.unwrap();

    let mut request = Message::new(Type::Confirmable, Code::GET, 0x1234, vec![0xAA]);
    request.add_option(coap_codec::message::CoapOption::new(option_number::URI_PATH, b"nope".to_vec()));
    client.send(&request.encode().unwrap()).await.unwrap();

    let mut buf = [0u8; 1500];
    let size = timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
    let response = Message::decode(&buf[..size]).unwrap();

    assert_eq!(response.code, Code::NOT_FOUND);
}

#[tokio::test]
async fn unsupported_method_on_root_gets_method_not_allowed() {
    let bind: SocketAddr = format!("{SERVER}:{}", random_port()).parse().unwrap();
    spawn_server(bind).await;

    let client = UdpSocket::bind(format!("{SERVER}:0")).await.unwrap();
    client.connect(bind).await.unwrap();

    let request = Message::new(Type::Confirmable, Code::DELETE, 0x2222, vec![0xBB]);
    client.send(&request.encode().unwrap()).await.unwrap();

    let mut buf = [0u8; 1500];
    let size = timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
    let response = Message::decode(&buf[..size]).unwrap();

    assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn empty_con_ping_is_answered_with_reset() {
    let bind: SocketAddr = format!("{SERVER}:{}", random_port()).parse().unwrap();
    spawn_server(bind).await;

    let client = UdpSocket::bind(format!("{SERVER}:0")).await.unwrap();
    client.connect(bind).await.unwrap();

    let ping = Message::new(Type::Confirmable, Code::EMPTY, 0x77, Vec::new());
    client.send(&ping.encode().unwrap()).await.unwrap();

    let mut buf = [0u8; 1500];
    let size = timeout(Duration::from_secs(2), client.recv(&mut buf)).await.unwrap().unwrap();
    let response = Message::decode(&buf[..size]).unwrap();

    assert_eq!(response.kind, Type::Reset);
    assert_eq!(response.mid, 0x77);
}
