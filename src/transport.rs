//! UDP transport binding `coap-core`'s endpoint to a real socket: a
//! `tokio::net::UdpSocket` behind an `Arc`, a `BytesMut`-backed receive
//! buffer, and a background `tokio::spawn`'d loop that logs and continues
//! past a recoverable `recv_from` error rather than tearing the listener
//! down.

use std::{net::SocketAddr, sync::Arc};

use bytes::BytesMut;
use coap_core::{CoreError, Endpoint, Transport};
use tokio::net::UdpSocket;

pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        Ok(Self {
            socket: Arc::new(UdpSocket::bind(addr).await?),
        })
    }

    /// Spawn the background receive loop, handing decoded datagrams to
    /// `endpoint`. The endpoint's own dispatch (`on_inbound_datagram`) is
    /// synchronous — the stack mutates no state that isn't already
    /// guarded, so running it directly on this task is sound.
    pub fn spawn_recv_loop(self: &Arc<Self>, endpoint: Arc<Endpoint<Self>>) {
        let socket = self.socket.clone();

        tokio::spawn(async move {
            let mut buffer = BytesMut::zeroed(65535);

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((size, peer)) => endpoint.on_inbound_datagram(&buffer[..size], peer),
                    Err(e) => {
                        log::error!("udp recv_from error: {e}");
                    }
                }
            }
        });
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, bytes: &[u8], peer: SocketAddr) -> Result<(), CoreError> {
        let socket = self.socket.clone();
        let bytes = bytes.to_vec();

        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&bytes, peer).await {
                log::warn!("udp send_to {peer} failed: {e}");
            }
        });

        Ok(())
    }
}
