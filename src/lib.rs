pub mod config;
pub mod observer;
pub mod statistics;
pub mod transport;

use std::sync::Arc;

use self::{config::Config, observer::Observer, statistics::Statistics};

use coap_core::{Endpoint, EndpointOptions};
use transport::UdpTransport;

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "coap-endpoint.",
    env!("CARGO_PKG_VERSION")
);

/// Opened so integration tests can start the endpoint directly without
/// going through `main`.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("starting {SOFTWARE}");

    let statistics = Arc::new(Statistics::default());
    let handler = Arc::new(Observer::new(statistics.clone()));
    let behavior = (&config.behavior).into();

    let mut endpoints = Vec::with_capacity(config.listeners.len());
    for listener in &config.listeners {
        let transport = Arc::new(UdpTransport::bind(listener.listen).await?);

        let endpoint = Endpoint::new(EndpointOptions {
            behavior,
            transport: transport.clone(),
            request_handler: Some(handler.clone() as Arc<dyn coap_core::RequestHandler>),
            proxy_handler: None,
        });

        transport.spawn_recv_loop(endpoint.clone());
        log::info!("listening on {}", listener.listen);
        endpoints.push(endpoint);
    }

    if endpoints.is_empty() {
        log::warn!("no listeners configured, nothing to do");
    }

    std::future::pending::<()>().await;
    Ok(())
}
