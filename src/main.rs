#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use coap_endpoint::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.listeners.is_empty() {
        log::warn!(
            "No listeners are bound, no features are enabled, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    coap_endpoint::startup(config).await
}
