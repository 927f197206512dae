//! API server command: `bizimatch serve`.

use anyhow::Result;

use bizimatch::config::BizimatchConfig;

pub async fn cmd_serve(
    mut config: BizimatchConfig,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        config.toml.server.port = port;
    }
    if let Some(host) = host {
        config.toml.server.host = host;
    }
    if dev {
        config.toml.server.dev_mode = true;
    }

    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }

    println!(
        "Bizimatch API on http://{}:{}",
        config.toml.server.host, config.toml.server.port
    );
    bizimatch::server::start_server(&config).await
}
