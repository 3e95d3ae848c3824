use anyhow::{Context, Result};
use env_logger::Env;

use tftp_get::config::ServerConfig;
use tftp_get::server::Server;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env().context("Invalid server configuration")?;
    log::debug!("{:?}", config);

    let server = Server::bind(config.clone())
        .with_context(|| format!("Unable to bind listening address {}", config.bind_addr))?;
    server.run().await;

    Ok(())
}
