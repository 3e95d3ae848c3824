// Server configuration.
//
// Every setting has a default suitable for a stand-alone server, and each can be overridden from
// the environment:
//
//  TFTP_BIND         address the server listens on for requests (0.0.0.0:69)
//  TFTP_ROOT         directory files are served from (.)
//  TFTP_PORT_RANGE   ports used for transfers, as `low-high` with `high` excluded (1024-65535)
//  TFTP_TIMEOUT_MS   how long to wait for an ack before resending a block (1000)
//  TFTP_MAX_RETRIES  how many resends in a row before giving up on a client (5)

use anyhow::{anyhow, bail, Context, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub root: PathBuf,
    pub port_range: Range<u16>,
    pub timeout: Duration,
    pub max_retries: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: (Ipv4Addr::UNSPECIFIED, 69).into(),
            root: PathBuf::from("."),
            port_range: 1024..65535,
            timeout: Duration::from_millis(1000),
            max_retries: 5,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<ServerConfig> {
        ServerConfig::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from the defaults, overriding any setting `lookup` has a value for.
    pub fn from_lookup<F>(lookup: F) -> Result<ServerConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ServerConfig::default();

        if let Some(raw) = lookup("TFTP_BIND") {
            config.bind_addr = raw.parse().with_context(|| format!("TFTP_BIND: invalid address '{raw}'"))?;
        }
        if let Some(raw) = lookup("TFTP_ROOT") {
            config.root = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("TFTP_PORT_RANGE") {
            config.port_range = parse_port_range(&raw).context("TFTP_PORT_RANGE")?;
        }
        if let Some(raw) = lookup("TFTP_TIMEOUT_MS") {
            let millis: u64 = raw.parse().with_context(|| format!("TFTP_TIMEOUT_MS: invalid number '{raw}'"))?;
            if millis == 0 {
                bail!("TFTP_TIMEOUT_MS must be greater than zero");
            }
            config.timeout = Duration::from_millis(millis);
        }
        if let Some(raw) = lookup("TFTP_MAX_RETRIES") {
            config.max_retries = raw.parse().with_context(|| format!("TFTP_MAX_RETRIES: invalid number '{raw}'"))?;
        }

        Ok(config)
    }
}

fn parse_port_range(raw: &str) -> Result<Range<u16>> {
    let (low, high) = raw
        .split_once('-')
        .ok_or_else(|| anyhow!("expected `low-high`, got '{raw}'"))?;
    let low: u16 = low.trim().parse().with_context(|| format!("invalid port '{low}'"))?;
    let high: u16 = high.trim().parse().with_context(|| format!("invalid port '{high}'"))?;
    if low >= high {
        bail!("port range {low}-{high} is empty");
    }
    Ok(low..high)
}
