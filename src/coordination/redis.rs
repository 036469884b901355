//! Key–value store client pool creation.
//!
//! Builds a [`fred::clients::Pool`] for the store described in
//! [`crate::config::StoreConfig`], optionally enabling TLS via `rustls` and
//! reading the auth token from an environment variable. The same
//! [`fred::types::config::Config`] is reused by the key-watcher's dedicated
//! subscriber connection.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::StoreConfig;

/// Translate our YAML store section into a fred client config.
pub fn client_config(config: &StoreConfig) -> Result<fred::types::config::Config> {
    let auth_token = std::env::var(&config.auth_token_env).ok();

    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = fred::types::config::Config {
        server: ServerConfig::new_centralized(host, port),
        ..fred::types::config::Config::default()
    };

    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }

    if let Some(token) = auth_token {
        fred_config.password = Some(token);
    }

    Ok(fred_config)
}

/// Create the shared store pool, connect it, and verify with a PING.
pub async fn create_pool(fred_config: fred::types::config::Config) -> Result<Pool> {
    let mut builder = Builder::from_config(fred_config);
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(3)
        .context("failed to build store connection pool")?;
    pool.init().await.context("failed to connect to store")?;

    let _: String = pool
        .ping(None)
        .await
        .context("store PING failed after connect")?;

    tracing::info!("store pool created and verified");
    Ok(pool)
}

/// Parse a `host:port` string. If the port is omitted, defaults to `6379`.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);

    if let Some((host, port_str)) = endpoint.rsplit_once(':') {
        let port: u16 = port_str
            .parse()
            .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
        Ok((host, port))
    } else {
        Ok((endpoint, 6379))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_with_port() {
        let (host, port) = parse_host_port("store.local:6380").unwrap();
        assert_eq!(host, "store.local");
        assert_eq!(port, 6380);
    }

    #[test]
    fn parse_host_port_default() {
        let (host, port) = parse_host_port("store.local").unwrap();
        assert_eq!(host, "store.local");
        assert_eq!(port, 6379);
    }

    #[test]
    fn parse_host_port_rejects_bad_port() {
        assert!(parse_host_port("store.local:notaport").is_err());
    }
}
