use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub backend: BackendConfig,
    pub store: StoreConfig,
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:8181`).
    pub http_listen: String,
    /// Upper bound in seconds on any single response write. A client that
    /// cannot accept bytes for this long loses its connection (and its
    /// subprocess pipeline).
    #[serde(default = "default_response_write_timeout")]
    pub response_write_timeout: u64,
}

fn default_response_write_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Application backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the application backend that pre-authorizes requests
    /// (e.g. `http://127.0.0.1:8080`). The client request's path and query
    /// are appended verbatim.
    pub url: String,
}

// ---------------------------------------------------------------------------
// Key–value store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Connection string (e.g. `redis://store.local:6379`).
    pub endpoint: String,
    /// Enable TLS for the store connection.
    #[serde(default)]
    pub tls: bool,
    /// Name of the environment variable that holds the store auth token.
    #[serde(default = "default_store_auth_env")]
    pub auth_token_env: String,
}

fn default_store_auth_env() -> String {
    "GITSHUTTLE_STORE_TOKEN".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.proxy.response_write_timeout > 0,
        "response_write_timeout must be positive"
    );
    anyhow::ensure!(
        config.backend.url.starts_with("http://") || config.backend.url.starts_with("https://"),
        "backend url must be an http(s) URL"
    );
    anyhow::ensure!(
        !config.store.endpoint.is_empty(),
        "store endpoint must not be empty"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
proxy:
  http_listen: 127.0.0.1:8181
backend:
  url: http://127.0.0.1:8080
store:
  endpoint: redis://127.0.0.1:6379
";

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: Config = serde_yaml::from_str(MINIMAL).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.proxy.response_write_timeout, 600);
        assert!(!config.store.tls);
        assert_eq!(config.store.auth_token_env, "GITSHUTTLE_STORE_TOKEN");
    }

    #[test]
    fn rejects_non_http_backend() {
        let yaml = MINIMAL.replace("http://127.0.0.1:8080", "ftp://backend");
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_write_timeout() {
        let yaml = MINIMAL.replace(
            "  http_listen: 127.0.0.1:8181",
            "  http_listen: 127.0.0.1:8181\n  response_write_timeout: 0",
        );
        let config: Config = serde_yaml::from_str(&yaml).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
