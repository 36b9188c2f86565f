use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{anyhow, Context};
use ledgersync_exchanges::{config::DEFAULT_REQUEST_TIMEOUT, ExchangeOverrides};
use ledgersync_sync::DEFAULT_EVENT_CAPACITY;

pub struct Config {
    pub listen_addr: SocketAddr,
    /// Vault master key, base64 or 32 ASCII characters.
    pub secret_key: String,
    pub credentials_file: PathBuf,
    pub cors_allow: Vec<String>,
    pub request_timeout: Duration,
    /// Per-call timeout towards the exchanges.
    pub exchange_timeout: Duration,
    pub event_capacity: usize,
    pub coingecko_api_key: Option<String>,
    pub exchange_overrides: ExchangeOverrides,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let listen_addr: SocketAddr = text("LS_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("Invalid LS_LISTEN_ADDR")?;
        let secret_key = text("LS_SECRET_KEY")
            .ok_or_else(|| anyhow!("LS_SECRET_KEY must be set to open the credential vault"))?;
        let credentials_file = text("LS_CREDENTIALS_FILE")
            .unwrap_or_else(|| "./data/credentials.json".into());
        let cors_allow = text("LS_CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|| "*".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let timeout_ms: u64 = text("LS_REQUEST_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30000);
        let exchange_timeout = text("LS_EXCHANGE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let event_capacity = text("LS_EVENT_CAPACITY")
            .and_then(|v| v.parse().ok())
            .filter(|capacity: &usize| *capacity > 0)
            .unwrap_or(DEFAULT_EVENT_CAPACITY);

        Ok(Self {
            listen_addr,
            secret_key,
            credentials_file: PathBuf::from(credentials_file),
            cors_allow,
            request_timeout: Duration::from_millis(timeout_ms),
            exchange_timeout,
            event_capacity,
            coingecko_api_key: text("LS_COINGECKO_API_KEY"),
            exchange_overrides: ExchangeOverrides::from_lookup(&lookup),
        })
    }
}
