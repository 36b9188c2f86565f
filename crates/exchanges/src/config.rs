//! Per-account exchange configuration.
//!
//! Environment-style overrides are read once at startup into
//! [`ExchangeOverrides`]; adapters only ever see an explicit
//! [`ExchangeConfig`].

use std::time::Duration;

use ledgersync_core::credentials::CredentialMetadata;

/// Default HTTP timeout for exchange calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolved configuration for one adapter instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// Region selecting the base endpoint; `None` means the global endpoint.
    pub region: Option<String>,
    /// Use the source's test environment (endpoint and key scope).
    pub testnet: bool,
    /// Product variant selecting the exposed capability set.
    pub product_variant: Option<String>,
    /// Replaces the region/testnet base URL entirely.
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            region: None,
            testnet: false,
            product_variant: None,
            base_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ExchangeConfig {
    pub fn from_metadata(metadata: &CredentialMetadata) -> Self {
        Self {
            region: metadata.region.clone(),
            testnet: metadata.testnet,
            product_variant: metadata.product_variant.clone(),
            ..Self::default()
        }
    }

    /// Apply operator overrides for `exchange_id`. Overrides win over
    /// account metadata.
    pub fn with_overrides(mut self, exchange_id: &str, overrides: &ExchangeOverrides) -> Self {
        let (region, testnet) = match exchange_id.to_ascii_uppercase().as_str() {
            "BINANCE" => (&overrides.binance_region, overrides.binance_testnet),
            "BYBIT" => (&overrides.bybit_region, overrides.bybit_testnet),
            _ => return self,
        };
        if let Some(region) = region {
            self.region = Some(region.clone());
        }
        if let Some(testnet) = testnet {
            self.testnet = testnet;
        }
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Upper-cased region, if any.
    pub fn region_code(&self) -> Option<String> {
        self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_ascii_uppercase)
    }
}

/// Operator-level overrides, read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeOverrides {
    pub binance_region: Option<String>,
    pub binance_testnet: Option<bool>,
    pub bybit_region: Option<String>,
    pub bybit_testnet: Option<bool>,
}

impl ExchangeOverrides {
    /// Read `BINANCE_REGION`, `BINANCE_TESTNET`, `BYBIT_REGION` and
    /// `BYBIT_TESTNET` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let flag = |key: &str| text(key).map(|v| parse_flag(&v));

        Self {
            binance_region: text("BINANCE_REGION"),
            binance_testnet: flag("BINANCE_TESTNET"),
            bybit_region: text("BYBIT_REGION"),
            bybit_testnet: flag("BYBIT_TESTNET"),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
