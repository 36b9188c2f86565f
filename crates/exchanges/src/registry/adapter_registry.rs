//! Builds adapter instances from per-account configuration.

use std::sync::Arc;

use log::debug;

use crate::adapter::{BinanceAdapter, BybitAdapter, ExchangeAdapter, BINANCE_ID, BYBIT_ID};
use crate::config::{ExchangeConfig, ExchangeOverrides};
use crate::errors::ExchangeError;

/// Creates the adapter for an exchange id.
///
/// The orchestrator asks for a fresh adapter per run so that region, testnet
/// and product variant follow the account's current metadata.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        exchange_id: &str,
        config: &ExchangeConfig,
    ) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError>;
}

/// Factory for the built-in Binance and Bybit adapters.
#[derive(Debug, Clone, Default)]
pub struct DefaultAdapterFactory {
    overrides: ExchangeOverrides,
}

impl DefaultAdapterFactory {
    pub fn new(overrides: ExchangeOverrides) -> Self {
        Self { overrides }
    }

    pub fn supported_exchanges() -> &'static [&'static str] {
        &[BINANCE_ID, BYBIT_ID]
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        exchange_id: &str,
        config: &ExchangeConfig,
    ) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        let id = exchange_id.to_ascii_uppercase();
        let config = config.clone().with_overrides(&id, &self.overrides);
        debug!("Creating {} adapter (region={:?})", id, config.region_code());

        match id.as_str() {
            BINANCE_ID => Ok(Arc::new(BinanceAdapter::new(&config)?)),
            BYBIT_ID => Ok(Arc::new(BybitAdapter::new(&config)?)),
            _ => Err(ExchangeError::not_supported(&id, "exchange")),
        }
    }
}
