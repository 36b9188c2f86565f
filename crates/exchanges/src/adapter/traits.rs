//! Exchange adapter trait definitions.
//!
//! This module defines the `ExchangeAdapter` trait every source implements.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgersync_core::credentials::DecryptedCredential;
use ledgersync_core::sync::Capability;

use crate::errors::ExchangeError;
use crate::models::{Kline, Page, RawRecord, RecordFields, TimeWindow};

use super::capabilities::{AdapterCapabilities, RateLimit};

/// Trait for exchange adapters.
///
/// Each capability is its own method with a default returning
/// [`ExchangeError::NotSupported`]; an adapter overrides the subset it
/// declares in [`capabilities`](Self::capabilities).
///
/// Every list method must be idempotent for a given window and cursor, and
/// must only return records whose timestamp lies inside the window.
///
/// # Example
///
/// ```ignore
/// #[async_trait]
/// impl ExchangeAdapter for MyExchange {
///     fn id(&self) -> &'static str {
///         "MY_EXCHANGE"
///     }
///
///     fn capabilities(&self) -> AdapterCapabilities {
///         AdapterCapabilities::new(Duration::days(365))
///             .with(Capability::Deposits, ChunkLimits::fixed(Duration::days(30)))
///     }
///
///     fn extract(&self, record: &RawRecord) -> Result<RecordFields, ExchangeError> {
///         // ...
///     }
///
///     async fn list_deposits(&self, /* ... */) -> Result<Page, ExchangeError> {
///         // ...
///     }
/// }
/// ```
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Constant identifier like "BINANCE" or "BYBIT".
    fn id(&self) -> &'static str;

    fn capabilities(&self) -> AdapterCapabilities;

    fn rate_limit(&self) -> RateLimit {
        RateLimit::default()
    }

    /// Whether [`sync_clock`](Self::sync_clock) must run before the first
    /// signed call.
    fn requires_clock_sync(&self) -> bool {
        false
    }

    /// Fetch the source's clock and store the offset used for signing.
    async fn sync_clock(&self) -> Result<(), ExchangeError> {
        Ok(())
    }

    /// Earliest activity on the account, if the source can tell. Used as
    /// the start of a full sync.
    async fn earliest_activity(
        &self,
        _credential: &DecryptedCredential,
    ) -> Result<Option<DateTime<Utc>>, ExchangeError> {
        Ok(None)
    }

    /// Pull the canonical fields out of one record of this source.
    fn extract(&self, record: &RawRecord) -> Result<RecordFields, ExchangeError>;

    async fn list_trades(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_trades"))
    }

    async fn list_orders(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_orders"))
    }

    async fn list_transfers(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_transfers"))
    }

    async fn list_deposits(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_deposits"))
    }

    async fn list_withdrawals(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_withdrawals"))
    }

    async fn list_conversions(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_conversions"))
    }

    async fn list_earnings(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_earnings"))
    }

    async fn list_dividends(
        &self,
        _credential: &DecryptedCredential,
        _window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "list_dividends"))
    }

    /// Daily candles for `base`/`quote` covering `window`. Public data; no
    /// credential needed.
    async fn get_klines(
        &self,
        _base: &str,
        _quote: &str,
        _window: &TimeWindow,
    ) -> Result<Vec<Kline>, ExchangeError> {
        Err(ExchangeError::not_supported(self.id(), "get_klines"))
    }
}

/// Dispatch a ledger capability to the matching adapter method.
pub async fn fetch_capability(
    adapter: &dyn ExchangeAdapter,
    capability: Capability,
    credential: &DecryptedCredential,
    window: &TimeWindow,
    cursor: Option<&str>,
) -> Result<Page, ExchangeError> {
    match capability {
        Capability::Trades => adapter.list_trades(credential, window, cursor).await,
        Capability::Orders => adapter.list_orders(credential, window, cursor).await,
        Capability::Transfers => adapter.list_transfers(credential, window, cursor).await,
        Capability::Deposits => adapter.list_deposits(credential, window, cursor).await,
        Capability::Withdrawals => adapter.list_withdrawals(credential, window, cursor).await,
        Capability::Conversions => adapter.list_conversions(credential, window, cursor).await,
        Capability::Earnings => adapter.list_earnings(credential, window, cursor).await,
        Capability::Dividends => adapter.list_dividends(credential, window, cursor).await,
        Capability::Klines => Err(ExchangeError::InvalidRequest {
            exchange: adapter.id().to_string(),
            message: "klines are fetched through get_klines".to_string(),
        }),
    }
}
