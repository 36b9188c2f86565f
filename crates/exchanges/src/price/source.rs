//! Price tiers consulted by the resolver, in order.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use log::debug;
use rust_decimal::Decimal;

use crate::adapter::ExchangeAdapter;
use crate::errors::ExchangeError;
use crate::models::{Kline, TimeWindow};
use crate::registry::{call_with_backoff, call_with_retry, BackoffPolicy, RateLimiter};

/// Which tier produced a price. Drives the current-day cache TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PriceTier {
    Kline,
    Stablecoin,
    Oracle,
}

/// One source of daily USD prices.
#[async_trait]
pub trait PriceSource: Send + Sync {
    fn tier(&self) -> PriceTier;

    /// USD price of `asset` on `day`. Sources return an error rather than
    /// zero when they have no price.
    async fn quote(&self, asset: &str, day: NaiveDate) -> Result<Decimal, ExchangeError>;
}

/// Stable quotes tried against the source exchange, in order.
pub const STABLE_QUOTES: &[&str] = &["USDT", "USDC", "BUSD", "USD"];

/// Daily close from the exchange the records came from.
///
/// Each kline call goes through the same backoff policy as pagination, and
/// through the account's rate limiter when one is attached.
pub struct KlinePriceSource {
    adapter: Arc<dyn ExchangeAdapter>,
    limiter: Option<(Arc<RateLimiter>, String)>,
    retry: BackoffPolicy,
}

impl KlinePriceSource {
    pub fn new(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            adapter,
            limiter: None,
            retry: BackoffPolicy::default(),
        }
    }

    /// Pace kline calls through `limiter` under `key`.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>, key: impl Into<String>) -> Self {
        self.limiter = Some((limiter, key.into()));
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn day_window(day: NaiveDate) -> TimeWindow {
        let start = day.and_time(chrono::NaiveTime::MIN).and_utc();
        TimeWindow::new(start, start + Duration::days(1))
    }

    async fn fetch_klines(
        &self,
        asset: &str,
        quote: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let fetch = || self.adapter.get_klines(asset, quote, window);
        match &self.limiter {
            Some((limiter, key)) => {
                call_with_retry(&self.retry, limiter, key, self.adapter.as_ref(), fetch).await
            }
            None => call_with_backoff(&self.retry, self.adapter.id(), fetch).await,
        }
    }
}

#[async_trait]
impl PriceSource for KlinePriceSource {
    fn tier(&self) -> PriceTier {
        PriceTier::Kline
    }

    async fn quote(&self, asset: &str, day: NaiveDate) -> Result<Decimal, ExchangeError> {
        let asset = asset.to_ascii_uppercase();
        let window = Self::day_window(day);

        for quote in STABLE_QUOTES.iter().filter(|q| **q != asset) {
            match self.fetch_klines(&asset, quote, &window).await {
                Ok(klines) => {
                    let close = klines
                        .iter()
                        .find(|k| k.open_time.date_naive() == day)
                        .or_else(|| klines.first())
                        .map(|k| k.close);
                    if let Some(close) = close {
                        return Ok(close);
                    }
                }
                Err(err) => {
                    debug!(
                        "{} kline {}{} on {} failed: {}",
                        self.adapter.id(),
                        asset,
                        quote,
                        day,
                        err
                    );
                }
            }
        }

        Err(ExchangeError::PriceUnavailable { asset, day })
    }
}

/// Assets pegged to one US dollar.
pub const STABLECOINS: &[&str] = &["USD", "USDT", "USDC", "BUSD", "DAI", "TUSD", "USDP", "FDUSD"];

/// Fixed 1.0 prices for stablecoins and fiat USD.
#[derive(Debug, Clone)]
pub struct StablecoinTable {
    symbols: Vec<String>,
}

impl StablecoinTable {
    pub fn new() -> Self {
        Self {
            symbols: STABLECOINS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_symbol(mut self, symbol: &str) -> Self {
        self.symbols.push(symbol.to_ascii_uppercase());
        self
    }

    pub fn contains(&self, asset: &str) -> bool {
        self.symbols.iter().any(|s| s.eq_ignore_ascii_case(asset))
    }
}

impl Default for StablecoinTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PriceSource for StablecoinTable {
    fn tier(&self) -> PriceTier {
        PriceTier::Stablecoin
    }

    async fn quote(&self, asset: &str, day: NaiveDate) -> Result<Decimal, ExchangeError> {
        if self.contains(asset) {
            Ok(Decimal::ONE)
        } else {
            Err(ExchangeError::PriceUnavailable {
                asset: asset.to_string(),
                day,
            })
        }
    }
}
