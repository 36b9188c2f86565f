//! Ledgersync exchanges crate.
//!
//! Source adapters for centralized exchanges plus the plumbing every call
//! goes through:
//! - [`adapter`]: the `ExchangeAdapter` trait and the Binance and Bybit adapters
//! - [`registry`]: rate limiting, retry with backoff, adapter construction
//! - [`price`]: tiered historical USD price resolution
//! - [`errors`]: the error taxonomy and retry classification

pub mod adapter;
pub mod config;
pub mod errors;
pub mod models;
pub mod price;
pub mod registry;

pub use adapter::{fetch_capability, AdapterCapabilities, ChunkLimits, ExchangeAdapter, RateLimit};
pub use config::{ExchangeConfig, ExchangeOverrides};
pub use errors::{ExchangeError, RetryClass};
pub use models::{Kline, Page, RawRecord, RecordFields, TimeWindow};
pub use price::{
    CoinGeckoOracle, KlinePriceSource, PriceCache, PriceCacheConfig, PriceResolver, PriceSource,
    PriceTier, StablecoinTable,
};
pub use registry::{
    call_with_backoff, call_with_retry, limiter_key, AdapterFactory, BackoffPolicy,
    DefaultAdapterFactory, RateLimiter,
};
