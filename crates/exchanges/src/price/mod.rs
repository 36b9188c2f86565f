//! Historical USD prices for normalized transactions.
//!
//! Tiers, in order: the source exchange's daily candle against a stable
//! quote, the stablecoin table, then the CoinGecko oracle.

mod cache;
mod coingecko;
mod resolver;
mod source;

pub use cache::{PriceCache, PriceCacheConfig};
pub use coingecko::CoinGeckoOracle;
pub use resolver::PriceResolver;
pub use source::{
    KlinePriceSource, PriceSource, PriceTier, StablecoinTable, STABLECOINS, STABLE_QUOTES,
};
