//! Process-wide daily price cache.
//!
//! Entries for past days never expire: a closed day's price does not change.
//! Entries for the current day expire after a TTL that depends on the tier
//! that produced them.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::source::PriceTier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceCacheConfig {
    pub kline_ttl: Duration,
    pub oracle_ttl: Duration,
}

impl Default for PriceCacheConfig {
    fn default() -> Self {
        Self {
            kline_ttl: Duration::from_secs(15 * 60),
            oracle_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl PriceCacheConfig {
    fn ttl(&self, tier: PriceTier) -> Option<Duration> {
        match tier {
            PriceTier::Kline => Some(self.kline_ttl),
            PriceTier::Oracle => Some(self.oracle_ttl),
            PriceTier::Stablecoin => None,
        }
    }
}

type CacheKey = (String, String, NaiveDate);

#[derive(Debug, Clone)]
struct CachedPrice {
    price: Decimal,
    tier: PriceTier,
    stored_at: Instant,
}

pub struct PriceCache {
    entries: DashMap<CacheKey, CachedPrice>,
    config: PriceCacheConfig,
}

impl PriceCache {
    pub fn new(config: PriceCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    fn key(asset: &str, quote: &str, day: NaiveDate) -> CacheKey {
        (asset.to_ascii_uppercase(), quote.to_ascii_uppercase(), day)
    }

    /// Cached price for `day`, treating `today` as the only mutable day.
    pub fn get(&self, asset: &str, quote: &str, day: NaiveDate, today: NaiveDate) -> Option<Decimal> {
        let key = Self::key(asset, quote, day);
        let entry = self.entries.get(&key)?;
        if day < today {
            return Some(entry.price);
        }

        match self.config.ttl(entry.tier) {
            Some(ttl) if entry.stored_at.elapsed() >= ttl => {
                drop(entry);
                self.entries.remove(&key);
                None
            }
            _ => Some(entry.price),
        }
    }

    pub fn insert(&self, asset: &str, quote: &str, day: NaiveDate, price: Decimal, tier: PriceTier) {
        self.entries.insert(
            Self::key(asset, quote, day),
            CachedPrice {
                price,
                tier,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn age_entry(&self, asset: &str, quote: &str, day: NaiveDate, by: Duration) {
        if let Some(mut entry) = self.entries.get_mut(&Self::key(asset, quote, day)) {
            entry.stored_at -= by;
        }
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new(PriceCacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_past_days_never_expire() {
        let cache = PriceCache::default();
        cache.insert("btc", "USD", day(1), dec!(61000), PriceTier::Oracle);
        cache.age_entry("BTC", "USD", day(1), Duration::from_secs(3600));

        assert_eq!(cache.get("BTC", "usd", day(1), day(10)), Some(dec!(61000)));
    }

    #[test]
    fn test_current_day_expires_per_tier() {
        let cache = PriceCache::default();
        cache.insert("BTC", "USD", day(10), dec!(67000), PriceTier::Kline);
        cache.insert("ETH", "USD", day(10), dec!(3500), PriceTier::Oracle);

        cache.age_entry("BTC", "USD", day(10), Duration::from_secs(6 * 60));
        cache.age_entry("ETH", "USD", day(10), Duration::from_secs(6 * 60));

        assert_eq!(cache.get("BTC", "USD", day(10), day(10)), Some(dec!(67000)));
        assert_eq!(cache.get("ETH", "USD", day(10), day(10)), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stablecoin_entries_do_not_expire() {
        let cache = PriceCache::default();
        cache.insert("USDT", "USD", day(10), Decimal::ONE, PriceTier::Stablecoin);
        cache.age_entry("USDT", "USD", day(10), Duration::from_secs(3600));
        assert_eq!(cache.get("USDT", "USD", day(10), day(10)), Some(Decimal::ONE));
    }
}
