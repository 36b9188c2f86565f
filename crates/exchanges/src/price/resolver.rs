//! Tiered USD price resolution.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;
use rust_decimal::Decimal;

use super::cache::PriceCache;
use super::source::PriceSource;
use crate::errors::ExchangeError;

const QUOTE_CURRENCY: &str = "USD";

/// Resolves an asset's USD price on the day of a timestamp.
///
/// Tiers are consulted in order and the first positive price wins. A zero or
/// negative price counts as a tier failure. When every tier fails the
/// resolver returns [`ExchangeError::PriceUnavailable`], never zero.
pub struct PriceResolver {
    tiers: Vec<Arc<dyn PriceSource>>,
    cache: Arc<PriceCache>,
}

impl PriceResolver {
    pub fn new(tiers: Vec<Arc<dyn PriceSource>>, cache: Arc<PriceCache>) -> Self {
        Self { tiers, cache }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub async fn resolve(
        &self,
        asset: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<Decimal, ExchangeError> {
        let asset = asset.to_ascii_uppercase();
        let day = timestamp.date_naive();
        let today = Utc::now().date_naive();

        if let Some(price) = self.cache.get(&asset, QUOTE_CURRENCY, day, today) {
            return Ok(price);
        }

        for tier in &self.tiers {
            match tier.quote(&asset, day).await {
                Ok(price) if price > Decimal::ZERO => {
                    self.cache
                        .insert(&asset, QUOTE_CURRENCY, day, price, tier.tier());
                    return Ok(price);
                }
                Ok(price) => {
                    debug!(
                        "{:?} tier returned non-positive price {} for {} on {}",
                        tier.tier(),
                        price,
                        asset,
                        day
                    );
                }
                Err(err) => {
                    debug!("{:?} tier has no price for {} on {}: {}", tier.tier(), asset, day, err);
                }
            }
        }

        Err(ExchangeError::PriceUnavailable { asset, day })
    }
}
