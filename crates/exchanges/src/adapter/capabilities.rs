//! Adapter capability declarations and rate limiting configuration.

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use chrono::Duration;
use ledgersync_core::sync::Capability;

/// Chunk widths an adapter accepts for one capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLimits {
    pub min_width: Duration,
    pub max_width: Duration,
    /// Width used when the plan does not ask for anything else.
    pub default_width: Duration,
}

impl ChunkLimits {
    /// Fixed width: min, max and default are all `width`.
    pub fn fixed(width: Duration) -> Self {
        Self {
            min_width: width,
            max_width: width,
            default_width: width,
        }
    }

    pub fn new(min_width: Duration, max_width: Duration, default_width: Duration) -> Self {
        Self {
            min_width,
            max_width,
            default_width,
        }
    }

    /// Clamp a requested width into `[min_width, max_width]`.
    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.max(self.min_width).min(self.max_width)
    }
}

/// What an adapter can do.
///
/// The plan builder only schedules steps for capabilities declared here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterCapabilities {
    chunks: BTreeMap<Capability, ChunkLimits>,
    /// How far back the source serves history.
    pub max_lookback: Duration,
}

impl AdapterCapabilities {
    pub fn new(max_lookback: Duration) -> Self {
        Self {
            chunks: BTreeMap::new(),
            max_lookback,
        }
    }

    pub fn with(mut self, capability: Capability, limits: ChunkLimits) -> Self {
        self.chunks.insert(capability, limits);
        self
    }

    pub fn without(mut self, capability: Capability) -> Self {
        self.chunks.remove(&capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.chunks.contains_key(&capability)
    }

    pub fn limits(&self, capability: Capability) -> Option<ChunkLimits> {
        self.chunks.get(&capability).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Capability, ChunkLimits)> + '_ {
        self.chunks.iter().map(|(c, l)| (*c, *l))
    }
}

/// Rate limiting configuration for an adapter.
///
/// Controls how aggressively one account may call one source.
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimit {
    /// Maximum requests allowed per minute.
    pub requests_per_minute: u32,

    /// Requests that may be issued back-to-back before pacing kicks in.
    pub burst_capacity: f64,

    /// Minimum delay between two requests.
    pub min_interval: StdDuration,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 1200,
            burst_capacity: 10.0,
            min_interval: StdDuration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_respects_bounds() {
        let limits = ChunkLimits::new(Duration::hours(1), Duration::days(7), Duration::days(1));
        assert_eq!(limits.clamp(Duration::minutes(5)), Duration::hours(1));
        assert_eq!(limits.clamp(Duration::days(30)), Duration::days(7));
        assert_eq!(limits.clamp(Duration::days(2)), Duration::days(2));
    }

    #[test]
    fn test_capability_set() {
        let caps = AdapterCapabilities::new(Duration::days(365))
            .with(Capability::Trades, ChunkLimits::fixed(Duration::days(1)))
            .with(Capability::Deposits, ChunkLimits::fixed(Duration::days(90)))
            .without(Capability::Deposits);

        assert!(caps.supports(Capability::Trades));
        assert!(!caps.supports(Capability::Deposits));
        assert_eq!(caps.iter().count(), 1);
    }
}
