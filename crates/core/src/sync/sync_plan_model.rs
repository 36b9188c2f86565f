//! Sync plan domain models.

use std::collections::HashSet;
use std::fmt;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// Total weight of a plan in basis points (100%).
pub const TOTAL_WEIGHT_BPS: u32 = 10_000;

/// Capability an exchange adapter may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Trades,
    Orders,
    Transfers,
    Deposits,
    Withdrawals,
    Conversions,
    Earnings,
    Dividends,
    /// Candle history. Consumed by the price resolver, never scheduled as a step.
    Klines,
}

impl Capability {
    pub const ALL: [Capability; 9] = [
        Capability::Trades,
        Capability::Orders,
        Capability::Transfers,
        Capability::Deposits,
        Capability::Withdrawals,
        Capability::Conversions,
        Capability::Earnings,
        Capability::Dividends,
        Capability::Klines,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Trades => "trades",
            Capability::Orders => "orders",
            Capability::Transfers => "transfers",
            Capability::Deposits => "deposits",
            Capability::Withdrawals => "withdrawals",
            Capability::Conversions => "conversions",
            Capability::Earnings => "earnings",
            Capability::Dividends => "dividends",
            Capability::Klines => "klines",
        }
    }

    /// Whether this capability produces ledger records.
    pub fn is_ledger_capability(&self) -> bool {
        !matches!(self, Capability::Klines)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order in which a step walks its chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChunkDirection {
    Ascending,
    /// Newest chunk first.
    #[default]
    Descending,
}

/// One step of a sync plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStep {
    pub id: String,
    pub label: String,
    pub capability: Capability,
    /// Share of total progress, in basis points.
    pub weight_bps: u32,
    /// Chunk width in seconds.
    pub chunk_width_secs: i64,
    pub direction: ChunkDirection,
    /// A failure in a required step stops the run.
    pub required: bool,
}

impl SyncStep {
    pub fn chunk_width(&self) -> Duration {
        Duration::seconds(self.chunk_width_secs)
    }
}

/// Immutable, ordered list of steps whose weights sum to [`TOTAL_WEIGHT_BPS`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    steps: Vec<SyncStep>,
}

impl SyncPlan {
    pub fn new(steps: Vec<SyncStep>) -> Result<Self> {
        if steps.is_empty() {
            return Err(Error::Validation("sync plan has no steps".into()));
        }

        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.id.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if !step.capability.is_ledger_capability() {
                return Err(Error::Validation(format!(
                    "capability '{}' cannot be scheduled as a step",
                    step.capability
                )));
            }
            if step.chunk_width_secs <= 0 {
                return Err(Error::Validation(format!(
                    "step '{}' has a non-positive chunk width",
                    step.id
                )));
            }
        }

        let total: u32 = steps.iter().map(|s| s.weight_bps).sum();
        if total != TOTAL_WEIGHT_BPS {
            return Err(Error::Validation(format!(
                "step weights sum to {} bps, expected {}",
                total, TOTAL_WEIGHT_BPS
            )));
        }

        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[SyncStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of the weights of every step before `index`.
    pub fn weight_before(&self, index: usize) -> u32 {
        self.steps.iter().take(index).map(|s| s.weight_bps).sum()
    }
}
