//! Builds a [`SyncPlan`] from what an adapter declares.

use std::collections::BTreeMap;

use ledgersync_core::sync::{
    Capability, ChunkDirection, SyncMode, SyncPlan, SyncStep, TOTAL_WEIGHT_BPS,
};
use ledgersync_exchanges::AdapterCapabilities;

use crate::errors::Result;

/// Step order and relative weights.
const DEFAULT_STEPS: &[(Capability, u32)] = &[
    (Capability::Trades, 25),
    (Capability::Transfers, 10),
    (Capability::Deposits, 15),
    (Capability::Withdrawals, 15),
    (Capability::Conversions, 10),
    (Capability::Earnings, 15),
    (Capability::Dividends, 10),
    (Capability::Orders, 25),
];

pub fn step_label(capability: Capability) -> &'static str {
    match capability {
        Capability::Trades => "Trades",
        Capability::Orders => "Filled orders",
        Capability::Transfers => "Internal transfers",
        Capability::Deposits => "Deposits",
        Capability::Withdrawals => "Withdrawals",
        Capability::Conversions => "Conversions",
        Capability::Earnings => "Earnings",
        Capability::Dividends => "Dividends",
        Capability::Klines => "Klines",
    }
}

/// Schedules one step per declared ledger capability.
///
/// - Klines are never scheduled.
/// - Orders are scheduled only when the adapter has no trades capability,
///   since filled orders and trades describe the same fills.
/// - Deposits and withdrawals walk ascending in full mode; everything else
///   walks newest-first.
/// - Weights are normalized over the scheduled steps into basis points.
#[derive(Debug, Clone)]
pub struct SyncPlanBuilder {
    mode: SyncMode,
    weights: BTreeMap<Capability, u32>,
    required: Vec<Capability>,
}

impl SyncPlanBuilder {
    pub fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            weights: DEFAULT_STEPS.iter().copied().collect(),
            required: Vec::new(),
        }
    }

    /// Override the relative weight of a capability. Zero drops the step.
    pub fn with_weight(mut self, capability: Capability, weight: u32) -> Self {
        self.weights.insert(capability, weight);
        self
    }

    pub fn with_weights(mut self, weights: &BTreeMap<Capability, u32>) -> Self {
        self.weights.extend(weights.iter().map(|(c, w)| (*c, *w)));
        self
    }

    /// Mark a capability as required: its failure stops the run.
    pub fn with_required(mut self, capability: Capability) -> Self {
        self.required.push(capability);
        self
    }

    pub fn build(&self, capabilities: &AdapterCapabilities) -> Result<SyncPlan> {
        let has_trades = capabilities.supports(Capability::Trades);

        let scheduled: Vec<(Capability, u32, i64)> = DEFAULT_STEPS
            .iter()
            .map(|(capability, _)| *capability)
            .filter(|capability| !(*capability == Capability::Orders && has_trades))
            .filter_map(|capability| {
                let limits = capabilities.limits(capability)?;
                let weight = self.weights.get(&capability).copied().unwrap_or(0);
                (weight > 0).then(|| (capability, weight, limits.default_width.num_seconds()))
            })
            .collect();

        let bps = normalize_weights(
            &scheduled.iter().map(|(_, w, _)| *w).collect::<Vec<_>>(),
        );

        let steps = scheduled
            .into_iter()
            .zip(bps)
            .map(|((capability, _, width_secs), weight_bps)| SyncStep {
                id: capability.as_str().to_string(),
                label: step_label(capability).to_string(),
                capability,
                weight_bps,
                chunk_width_secs: width_secs,
                direction: self.direction_for(capability),
                required: self.required.contains(&capability),
            })
            .collect();

        Ok(SyncPlan::new(steps)?)
    }

    fn direction_for(&self, capability: Capability) -> ChunkDirection {
        match (self.mode, capability) {
            (SyncMode::Full, Capability::Deposits | Capability::Withdrawals) => {
                ChunkDirection::Ascending
            }
            _ => ChunkDirection::Descending,
        }
    }
}

/// Scale weights to basis points summing exactly to [`TOTAL_WEIGHT_BPS`].
/// Rounding leftovers go to the largest remainders, earliest first.
fn normalize_weights(weights: &[u32]) -> Vec<u32> {
    let total: u64 = weights.iter().map(|w| u64::from(*w)).sum();
    if total == 0 {
        return vec![0; weights.len()];
    }

    let scaled: Vec<(u32, u64)> = weights
        .iter()
        .map(|w| {
            let exact = u64::from(*w) * u64::from(TOTAL_WEIGHT_BPS);
            ((exact / total) as u32, exact % total)
        })
        .collect();

    let mut bps: Vec<u32> = scaled.iter().map(|(b, _)| *b).collect();
    let leftover = TOTAL_WEIGHT_BPS - bps.iter().sum::<u32>();

    let mut order: Vec<usize> = (0..scaled.len()).collect();
    order.sort_by(|a, b| scaled[*b].1.cmp(&scaled[*a].1).then(a.cmp(b)));
    for index in order.into_iter().take(leftover as usize) {
        bps[index] += 1;
    }
    bps
}
