//! Canonical transaction model.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::sync::Capability;

/// Canonical transaction type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
    Transfer,
    Convert,
    Income,
    StakingReward,
    Interest,
    Dividend,
    RealizedPnl,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Buy => "buy",
            TransactionType::Sell => "sell",
            TransactionType::Deposit => "deposit",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::Transfer => "transfer",
            TransactionType::Convert => "convert",
            TransactionType::Income => "income",
            TransactionType::StakingReward => "staking_reward",
            TransactionType::Interest => "interest",
            TransactionType::Dividend => "dividend",
            TransactionType::RealizedPnl => "realized_pnl",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(TransactionType::Buy),
            "sell" => Ok(TransactionType::Sell),
            "deposit" => Ok(TransactionType::Deposit),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            "transfer" => Ok(TransactionType::Transfer),
            "convert" => Ok(TransactionType::Convert),
            "income" => Ok(TransactionType::Income),
            "staking_reward" => Ok(TransactionType::StakingReward),
            "interest" => Ok(TransactionType::Interest),
            "dividend" => Ok(TransactionType::Dividend),
            "realized_pnl" => Ok(TransactionType::RealizedPnl),
            other => Err(Error::Validation(format!(
                "unknown transaction type '{other}'"
            ))),
        }
    }
}

/// A normalized ledger entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Stable id, see [`compute_transaction_id`].
    pub id: String,
    pub account_id: String,
    pub timestamp: DateTime<Utc>,
    pub transaction_type: TransactionType,
    pub asset: String,
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    /// Other leg of a trade or conversion.
    pub counter_asset: Option<String>,
    pub counter_quantity: Option<Decimal>,
    /// USD value of `quantity` at `timestamp`; `None` when no price tier
    /// could resolve it (see `price_resolution_failed`).
    pub usd_value: Option<Decimal>,
    #[serde(default)]
    pub price_resolution_failed: bool,
    /// Exchange id, e.g. "BINANCE".
    pub source: String,
    pub source_step: String,
    /// External record id as reported by the source.
    pub raw_ref: String,
}

/// Computes the canonical transaction id.
///
/// SHA-256 over account id, source, capability and the source's own record
/// id, so the same record fetched twice always maps to the same id.
pub fn compute_transaction_id(
    account_id: &str,
    source: &str,
    capability: Capability,
    external_id: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(capability.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(external_id.as_bytes());
    hex::encode(hasher.finalize())
}
