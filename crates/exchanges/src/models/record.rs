use chrono::{DateTime, Utc};
use ledgersync_core::sync::Capability;
use ledgersync_core::transactions::TransactionType;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One item as returned by a source, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRecord {
    pub exchange: String,
    pub capability: Capability,
    pub payload: Value,
}

impl RawRecord {
    pub fn new(exchange: &str, capability: Capability, payload: Value) -> Self {
        Self {
            exchange: exchange.to_string(),
            capability,
            payload,
        }
    }
}

/// One page of a paginated capability call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<RawRecord>,
    /// Opaque continuation token; `None` when the window is exhausted.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn last(items: Vec<RawRecord>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }

    pub fn with_cursor(items: Vec<RawRecord>, cursor: impl Into<String>) -> Self {
        Self {
            items,
            next_cursor: Some(cursor.into()),
        }
    }
}

/// Source-specific fields pulled out of a [`RawRecord`], consumed by the
/// generic normalizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFields {
    pub external_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TransactionType,
    pub asset: String,
    /// Always non-negative; direction is carried by `kind`.
    pub quantity: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub counter_asset: Option<String>,
    pub counter_quantity: Option<Decimal>,
}

/// Daily candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}
