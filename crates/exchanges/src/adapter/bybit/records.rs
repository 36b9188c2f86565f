//! Field extraction for Bybit v5 payloads.

use chrono::{DateTime, Utc};
use ledgersync_core::sync::Capability;
use ledgersync_core::transactions::TransactionType;
use rust_decimal::Decimal;
use serde_json::Value;

use super::BYBIT_ID;
use crate::adapter::wire::{decimal_field, millis_field, string_field};
use crate::errors::ExchangeError;
use crate::models::{RawRecord, RecordFields};

const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "USDE", "BTC", "ETH", "EUR", "DAI", "USD"];

pub(super) fn split_symbol(symbol: &str) -> Option<(String, String)> {
    QUOTE_ASSETS.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base.to_string(), quote.to_string()))
    })
}

pub(super) fn record_time(capability: Capability, row: &Value) -> Option<DateTime<Utc>> {
    match capability {
        Capability::Trades => millis_field(row, "execTime"),
        Capability::Orders => millis_field(row, "updatedTime"),
        Capability::Deposits => millis_field(row, "successAt"),
        Capability::Withdrawals => millis_field(row, "createTime"),
        Capability::Transfers => millis_field(row, "timestamp"),
        _ => None,
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ExchangeError> {
    value.ok_or_else(|| {
        ExchangeError::malformed_record(BYBIT_ID, format!("missing or invalid field '{field}'"))
    })
}

fn side(row: &Value) -> Result<TransactionType, ExchangeError> {
    match required(string_field(row, "side"), "side")?.as_str() {
        "Buy" => Ok(TransactionType::Buy),
        "Sell" => Ok(TransactionType::Sell),
        other => Err(ExchangeError::malformed_record(
            BYBIT_ID,
            format!("unknown side '{other}'"),
        )),
    }
}

pub(super) fn extract(record: &RawRecord) -> Result<RecordFields, ExchangeError> {
    let row = &record.payload;
    let timestamp = required(record_time(record.capability, row), "timestamp")?;

    match record.capability {
        Capability::Trades => {
            let symbol = required(string_field(row, "symbol"), "symbol")?;
            let (base, quote) = required(split_symbol(&symbol), "symbol")?;
            Ok(RecordFields {
                external_id: required(string_field(row, "execId"), "execId")?,
                timestamp,
                kind: side(row)?,
                asset: base,
                quantity: required(decimal_field(row, "execQty"), "execQty")?.abs(),
                fee: decimal_field(row, "execFee").unwrap_or(Decimal::ZERO).abs(),
                fee_asset: string_field(row, "feeCurrency"),
                counter_asset: Some(quote),
                counter_quantity: decimal_field(row, "execValue").map(|v| v.abs()),
            })
        }
        Capability::Orders => {
            let symbol = required(string_field(row, "symbol"), "symbol")?;
            let (base, quote) = required(split_symbol(&symbol), "symbol")?;
            Ok(RecordFields {
                external_id: required(string_field(row, "orderId"), "orderId")?,
                timestamp,
                kind: side(row)?,
                asset: base,
                quantity: required(decimal_field(row, "cumExecQty"), "cumExecQty")?.abs(),
                fee: decimal_field(row, "cumExecFee").unwrap_or(Decimal::ZERO).abs(),
                fee_asset: None,
                counter_asset: Some(quote),
                counter_quantity: decimal_field(row, "cumExecValue").map(|v| v.abs()),
            })
        }
        Capability::Deposits => {
            let coin = required(string_field(row, "coin"), "coin")?;
            let id = string_field(row, "id")
                .or_else(|| string_field(row, "txID").map(|tx| format!("{coin}-{tx}")));
            Ok(RecordFields {
                external_id: required(id, "id")?,
                timestamp,
                kind: TransactionType::Deposit,
                asset: coin,
                quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
                fee: Decimal::ZERO,
                fee_asset: None,
                counter_asset: None,
                counter_quantity: None,
            })
        }
        Capability::Withdrawals => {
            let coin = required(string_field(row, "coin"), "coin")?;
            Ok(RecordFields {
                external_id: required(string_field(row, "withdrawId"), "withdrawId")?,
                timestamp,
                kind: TransactionType::Withdrawal,
                quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
                fee: decimal_field(row, "withdrawFee").unwrap_or(Decimal::ZERO).abs(),
                fee_asset: Some(coin.clone()),
                asset: coin,
                counter_asset: None,
                counter_quantity: None,
            })
        }
        Capability::Transfers => Ok(RecordFields {
            external_id: required(string_field(row, "transferId"), "transferId")?,
            timestamp,
            kind: TransactionType::Transfer,
            asset: required(string_field(row, "coin"), "coin")?,
            quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
            fee: Decimal::ZERO,
            fee_asset: None,
            counter_asset: None,
            counter_quantity: None,
        }),
        other => Err(ExchangeError::malformed_record(
            BYBIT_ID,
            format!("{other} records are not produced by this adapter"),
        )),
    }
}
