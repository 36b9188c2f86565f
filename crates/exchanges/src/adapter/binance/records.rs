//! Field extraction for Binance payloads.

use chrono::{DateTime, Utc};
use ledgersync_core::sync::Capability;
use ledgersync_core::transactions::TransactionType;
use rust_decimal::Decimal;
use serde_json::Value;

use super::BINANCE_ID;
use crate::adapter::wire::{datetime_field, decimal_field, millis_field, string_field};
use crate::errors::ExchangeError;
use crate::models::{RawRecord, RecordFields};

/// Quote assets recognised when splitting a spot symbol. Longer suffixes that
/// contain shorter ones come first.
const QUOTE_ASSETS: &[&str] = &[
    "FDUSD", "USDT", "USDC", "BUSD", "TUSD", "BTC", "ETH", "BNB", "EUR", "TRY", "JPY", "USD",
];

/// Split "BTCUSDT" into ("BTC", "USDT").
pub(super) fn split_symbol(symbol: &str) -> Option<(String, String)> {
    QUOTE_ASSETS.iter().find_map(|quote| {
        symbol
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base.to_string(), quote.to_string()))
    })
}

/// Timestamp Binance attaches to a record of the given capability.
pub(super) fn record_time(capability: Capability, row: &Value) -> Option<DateTime<Utc>> {
    match capability {
        Capability::Trades => millis_field(row, "time"),
        Capability::Orders => millis_field(row, "updateTime").or_else(|| millis_field(row, "time")),
        Capability::Deposits => millis_field(row, "insertTime"),
        Capability::Withdrawals => {
            datetime_field(row, "applyTime").or_else(|| millis_field(row, "applyTime"))
        }
        Capability::Transfers => millis_field(row, "timestamp"),
        Capability::Conversions => millis_field(row, "createTime"),
        Capability::Earnings => millis_field(row, "time"),
        Capability::Dividends => millis_field(row, "divTime"),
        Capability::Klines => None,
    }
}

fn required<T>(value: Option<T>, field: &str) -> Result<T, ExchangeError> {
    value.ok_or_else(|| {
        ExchangeError::malformed_record(BINANCE_ID, format!("missing or invalid field '{field}'"))
    })
}

pub(super) fn extract(record: &RawRecord) -> Result<RecordFields, ExchangeError> {
    let row = &record.payload;
    let timestamp = required(record_time(record.capability, row), "timestamp")?;

    match record.capability {
        Capability::Trades => {
            let symbol = required(string_field(row, "symbol"), "symbol")?;
            let (base, quote) = required(split_symbol(&symbol), "symbol")?;
            let id = required(string_field(row, "id"), "id")?;
            let quantity = required(decimal_field(row, "qty"), "qty")?;
            let quote_quantity = decimal_field(row, "quoteQty").or_else(|| {
                decimal_field(row, "price").map(|price| price * quantity)
            });
            let is_buyer = required(row.get("isBuyer").and_then(Value::as_bool), "isBuyer")?;

            Ok(RecordFields {
                external_id: format!("{symbol}-{id}"),
                timestamp,
                kind: if is_buyer {
                    TransactionType::Buy
                } else {
                    TransactionType::Sell
                },
                asset: base,
                quantity: quantity.abs(),
                fee: decimal_field(row, "commission").unwrap_or(Decimal::ZERO).abs(),
                fee_asset: string_field(row, "commissionAsset"),
                counter_asset: Some(quote),
                counter_quantity: quote_quantity.map(|q| q.abs()),
            })
        }
        Capability::Orders => {
            let symbol = required(string_field(row, "symbol"), "symbol")?;
            let (base, quote) = required(split_symbol(&symbol), "symbol")?;
            let order_id = required(string_field(row, "orderId"), "orderId")?;
            let side = required(string_field(row, "side"), "side")?;
            let kind = match side.as_str() {
                "BUY" => TransactionType::Buy,
                "SELL" => TransactionType::Sell,
                other => {
                    return Err(ExchangeError::malformed_record(
                        BINANCE_ID,
                        format!("unknown order side '{other}'"),
                    ))
                }
            };

            Ok(RecordFields {
                external_id: format!("{symbol}-order-{order_id}"),
                timestamp,
                kind,
                asset: base,
                quantity: required(decimal_field(row, "executedQty"), "executedQty")?.abs(),
                fee: Decimal::ZERO,
                fee_asset: None,
                counter_asset: Some(quote),
                counter_quantity: decimal_field(row, "cummulativeQuoteQty").map(|q| q.abs()),
            })
        }
        Capability::Deposits => {
            let asset = required(string_field(row, "coin"), "coin")?;
            let id = string_field(row, "id").or_else(|| string_field(row, "txId"));
            Ok(RecordFields {
                external_id: required(id, "id")?,
                timestamp,
                kind: TransactionType::Deposit,
                asset,
                quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
                fee: Decimal::ZERO,
                fee_asset: None,
                counter_asset: None,
                counter_quantity: None,
            })
        }
        Capability::Withdrawals => {
            let asset = required(string_field(row, "coin"), "coin")?;
            Ok(RecordFields {
                external_id: required(string_field(row, "id"), "id")?,
                timestamp,
                kind: TransactionType::Withdrawal,
                fee: decimal_field(row, "transactionFee")
                    .unwrap_or(Decimal::ZERO)
                    .abs(),
                fee_asset: Some(asset.clone()),
                quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
                asset,
                counter_asset: None,
                counter_quantity: None,
            })
        }
        Capability::Transfers => Ok(RecordFields {
            external_id: required(string_field(row, "tranId"), "tranId")?,
            timestamp,
            kind: TransactionType::Transfer,
            asset: required(string_field(row, "asset"), "asset")?,
            quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
            fee: Decimal::ZERO,
            fee_asset: None,
            counter_asset: None,
            counter_quantity: None,
        }),
        Capability::Conversions => {
            let id = string_field(row, "orderId").or_else(|| string_field(row, "quoteId"));
            Ok(RecordFields {
                external_id: required(id, "orderId")?,
                timestamp,
                kind: TransactionType::Convert,
                asset: required(string_field(row, "toAsset"), "toAsset")?,
                quantity: required(decimal_field(row, "toAmount"), "toAmount")?.abs(),
                fee: Decimal::ZERO,
                fee_asset: None,
                counter_asset: Some(required(string_field(row, "fromAsset"), "fromAsset")?),
                counter_quantity: Some(
                    required(decimal_field(row, "fromAmount"), "fromAmount")?.abs(),
                ),
            })
        }
        Capability::Earnings => {
            let asset = required(string_field(row, "asset"), "asset")?;
            let amount = required(decimal_field(row, "amount"), "amount")?;
            // Staking records carry no id of their own.
            let external_id = string_field(row, "positionId")
                .map(|pos| format!("{pos}-{}", timestamp.timestamp_millis()))
                .unwrap_or_else(|| format!("{asset}-{}-{amount}", timestamp.timestamp_millis()));
            Ok(RecordFields {
                external_id,
                timestamp,
                kind: TransactionType::StakingReward,
                asset,
                quantity: amount.abs(),
                fee: Decimal::ZERO,
                fee_asset: None,
                counter_asset: None,
                counter_quantity: None,
            })
        }
        Capability::Dividends => Ok(RecordFields {
            external_id: required(string_field(row, "id"), "id")?,
            timestamp,
            kind: TransactionType::Dividend,
            asset: required(string_field(row, "asset"), "asset")?,
            quantity: required(decimal_field(row, "amount"), "amount")?.abs(),
            fee: Decimal::ZERO,
            fee_asset: None,
            counter_asset: None,
            counter_quantity: None,
        }),
        Capability::Klines => Err(ExchangeError::malformed_record(
            BINANCE_ID,
            "klines are not ledger records",
        )),
    }
}
