//! Maps raw source records onto canonical [`Transaction`]s.

use ledgersync_core::sync::Capability;
use ledgersync_core::transactions::{compute_transaction_id, Transaction, TransactionType};
use ledgersync_exchanges::{ExchangeAdapter, PriceResolver, RawRecord, RecordFields};
use log::{debug, warn};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};

/// Transaction types a capability may produce. Anything else is skipped.
pub fn allowed_types(capability: Capability) -> &'static [TransactionType] {
    match capability {
        Capability::Trades | Capability::Orders => &[
            TransactionType::Buy,
            TransactionType::Sell,
            TransactionType::RealizedPnl,
        ],
        Capability::Transfers => &[TransactionType::Transfer],
        Capability::Deposits => &[TransactionType::Deposit],
        Capability::Withdrawals => &[TransactionType::Withdrawal],
        Capability::Conversions => &[TransactionType::Convert],
        Capability::Earnings => &[
            TransactionType::Income,
            TransactionType::StakingReward,
            TransactionType::Interest,
        ],
        Capability::Dividends => &[TransactionType::Dividend],
        Capability::Klines => &[],
    }
}

/// Output of normalizing one chunk.
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub transactions: Vec<Transaction>,
    /// Records that could not be mapped.
    pub skipped: u64,
    /// Transactions emitted without a USD value.
    pub price_unavailable: u64,
}

pub struct Normalizer<'a> {
    pub adapter: &'a dyn ExchangeAdapter,
    pub resolver: &'a PriceResolver,
    pub account_id: &'a str,
}

impl Normalizer<'_> {
    /// Normalize every record of a chunk. Malformed records are counted and
    /// skipped; a missing price never drops a record.
    pub async fn normalize(&self, capability: Capability, records: &[RawRecord]) -> NormalizedBatch {
        let mut batch = NormalizedBatch::default();

        for record in records {
            let fields = match self.adapter.extract(record) {
                Ok(fields) => fields,
                Err(err) => {
                    warn!("{} {}: skipping record: {}", self.adapter.id(), capability, err);
                    batch.skipped += 1;
                    continue;
                }
            };

            if !allowed_types(capability).contains(&fields.kind) {
                warn!(
                    "{} {}: skipping record of type {}",
                    self.adapter.id(),
                    capability,
                    fields.kind
                );
                batch.skipped += 1;
                continue;
            }
            if fields.quantity < Decimal::ZERO || fields.asset.trim().is_empty() {
                warn!(
                    "{} {}: skipping record '{}' with invalid asset or quantity",
                    self.adapter.id(),
                    capability,
                    fields.external_id
                );
                batch.skipped += 1;
                continue;
            }

            let transaction = self.build(capability, record, fields).await;
            if transaction.price_resolution_failed {
                batch.price_unavailable += 1;
            }
            batch.transactions.push(transaction);
        }

        batch
    }

    async fn build(
        &self,
        capability: Capability,
        record: &RawRecord,
        fields: RecordFields,
    ) -> Transaction {
        let external_id = if fields.external_id.trim().is_empty() {
            payload_digest(record)
        } else {
            fields.external_id
        };
        let source = self.adapter.id();

        let (usd_value, price_resolution_failed) =
            match self.resolver.resolve(&fields.asset, fields.timestamp).await {
                Ok(price) => (Some((price * fields.quantity).normalize()), false),
                Err(err) => {
                    debug!("No USD value for {} record '{}': {}", source, external_id, err);
                    (None, true)
                }
            };

        Transaction {
            id: compute_transaction_id(self.account_id, source, capability, &external_id),
            account_id: self.account_id.to_string(),
            timestamp: fields.timestamp,
            transaction_type: fields.kind,
            asset: fields.asset.to_ascii_uppercase(),
            quantity: fields.quantity,
            fee: fields.fee,
            fee_asset: fields.fee_asset,
            counter_asset: fields.counter_asset,
            counter_quantity: fields.counter_quantity,
            usd_value,
            price_resolution_failed,
            source: source.to_string(),
            source_step: capability.as_str().to_string(),
            raw_ref: external_id,
        }
    }
}

/// Content hash used as the external id when a source omits one.
fn payload_digest(record: &RawRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}
