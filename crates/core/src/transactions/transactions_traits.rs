use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::transactions_model::Transaction;
use crate::errors::{Error, Result};

/// Result of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppendAck {
    pub inserted: u64,
    /// Transactions whose id was already present.
    pub duplicates: u64,
}

/// Append-only ledger of normalized transactions.
///
/// Appends must be idempotent by transaction id: overlapping batches are
/// expected when chunks or runs overlap.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_transactions(
        &self,
        account_id: &str,
        transactions: Vec<Transaction>,
    ) -> Result<AppendAck>;
}

/// Ledger kept in process memory; used by the server and in tests.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    by_account: RwLock<HashMap<String, Vec<Transaction>>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self, account_id: &str) -> Vec<Transaction> {
        self.by_account
            .read()
            .map(|map| map.get(account_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn len(&self, account_id: &str) -> usize {
        self.transactions(account_id).len()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn append_transactions(
        &self,
        account_id: &str,
        transactions: Vec<Transaction>,
    ) -> Result<AppendAck> {
        let mut map = self
            .by_account
            .write()
            .map_err(|_| Error::Ledger("ledger lock poisoned".into()))?;
        let ledger = map.entry(account_id.to_string()).or_default();

        let mut ack = AppendAck::default();
        for tx in transactions {
            if tx.account_id != account_id {
                return Err(Error::Ledger(format!(
                    "transaction {} belongs to account {}, not {}",
                    tx.id, tx.account_id, account_id
                )));
            }
            if ledger.iter().any(|existing| existing.id == tx.id) {
                ack.duplicates += 1;
            } else {
                ledger.push(tx);
                ack.inserted += 1;
            }
        }
        Ok(ack)
    }
}
