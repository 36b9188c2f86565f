//! Canonical transactions and the ledger store contract.

mod transactions_model;
mod transactions_traits;

pub use transactions_model::{compute_transaction_id, Transaction, TransactionType};
pub use transactions_traits::{AppendAck, InMemoryLedgerStore, LedgerStore};
