//! Ledgersync Core - domain entities and storage contracts.
//!
//! This crate holds the credential vault, the canonical transaction model and
//! ledger store contract, and the sync plan / sync run models shared by the
//! exchange and orchestration crates. It is storage-agnostic: persistence is
//! behind traits with in-memory and file implementations.

pub mod credentials;
pub mod errors;
pub mod events;
pub mod sync;
pub mod transactions;

// Re-export error types
pub use errors::Error;
pub use errors::Result;
