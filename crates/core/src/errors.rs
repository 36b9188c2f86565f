//! Core error types for Ledgersync.
//!
//! Storage-agnostic errors shared by the vault, the ledger contract and the
//! sync run repository. Exchange and orchestration crates wrap these.

use thiserror::Error;

/// Type alias for Result using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Root error type for the core crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Decryption or deserialization of a stored credential failed, or the
    /// record's scheme tag does not belong to its credential class.
    ///
    /// Never conflated with a source rejecting a key; that surfaces later as an
    /// adapter authentication failure.
    #[error("Credential for account '{account_id}' is corrupt or mismatched: {reason}")]
    CredentialCorruptOrMismatched { account_id: String, reason: String },

    #[error("No credential stored for account '{0}'")]
    CredentialNotFound(String),

    #[error("Secret store error: {0}")]
    Secret(String),

    #[error("Ledger store error: {0}")]
    Ledger(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Input validation failed: {0}")]
    Validation(String),

    #[error("Invalid configuration value: {0}")]
    InvalidConfigValue(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Convenience constructor for vault failures.
    pub fn credential_corrupt(account_id: &str, reason: impl Into<String>) -> Self {
        Self::CredentialCorruptOrMismatched {
            account_id: account_id.to_string(),
            reason: reason.into(),
        }
    }
}
