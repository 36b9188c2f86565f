//! Error types for the sync crate.

use ledgersync_exchanges::ExchangeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] ledgersync_core::Error),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("A sync is already running for account '{0}'")]
    AlreadyRunning(String),

    #[error("Sync run '{0}' not found")]
    RunNotFound(String),
}
