//! Ledgersync sync crate.
//!
//! Turns an account's credential and its exchange adapter into ledger
//! transactions:
//! - [`plan`]: which steps run, in which order, with which weights
//! - [`pager`]: chunked, cursor-paginated fetching through the rate limiter
//! - [`normalizer`]: raw records to canonical transactions with USD values
//! - [`orchestrator`]: the run state machine
//! - [`service`]: background runs with start / status / cancel

pub mod errors;
pub mod normalizer;
pub mod orchestrator;
pub mod pager;
pub mod plan;
pub mod progress;
pub mod service;

#[cfg(test)]
mod test_support;

pub use errors::{Result, SyncError};
pub use orchestrator::{compute_sync_window, OrchestratorConfig, SyncOrchestrator};
pub use pager::{chunk_windows, PagerConfig};
pub use plan::SyncPlanBuilder;
pub use progress::{ProgressPublisher, DEFAULT_EVENT_CAPACITY};
pub use service::{SyncService, SyncStatusView};
