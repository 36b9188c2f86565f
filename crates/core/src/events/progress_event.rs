//! Sync progress event payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::{SyncRun, SyncRunStatus};

/// What triggered a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressPhase {
    RunStarted,
    StepStarted,
    ChunkCompleted,
    StepFinished,
    RunFinished,
}

/// Progress update for one sync run.
///
/// `progress_percent` is monotone per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgressEvent {
    pub run_id: String,
    pub account_id: String,
    pub phase: ProgressPhase,
    pub step_id: Option<String>,
    pub step_label: Option<String>,
    pub progress_percent: f64,
    pub status: SyncRunStatus,
    pub message: Option<String>,
    pub emitted_at: DateTime<Utc>,
}

impl SyncProgressEvent {
    /// Snapshot of a run at the given phase.
    pub fn from_run(run: &SyncRun, phase: ProgressPhase) -> Self {
        Self {
            run_id: run.run_id.clone(),
            account_id: run.account_id.clone(),
            phase,
            step_id: None,
            step_label: None,
            progress_percent: run.progress_percent(),
            status: run.status,
            message: None,
            emitted_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>, label: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self.step_label = Some(label.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
