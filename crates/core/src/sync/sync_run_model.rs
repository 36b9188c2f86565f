//! Sync run domain models.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::sync_plan_model::TOTAL_WEIGHT_BPS;
use crate::errors::Error;
use crate::Result;

/// Lifecycle of a sync run. Terminal once it leaves `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncRunStatus {
    #[default]
    Pending,
    Running,
    Succeeded,
    /// No step could run.
    Failed,
    /// Some steps completed, others failed, left gaps or were not attempted.
    Partial,
}

impl SyncRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncRunStatus::Succeeded | SyncRunStatus::Failed | SyncRunStatus::Partial
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Resume from the last completed run's end.
    #[default]
    Incremental,
    /// Re-fetch the whole history.
    Full,
}

/// Failure taxonomy recorded against steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncErrorKind {
    TransientNetwork,
    SourceRateLimited,
    SourceAuthRejected,
    ClockSkewRejected,
    CredentialCorruptOrMismatched,
    /// No credential is stored for the account, or the store could not be read.
    CredentialUnavailable,
    PriceUnavailable,
    MalformedRecord,
    /// The ledger store rejected an append.
    LedgerWriteFailed,
    /// The run could not be set up, e.g. unknown exchange or nothing to schedule.
    SetupFailed,
}

/// Why a chunk window was left unsynced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GapCause {
    /// Retries were exhausted on a retryable error.
    RetriesExhausted,
    /// The response could not be parsed at all.
    MalformedResponse,
    /// The source returned a cursor it had already returned.
    PaginationStalled,
    /// The per-chunk page cap was hit.
    PageLimitReached,
}

/// A window the run could not fetch. Re-running the sync retries it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncGap {
    pub step_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub cause: GapCause,
    pub kind: Option<SyncErrorKind>,
    pub message: String,
}

/// A fatal condition recorded against a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub step_id: String,
    pub kind: SyncErrorKind,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    NotAttempted,
    Succeeded,
    /// Every chunk was attempted but at least one became a gap.
    CompletedWithGaps,
    Failed,
    /// Stopped between chunks by a cancel request.
    Cancelled,
}

impl StepStatus {
    pub fn was_attempted(&self) -> bool {
        !matches!(self, StepStatus::NotAttempted)
    }
}

/// Per-step result counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub label: String,
    pub status: StepStatus,
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub chunks_total: u64,
    pub chunks_done: u64,
}

impl StepOutcome {
    pub fn not_attempted(step_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            label: label.into(),
            ..Default::default()
        }
    }
}

/// Run-wide counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunSummary {
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    pub skipped: u64,
    /// Transactions appended without a USD value.
    pub price_unavailable: u64,
}

/// One sync of one account. Mutated only by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub run_id: String,
    pub account_id: String,
    pub exchange_id: String,
    pub mode: SyncMode,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub current_step: usize,
    /// Cumulative progress in basis points.
    pub progress_bps: u32,
    pub cancelled: bool,
    pub errors: Vec<StepError>,
    pub gaps: Vec<SyncGap>,
    pub step_outcomes: Vec<StepOutcome>,
    pub summary: SyncRunSummary,
}

impl SyncRun {
    pub fn new(account_id: String, exchange_id: String, mode: SyncMode) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            account_id,
            exchange_id,
            mode,
            status: SyncRunStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            range_start: None,
            range_end: None,
            current_step: 0,
            progress_bps: 0,
            cancelled: false,
            errors: Vec::new(),
            gaps: Vec::new(),
            step_outcomes: Vec::new(),
            summary: SyncRunSummary::default(),
        }
    }

    /// Move to `Running` over the given range.
    pub fn start(&mut self, range_start: DateTime<Utc>, range_end: DateTime<Utc>) {
        self.status = SyncRunStatus::Running;
        self.range_start = Some(range_start);
        self.range_end = Some(range_end);
    }

    /// Raise progress; never lowers it.
    pub fn advance_progress(&mut self, bps: u32) {
        self.progress_bps = self.progress_bps.max(bps.min(TOTAL_WEIGHT_BPS));
    }

    pub fn progress_percent(&self) -> f64 {
        f64::from(self.progress_bps) / 100.0
    }

    pub fn finish(&mut self, status: SyncRunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Where an incremental run after this one should start.
    ///
    /// A succeeded run resumes at its end. A partial run resumes at its
    /// earliest gap when every step ran to completion, otherwise at its
    /// start so nothing it skipped is lost.
    pub fn resume_point(&self) -> Option<DateTime<Utc>> {
        match self.status {
            SyncRunStatus::Succeeded => self.range_end,
            SyncRunStatus::Partial => {
                let every_step_completed = !self.cancelled
                    && self.step_outcomes.iter().all(|outcome| {
                        matches!(
                            outcome.status,
                            StepStatus::Succeeded | StepStatus::CompletedWithGaps
                        )
                    });
                if !every_step_completed {
                    return self.range_start;
                }
                self.gaps
                    .iter()
                    .map(|gap| gap.window_start)
                    .min()
                    .or(self.range_end)
            }
            _ => None,
        }
    }
}

/// Persistence for sync runs.
#[async_trait]
pub trait SyncRunRepository: Send + Sync {
    /// Insert or replace a run.
    async fn save(&self, run: &SyncRun) -> Result<()>;

    async fn get(&self, run_id: &str) -> Result<Option<SyncRun>>;

    /// Most recent `Succeeded` or `Partial` run for the account. Callers
    /// resume from [`SyncRun::resume_point`], not from its end.
    async fn latest_completed(&self, account_id: &str) -> Result<Option<SyncRun>>;
}

#[derive(Debug, Default)]
pub struct InMemorySyncRunRepository {
    runs: RwLock<HashMap<String, SyncRun>>,
}

impl InMemorySyncRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncRunRepository for InMemorySyncRunRepository {
    async fn save(&self, run: &SyncRun) -> Result<()> {
        let mut runs = self
            .runs
            .write()
            .map_err(|_| Error::Repository("sync run lock poisoned".into()))?;
        runs.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get(&self, run_id: &str) -> Result<Option<SyncRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| Error::Repository("sync run lock poisoned".into()))?;
        Ok(runs.get(run_id).cloned())
    }

    async fn latest_completed(&self, account_id: &str) -> Result<Option<SyncRun>> {
        let runs = self
            .runs
            .read()
            .map_err(|_| Error::Repository("sync run lock poisoned".into()))?;
        Ok(runs
            .values()
            .filter(|run| run.account_id == account_id)
            .filter(|run| {
                matches!(
                    run.status,
                    SyncRunStatus::Succeeded | SyncRunStatus::Partial
                )
            })
            .filter(|run| run.range_end.is_some())
            .max_by_key(|run| run.finished_at)
            .cloned())
    }
}
