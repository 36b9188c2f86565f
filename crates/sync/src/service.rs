//! Start, observe and cancel sync runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ledgersync_core::sync::{StepError, StepOutcome, SyncGap, SyncMode, SyncRun, SyncRunStatus};
use ledgersync_exchanges::TimeWindow;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::errors::{Result, SyncError};
use crate::orchestrator::SyncOrchestrator;

/// Status snapshot of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusView {
    pub run_id: String,
    pub account_id: String,
    pub exchange_id: String,
    pub mode: SyncMode,
    pub status: SyncRunStatus,
    pub progress_percent: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub range_start: Option<DateTime<Utc>>,
    pub range_end: Option<DateTime<Utc>>,
    pub cancelled: bool,
    pub gaps: Vec<SyncGap>,
    pub errors: Vec<StepError>,
    pub steps: Vec<StepOutcome>,
}

impl From<SyncRun> for SyncStatusView {
    fn from(run: SyncRun) -> Self {
        Self {
            progress_percent: run.progress_percent(),
            run_id: run.run_id,
            account_id: run.account_id,
            exchange_id: run.exchange_id,
            mode: run.mode,
            status: run.status,
            started_at: run.started_at,
            finished_at: run.finished_at,
            range_start: run.range_start,
            range_end: run.range_end,
            cancelled: run.cancelled,
            gaps: run.gaps,
            errors: run.errors,
            steps: run.step_outcomes,
        }
    }
}

/// Runs syncs on background tasks, at most one per account.
#[derive(Clone)]
pub struct SyncService {
    orchestrator: Arc<SyncOrchestrator>,
    active_accounts: Arc<DashMap<String, String>>,
    cancel_flags: Arc<DashMap<String, Arc<AtomicBool>>>,
    handles: Arc<DashMap<String, JoinHandle<()>>>,
}

impl SyncService {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            orchestrator,
            active_accounts: Arc::new(DashMap::new()),
            cancel_flags: Arc::new(DashMap::new()),
            handles: Arc::new(DashMap::new()),
        }
    }

    /// Start a sync for the account and return its run id. Rejected while
    /// another run for the same account is in flight.
    pub async fn start_sync(&self, account_id: &str, mode: SyncMode) -> Result<String> {
        self.start_sync_with_range(account_id, mode, None).await
    }

    pub async fn start_sync_with_range(
        &self,
        account_id: &str,
        mode: SyncMode,
        range: Option<TimeWindow>,
    ) -> Result<String> {
        // Reserve the account before any await so two callers cannot both
        // pass the check.
        match self.active_accounts.entry(account_id.to_string()) {
            Entry::Occupied(_) => return Err(SyncError::AlreadyRunning(account_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(String::new());
            }
        }

        let run = match self.orchestrator.prepare(account_id, mode, range).await {
            Ok(run) => run,
            Err(err) => {
                self.active_accounts.remove(account_id);
                return Err(err);
            }
        };

        let run_id = run.run_id.clone();
        let cancel = Arc::new(AtomicBool::new(false));
        self.active_accounts
            .insert(account_id.to_string(), run_id.clone());
        self.cancel_flags.insert(run_id.clone(), cancel.clone());
        info!("Starting sync run {} for account {}", run_id, account_id);

        let service = self.clone();
        let account = account_id.to_string();
        let task_run_id = run_id.clone();
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let finished = service.orchestrator.execute(run, cancel).await;
            info!(
                "Sync run {} for account {} ended {:?}",
                finished.run_id, account, finished.status
            );
            service.active_accounts.remove(&account);
            service.cancel_flags.remove(&task_run_id);
            // The handle must be in the map before it can be dropped from it.
            let _ = registered_rx.await;
            service.handles.remove(&task_run_id);
        });
        self.handles.insert(run_id.clone(), handle);
        let _ = registered_tx.send(());

        Ok(run_id)
    }

    pub async fn get_sync_status(&self, run_id: &str) -> Result<SyncStatusView> {
        self.orchestrator
            .runs()
            .get(run_id)
            .await?
            .map(SyncStatusView::from)
            .ok_or_else(|| SyncError::RunNotFound(run_id.to_string()))
    }

    /// Request cancellation. Takes effect at the next chunk boundary.
    /// Returns `false` when the run already finished.
    pub async fn cancel_sync(&self, run_id: &str) -> Result<bool> {
        if let Some(flag) = self.cancel_flags.get(run_id) {
            flag.store(true, Ordering::SeqCst);
            info!("Cancellation requested for sync run {}", run_id);
            return Ok(true);
        }

        match self.orchestrator.runs().get(run_id).await? {
            Some(_) => Ok(false),
            None => Err(SyncError::RunNotFound(run_id.to_string())),
        }
    }

    /// Whether the account has a run in flight.
    pub fn is_running(&self, account_id: &str) -> bool {
        self.active_accounts.contains_key(account_id)
    }

    /// Wait for a run's task to end, then return its final status.
    pub async fn wait_for_completion(&self, run_id: &str) -> Result<SyncStatusView> {
        if let Some((_, handle)) = self.handles.remove(run_id) {
            if let Err(err) = handle.await {
                warn!("Sync task for run {} ended abnormally: {}", run_id, err);
            }
        }
        self.get_sync_status(run_id).await
    }
}
