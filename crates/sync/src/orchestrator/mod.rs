//! Runs one sync of one account from plan to terminal status.
//!
//! A run moves `Pending -> Running -> {Succeeded, Failed, Partial}`. Steps
//! run in plan order and chunks inside a step run sequentially through the
//! shared rate limiter. Progress only ever moves forward. A failed step
//! contributes only its completed chunks; 100% is reported for a succeeded
//! run or a partial one in which every step was attempted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use ledgersync_core::credentials::CredentialVault;
use ledgersync_core::events::{ProgressPhase, ProgressSink, SyncProgressEvent};
use ledgersync_core::sync::{
    Capability, StepError, StepOutcome, StepStatus, SyncErrorKind, SyncGap, SyncMode, SyncPlan,
    SyncRun, SyncRunRepository, SyncRunStatus, TOTAL_WEIGHT_BPS,
};
use ledgersync_core::transactions::LedgerStore;
use ledgersync_exchanges::config::DEFAULT_REQUEST_TIMEOUT;
use ledgersync_exchanges::{
    limiter_key, AdapterFactory, ExchangeAdapter, ExchangeConfig, ExchangeError, KlinePriceSource,
    PriceCache, PriceResolver, PriceSource, RateLimiter, StablecoinTable, TimeWindow,
};
use log::{debug, error, info, warn};

use crate::errors::{Result, SyncError};
use crate::normalizer::Normalizer;
use crate::pager::{chunk_windows, ChunkFailure, ChunkPager, PagerConfig};
use crate::plan::SyncPlanBuilder;
use crate::progress::step_progress_bps;

#[cfg(test)]
mod tests;

/// Step id recorded against failures that happen before any step runs.
pub const SETUP_STEP_ID: &str = "setup";
/// Step id recorded against credential preflight failures.
pub const VAULT_STEP_ID: &str = "vault";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub pager: PagerConfig,
    /// How far back a full sync reaches when the source cannot report the
    /// account's earliest activity.
    pub default_lookback: Duration,
    /// Re-fetched slice before the last run's end in incremental mode.
    pub incremental_overlap: Duration,
    pub request_timeout: std::time::Duration,
    /// Overrides of the default relative step weights.
    pub step_weights: BTreeMap<Capability, u32>,
    /// Capabilities whose failure stops the run.
    pub required: Vec<Capability>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pager: PagerConfig::default(),
            default_lookback: Duration::days(365),
            incremental_overlap: Duration::days(1),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            step_weights: BTreeMap::new(),
            required: Vec::new(),
        }
    }
}

/// Compute the range a run covers.
///
/// An explicit request wins. Otherwise incremental mode resumes from the
/// last completed run's end minus the overlap, and full mode (or an
/// incremental run with no history) starts at the earliest known activity
/// or `default_lookback` ago. The start is never earlier than the source's
/// max lookback and the end never later than `now`.
pub fn compute_sync_window(
    mode: SyncMode,
    now: DateTime<Utc>,
    requested: Option<TimeWindow>,
    last_completed_end: Option<DateTime<Utc>>,
    earliest_activity: Option<DateTime<Utc>>,
    max_lookback: Duration,
    config: &OrchestratorConfig,
) -> TimeWindow {
    let floor = now - max_lookback;

    let (start, end) = match requested {
        Some(window) => (window.start, window.end.min(now)),
        None => {
            let resume = match mode {
                SyncMode::Incremental => {
                    last_completed_end.map(|end| end - config.incremental_overlap)
                }
                SyncMode::Full => None,
            };
            let start = resume
                .or(earliest_activity)
                .unwrap_or(now - config.default_lookback);
            (start, now)
        }
    };

    let start = start.max(floor);
    TimeWindow::new(start.min(end), end)
}

/// Everything a run needs once setup succeeded.
struct RunContext {
    adapter: Arc<dyn ExchangeAdapter>,
    limiter_key: String,
    plan: SyncPlan,
    window: TimeWindow,
    resolver: PriceResolver,
}

/// Failure before the first step.
struct SetupFailure {
    step_id: &'static str,
    kind: SyncErrorKind,
    message: String,
}

impl SetupFailure {
    fn from_error(err: SyncError) -> Self {
        match err {
            SyncError::Core(ledgersync_core::Error::CredentialCorruptOrMismatched { .. })
            | SyncError::Exchange(ExchangeError::Credential(
                ledgersync_core::Error::CredentialCorruptOrMismatched { .. },
            )) => Self {
                step_id: VAULT_STEP_ID,
                kind: SyncErrorKind::CredentialCorruptOrMismatched,
                message: err.to_string(),
            },
            SyncError::Core(ledgersync_core::Error::CredentialNotFound(_))
            | SyncError::Exchange(ExchangeError::Credential(_)) => Self {
                step_id: VAULT_STEP_ID,
                kind: SyncErrorKind::CredentialUnavailable,
                message: err.to_string(),
            },
            other => Self {
                step_id: SETUP_STEP_ID,
                kind: SyncErrorKind::SetupFailed,
                message: other.to_string(),
            },
        }
    }
}

pub struct SyncOrchestrator {
    vault: Arc<CredentialVault>,
    factory: Arc<dyn AdapterFactory>,
    ledger: Arc<dyn LedgerStore>,
    runs: Arc<dyn SyncRunRepository>,
    sink: Arc<dyn ProgressSink>,
    limiter: Arc<RateLimiter>,
    price_fallbacks: Vec<Arc<dyn PriceSource>>,
    price_cache: Arc<PriceCache>,
    config: OrchestratorConfig,
}

impl SyncOrchestrator {
    pub fn new(
        vault: Arc<CredentialVault>,
        factory: Arc<dyn AdapterFactory>,
        ledger: Arc<dyn LedgerStore>,
        runs: Arc<dyn SyncRunRepository>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            vault,
            factory,
            ledger,
            runs,
            sink,
            limiter: Arc::new(RateLimiter::new()),
            price_fallbacks: Vec::new(),
            price_cache: Arc::new(PriceCache::default()),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a limiter with other orchestrators in the process.
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Price tiers consulted after the kline and stablecoin tiers.
    pub fn with_price_fallbacks(mut self, sources: Vec<Arc<dyn PriceSource>>) -> Self {
        self.price_fallbacks = sources;
        self
    }

    pub fn with_price_cache(mut self, cache: Arc<PriceCache>) -> Self {
        self.price_cache = cache;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn runs(&self) -> &Arc<dyn SyncRunRepository> {
        &self.runs
    }

    /// Create and persist a `Pending` run for the account.
    pub async fn prepare(
        &self,
        account_id: &str,
        mode: SyncMode,
        requested: Option<TimeWindow>,
    ) -> Result<SyncRun> {
        if let Some(window) = requested {
            if window.is_empty() {
                return Err(ledgersync_core::Error::Validation(format!(
                    "requested range [{}, {}) is empty",
                    window.start, window.end
                ))
                .into());
            }
        }

        let metadata = self.vault.metadata(account_id)?;
        let mut run = SyncRun::new(
            account_id.to_string(),
            metadata.exchange_id.to_ascii_uppercase(),
            mode,
        );
        if let Some(window) = requested {
            run.range_start = Some(window.start);
            run.range_end = Some(window.end);
        }

        self.runs.save(&run).await?;
        Ok(run)
    }

    /// Prepare and execute in one go.
    pub async fn run(&self, account_id: &str, mode: SyncMode) -> Result<SyncRun> {
        let run = self.prepare(account_id, mode, None).await?;
        Ok(self.execute(run, Arc::new(AtomicBool::new(false))).await)
    }

    /// Drive a prepared run to a terminal status. Never fails: every problem
    /// ends up recorded on the returned run.
    pub async fn execute(&self, mut run: SyncRun, cancel: Arc<AtomicBool>) -> SyncRun {
        let requested = match (run.range_start, run.range_end) {
            (Some(start), Some(end)) => Some(TimeWindow::new(start, end)),
            _ => None,
        };

        let context = match self.setup(&run, requested).await {
            Ok(context) => context,
            Err(err) => {
                let failure = SetupFailure::from_error(err);
                return self.fail_setup(run, requested, failure).await;
            }
        };

        run.start(context.window.start, context.window.end);
        run.step_outcomes = context
            .plan
            .steps()
            .iter()
            .map(|step| StepOutcome::not_attempted(&step.id, &step.label))
            .collect();
        info!(
            "Sync run {} started for account {} on {} ({:?}, [{}, {}), {} steps)",
            run.run_id,
            run.account_id,
            run.exchange_id,
            run.mode,
            context.window.start,
            context.window.end,
            context.plan.len()
        );
        self.save(&run).await;
        self.emit(&run, ProgressPhase::RunStarted, None);

        for index in 0..context.plan.len() {
            if cancel.load(Ordering::SeqCst) {
                run.cancelled = true;
                break;
            }

            let status = self.run_step(&context, &mut run, index, &cancel).await;
            let step = &context.plan.steps()[index];

            // Failed steps keep only their completed-chunk share.
            if matches!(status, StepStatus::Succeeded | StepStatus::CompletedWithGaps) {
                run.advance_progress(context.plan.weight_before(index + 1));
            }
            self.save(&run).await;
            self.sink.emit(
                SyncProgressEvent::from_run(&run, ProgressPhase::StepFinished)
                    .with_step(&step.id, &step.label)
                    .with_message(format!("{status:?}")),
            );

            if status == StepStatus::Cancelled {
                run.cancelled = true;
                break;
            }
            if status == StepStatus::Failed && step.required {
                warn!(
                    "Required step '{}' failed, stopping run {}",
                    step.id, run.run_id
                );
                break;
            }
        }

        let status = final_status(&run);
        if status == SyncRunStatus::Succeeded
            || (status == SyncRunStatus::Partial && fully_attempted(&run))
        {
            run.advance_progress(TOTAL_WEIGHT_BPS);
        }
        run.finish(status);
        info!(
            "Sync run {} finished: {:?} ({} inserted, {} duplicates, {} skipped, {} gaps)",
            run.run_id,
            run.status,
            run.summary.inserted,
            run.summary.duplicates,
            run.summary.skipped,
            run.gaps.len()
        );
        self.save(&run).await;
        self.emit(&run, ProgressPhase::RunFinished, None);
        run
    }

    async fn setup(&self, run: &SyncRun, requested: Option<TimeWindow>) -> Result<RunContext> {
        // Decrypt once up front so a corrupt vault record fails the run
        // before any source call.
        let credential = self.vault.load(&run.account_id)?;
        let metadata = self.vault.metadata(&run.account_id)?;

        let exchange_config = ExchangeConfig::from_metadata(&metadata)
            .with_request_timeout(self.config.request_timeout);
        let adapter = self.factory.create(&run.exchange_id, &exchange_config)?;
        let key = limiter_key(&run.account_id, adapter.id());
        self.limiter.configure(&key, adapter.rate_limit());

        if adapter.requires_clock_sync() {
            if let Err(err) = adapter.sync_clock().await {
                warn!("{} clock sync failed, continuing: {}", adapter.id(), err);
            }
        }

        let capabilities = adapter.capabilities();
        let plan = self
            .config
            .required
            .iter()
            .fold(
                SyncPlanBuilder::new(run.mode).with_weights(&self.config.step_weights),
                |builder, capability| builder.with_required(*capability),
            )
            .build(&capabilities)?;

        let last_completed_end = match (requested, run.mode) {
            (None, SyncMode::Incremental) => self
                .runs
                .latest_completed(&run.account_id)
                .await?
                .and_then(|last| last.resume_point()),
            _ => None,
        };

        let earliest = if requested.is_none() && last_completed_end.is_none() {
            self.limiter.acquire(&key).await;
            adapter
                .earliest_activity(&credential)
                .await
                .unwrap_or_else(|err| {
                    debug!("{} earliest activity unavailable: {}", adapter.id(), err);
                    None
                })
        } else {
            None
        };
        drop(credential);

        let window = compute_sync_window(
            run.mode,
            Utc::now(),
            requested,
            last_completed_end,
            earliest,
            capabilities.max_lookback,
            &self.config,
        );

        let mut tiers: Vec<Arc<dyn PriceSource>> = vec![
            Arc::new(
                KlinePriceSource::new(adapter.clone())
                    .with_limiter(self.limiter.clone(), key.clone())
                    .with_retry(self.config.pager.backoff.clone()),
            ),
            Arc::new(StablecoinTable::new()),
        ];
        tiers.extend(self.price_fallbacks.iter().cloned());
        let resolver = PriceResolver::new(tiers, self.price_cache.clone());

        Ok(RunContext {
            adapter,
            limiter_key: key,
            plan,
            window,
            resolver,
        })
    }

    async fn fail_setup(
        &self,
        mut run: SyncRun,
        requested: Option<TimeWindow>,
        failure: SetupFailure,
    ) -> SyncRun {
        let now = Utc::now();
        let window = requested.unwrap_or_else(|| TimeWindow::new(now, now));
        error!(
            "Sync run {} for account {} failed during {}: {}",
            run.run_id, run.account_id, failure.step_id, failure.message
        );

        run.start(window.start, window.end);
        run.errors.push(StepError {
            step_id: failure.step_id.to_string(),
            kind: failure.kind,
            window_start: window.start,
            window_end: window.end,
            message: failure.message.clone(),
            occurred_at: now,
        });
        run.finish(SyncRunStatus::Failed);
        self.save(&run).await;
        self.emit(&run, ProgressPhase::RunFinished, Some(failure.message));
        run
    }

    async fn run_step(
        &self,
        context: &RunContext,
        run: &mut SyncRun,
        index: usize,
        cancel: &AtomicBool,
    ) -> StepStatus {
        let step = &context.plan.steps()[index];
        let chunks = chunk_windows(
            context.window.start,
            context.window.end,
            step.chunk_width(),
            step.direction,
        );
        let total = chunks.len() as u64;

        run.current_step = index;
        let mut outcome = StepOutcome::not_attempted(&step.id, &step.label);
        outcome.chunks_total = total;
        self.sink.emit(
            SyncProgressEvent::from_run(run, ProgressPhase::StepStarted)
                .with_step(&step.id, &step.label),
        );
        debug!(
            "Step '{}' of run {}: {} chunks of {}s ({:?})",
            step.id, run.run_id, total, step.chunk_width_secs, step.direction
        );

        let account_id = run.account_id.clone();
        let pager = ChunkPager {
            adapter: context.adapter.as_ref(),
            vault: &self.vault,
            account_id: &account_id,
            limiter: &self.limiter,
            limiter_key: &context.limiter_key,
            config: &self.config.pager,
        };
        let normalizer = Normalizer {
            adapter: context.adapter.as_ref(),
            resolver: &context.resolver,
            account_id: &account_id,
        };

        let mut status = StepStatus::Succeeded;
        let mut had_gap = false;

        for (done, window) in chunks.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                info!("Run {} cancelled during step '{}'", run.run_id, step.id);
                status = StepStatus::Cancelled;
                break;
            }

            let fetch = pager.fetch_chunk(step.capability, window).await;
            outcome.fetched += fetch.records.len() as u64;
            run.summary.fetched += fetch.records.len() as u64;

            let batch = normalizer.normalize(step.capability, &fetch.records).await;
            outcome.skipped += batch.skipped;
            run.summary.skipped += batch.skipped;
            run.summary.price_unavailable += batch.price_unavailable;

            if !batch.transactions.is_empty() {
                match self
                    .ledger
                    .append_transactions(&account_id, batch.transactions)
                    .await
                {
                    Ok(ack) => {
                        outcome.inserted += ack.inserted;
                        outcome.duplicates += ack.duplicates;
                        run.summary.inserted += ack.inserted;
                        run.summary.duplicates += ack.duplicates;
                    }
                    Err(err) => {
                        error!("Ledger append failed in step '{}': {}", step.id, err);
                        run.errors.push(step_error(
                            &step.id,
                            SyncErrorKind::LedgerWriteFailed,
                            window,
                            err.to_string(),
                        ));
                        status = StepStatus::Failed;
                        break;
                    }
                }
            }

            match fetch.failure {
                None => {}
                Some(ChunkFailure::Gap {
                    cause,
                    kind,
                    message,
                }) => {
                    warn!(
                        "Gap in step '{}' for [{}, {}): {:?} {}",
                        step.id, window.start, window.end, cause, message
                    );
                    had_gap = true;
                    run.gaps.push(SyncGap {
                        step_id: step.id.clone(),
                        window_start: window.start,
                        window_end: window.end,
                        cause,
                        kind,
                        message,
                    });
                }
                Some(ChunkFailure::Fatal(err)) => {
                    error!("Step '{}' of run {} failed: {}", step.id, run.run_id, err);
                    let kind = err.kind().unwrap_or(SyncErrorKind::SetupFailed);
                    run.errors
                        .push(step_error(&step.id, kind, window, err.to_string()));
                    status = StepStatus::Failed;
                    break;
                }
            }

            outcome.chunks_done = done as u64 + 1;
            run.advance_progress(step_progress_bps(
                &context.plan,
                index,
                outcome.chunks_done,
                total,
            ));
            run.step_outcomes[index] = outcome.clone();
            self.sink.emit(
                SyncProgressEvent::from_run(run, ProgressPhase::ChunkCompleted)
                    .with_step(&step.id, &step.label),
            );
        }

        if status == StepStatus::Succeeded && had_gap {
            status = StepStatus::CompletedWithGaps;
        }
        outcome.status = status;
        run.step_outcomes[index] = outcome;
        status
    }

    async fn save(&self, run: &SyncRun) {
        if let Err(err) = self.runs.save(run).await {
            warn!("Failed to persist sync run {}: {}", run.run_id, err);
        }
    }

    fn emit(&self, run: &SyncRun, phase: ProgressPhase, message: Option<String>) {
        let mut event = SyncProgressEvent::from_run(run, phase);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.sink.emit(event);
    }
}

fn step_error(
    step_id: &str,
    kind: SyncErrorKind,
    window: &TimeWindow,
    message: String,
) -> StepError {
    StepError {
        step_id: step_id.to_string(),
        kind,
        window_start: window.start,
        window_end: window.end,
        message,
        occurred_at: Utc::now(),
    }
}

/// Terminal status from the step outcomes.
///
/// `Failed` when no step completed, `Succeeded` when every step completed
/// without gaps, `Partial` otherwise. A cancelled run is always `Partial`.
fn final_status(run: &SyncRun) -> SyncRunStatus {
    if run.cancelled {
        return SyncRunStatus::Partial;
    }

    let all_clean = run
        .step_outcomes
        .iter()
        .all(|o| o.status == StepStatus::Succeeded);
    let completed = run
        .step_outcomes
        .iter()
        .filter(|o| matches!(o.status, StepStatus::Succeeded | StepStatus::CompletedWithGaps))
        .count();

    if all_clean && run.gaps.is_empty() {
        SyncRunStatus::Succeeded
    } else if completed == 0 {
        SyncRunStatus::Failed
    } else {
        SyncRunStatus::Partial
    }
}

/// Every step ran to an end of its own, none was skipped or cancelled.
fn fully_attempted(run: &SyncRun) -> bool {
    !run.cancelled
        && run
            .step_outcomes
            .iter()
            .all(|o| o.status.was_attempted() && o.status != StepStatus::Cancelled)
}
