use super::*;
use crate::test_support::{
    record, ts, vault_with_account, vault_with_accounts, ScriptedAdapter, ScriptedFactory,
    SCRIPTED_ID,
};
use async_trait::async_trait;
use ledgersync_core::credentials::{
    CredentialCipher, CredentialMetadata, DecryptedCredential, InMemoryCredentialStore,
    MASTER_KEY_SIZE,
};
use ledgersync_core::events::MockProgressSink;
use ledgersync_core::sync::{GapCause, InMemorySyncRunRepository};
use ledgersync_core::transactions::{AppendAck, InMemoryLedgerStore, Transaction};
use ledgersync_exchanges::{BackoffPolicy, PriceCache, RateLimiter};
use rust_decimal_macros::dec;

const ACCOUNT: &str = "acc-1";

struct Harness {
    adapter: Arc<ScriptedAdapter>,
    ledger: Arc<InMemoryLedgerStore>,
    sink: MockProgressSink,
    orchestrator: SyncOrchestrator,
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        pager: PagerConfig {
            max_pages_per_chunk: 50,
            backoff: BackoffPolicy::immediate(3),
        },
        step_weights: BTreeMap::from([(Capability::Trades, 1), (Capability::Deposits, 1)]),
        ..OrchestratorConfig::default()
    }
}

fn harness_with(adapter: ScriptedAdapter, config: OrchestratorConfig) -> Harness {
    let adapter = Arc::new(adapter);
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let sink = MockProgressSink::new();
    let orchestrator = SyncOrchestrator::new(
        vault_with_account(ACCOUNT),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        ledger.clone(),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(sink.clone()),
    )
    .with_config(config);

    Harness {
        adapter,
        ledger,
        sink,
        orchestrator,
    }
}

fn harness(adapter: ScriptedAdapter) -> Harness {
    harness_with(adapter, config())
}

/// Trades and deposits with daily chunks, one record of each.
fn two_step_adapter() -> ScriptedAdapter {
    ScriptedAdapter::new()
        .with_capability(Capability::Trades, Duration::days(1))
        .with_capability(Capability::Deposits, Duration::days(1))
        .with_records(
            Capability::Trades,
            vec![record(Capability::Trades, "t-1", ts(4), "buy", "BTC", "0.5")],
        )
        .with_records(
            Capability::Deposits,
            vec![record(Capability::Deposits, "d-1", ts(2), "deposit", "USDT", "100")],
        )
        .with_price("BTC", dec!(40000))
}

async fn sync_range(h: &Harness, start: u32, end: u32) -> SyncRun {
    let run = h
        .orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(ts(start), ts(end))))
        .await
        .unwrap();
    h.orchestrator
        .execute(run, Arc::new(AtomicBool::new(false)))
        .await
}

fn auth_rejected() -> ExchangeError {
    ExchangeError::AuthRejected {
        exchange: SCRIPTED_ID.to_string(),
        message: "Invalid API-key".to_string(),
    }
}

#[tokio::test]
async fn test_two_steps_report_half_then_full_progress() {
    let h = harness(two_step_adapter());
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Succeeded);
    assert_eq!(run.progress_bps, TOTAL_WEIGHT_BPS);
    assert!(run.errors.is_empty());
    assert!(run.gaps.is_empty());

    let step_progress: Vec<f64> = h
        .sink
        .events()
        .iter()
        .filter(|e| e.phase == ProgressPhase::StepFinished)
        .map(|e| e.progress_percent)
        .collect();
    assert_eq!(step_progress, vec![50.0, 100.0]);

    let transactions = h.ledger.transactions(ACCOUNT);
    assert_eq!(transactions.len(), 2);
    assert_ne!(transactions[0].id, transactions[1].id);
    assert_eq!(run.summary.inserted, 2);
}

#[tokio::test]
async fn test_progress_events_are_monotone() {
    let h = harness(two_step_adapter());
    sync_range(&h, 1, 11).await;

    let events = h.sink.events();
    assert_eq!(events.first().map(|e| e.phase), Some(ProgressPhase::RunStarted));
    assert_eq!(events.last().map(|e| e.phase), Some(ProgressPhase::RunFinished));
    for pair in events.windows(2) {
        assert!(pair[0].progress_percent <= pair[1].progress_percent);
    }

    let chunk_events = events
        .iter()
        .filter(|e| e.phase == ProgressPhase::ChunkCompleted)
        .count();
    assert_eq!(chunk_events, 20);
}

#[tokio::test]
async fn test_transactions_are_priced() {
    let h = harness(two_step_adapter());
    sync_range(&h, 1, 11).await;

    let transactions = h.ledger.transactions(ACCOUNT);
    let trade = transactions.iter().find(|t| t.raw_ref == "t-1").unwrap();
    assert_eq!(trade.usd_value, Some(dec!(20000)));
    let deposit = transactions.iter().find(|t| t.raw_ref == "d-1").unwrap();
    assert_eq!(deposit.usd_value, Some(dec!(100)));
    assert!(h.adapter.kline_calls.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_rate_limited_chunk_yields_same_transactions() {
    let records: Vec<_> = (1..=5)
        .flat_map(|day| {
            vec![
                record(Capability::Trades, &format!("t-{day}-a"), ts(day), "buy", "BTC", "1"),
                record(Capability::Trades, &format!("t-{day}-b"), ts(day), "sell", "BTC", "2"),
            ]
        })
        .collect();
    let base = || {
        ScriptedAdapter::new()
            .with_capability(Capability::Trades, Duration::days(1))
            .with_records(Capability::Trades, records.clone())
            .with_price("BTC", dec!(50000))
    };

    let clean = harness(base());
    let clean_run = sync_range(&clean, 1, 6).await;

    // Descending chunks: the third one starts at day 3.
    let throttled = harness(base().fail(Capability::Trades, Some(ts(3)), 2, || {
        ExchangeError::RateLimited {
            exchange: SCRIPTED_ID.to_string(),
            retry_after: None,
        }
    }));
    let throttled_run = sync_range(&throttled, 1, 6).await;

    assert_eq!(clean_run.status, SyncRunStatus::Succeeded);
    assert_eq!(throttled_run.status, SyncRunStatus::Succeeded);
    assert!(throttled_run.gaps.is_empty());
    assert_eq!(
        throttled.adapter.calls(Capability::Trades),
        clean.adapter.calls(Capability::Trades) + 2
    );

    let ids = |h: &Harness| {
        let mut ids: Vec<String> = h.ledger.transactions(ACCOUNT).into_iter().map(|t| t.id).collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(&clean).len(), 10);
    assert_eq!(ids(&clean), ids(&throttled));
}

#[tokio::test]
async fn test_resync_inserts_nothing_new() {
    let h = harness(two_step_adapter());
    let first = sync_range(&h, 1, 11).await;
    let second = sync_range(&h, 1, 11).await;

    assert_eq!(first.summary.inserted, 2);
    assert_eq!(second.summary.inserted, 0);
    assert_eq!(second.summary.duplicates, 2);
    assert_eq!(h.ledger.len(ACCOUNT), 2);
}

#[tokio::test]
async fn test_auth_failure_marks_run_partial() {
    let h = harness(two_step_adapter().fail(Capability::Trades, None, 1000, auth_rejected));
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Partial);
    assert_eq!(run.progress_bps, TOTAL_WEIGHT_BPS);
    assert_eq!(run.step_outcomes[0].status, StepStatus::Failed);
    assert_eq!(run.step_outcomes[1].status, StepStatus::Succeeded);

    let error = &run.errors[0];
    assert_eq!(error.step_id, "trades");
    assert_eq!(error.kind, SyncErrorKind::SourceAuthRejected);
    assert_eq!(error.window_end, ts(11));
    // Auth failures are not retried.
    assert_eq!(h.adapter.calls(Capability::Trades), 1);
}

#[tokio::test]
async fn test_single_step_auth_failure_fails_run() {
    let adapter = ScriptedAdapter::new()
        .with_capability(Capability::Trades, Duration::days(1))
        .with_records(
            Capability::Trades,
            vec![record(Capability::Trades, "t-1", ts(4), "buy", "BTC", "0.5")],
        )
        .with_price("BTC", dec!(40000))
        .fail(Capability::Trades, None, 1000, auth_rejected);
    let h = harness(adapter);
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.progress_bps, 0);
    assert_eq!(run.step_outcomes.len(), 1);
    assert_eq!(run.step_outcomes[0].status, StepStatus::Failed);
    assert_eq!(run.step_outcomes[0].chunks_done, 0);
    assert_eq!(run.errors[0].kind, SyncErrorKind::SourceAuthRejected);
    assert!(h
        .sink
        .events()
        .iter()
        .all(|e| e.progress_percent < 100.0));
}

#[tokio::test]
async fn test_every_step_failing_fails_run() {
    let h = harness(
        two_step_adapter()
            .fail(Capability::Trades, None, 1000, auth_rejected)
            .fail(Capability::Deposits, None, 1000, auth_rejected),
    );
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert!(run.progress_bps < TOTAL_WEIGHT_BPS);
    assert_eq!(run.errors.len(), 2);
    assert!(run
        .step_outcomes
        .iter()
        .all(|o| o.status == StepStatus::Failed));
    assert_eq!(h.ledger.len(ACCOUNT), 0);
}

#[tokio::test]
async fn test_required_step_failure_stops_run() {
    let mut config = config();
    config.required = vec![Capability::Trades];
    let h = harness_with(
        two_step_adapter().fail(Capability::Trades, None, 1000, auth_rejected),
        config,
    );
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.step_outcomes[1].status, StepStatus::NotAttempted);
    assert_eq!(h.adapter.calls(Capability::Deposits), 0);
    assert!(run.progress_bps < TOTAL_WEIGHT_BPS);
}

#[tokio::test]
async fn test_exhausted_retries_leave_a_gap() {
    let h = harness(two_step_adapter().fail(Capability::Deposits, Some(ts(2)), 100, || {
        ExchangeError::TransientNetwork {
            exchange: SCRIPTED_ID.to_string(),
            message: "connection reset".to_string(),
        }
    }));
    let run = sync_range(&h, 1, 11).await;

    assert_eq!(run.status, SyncRunStatus::Partial);
    assert_eq!(run.progress_bps, TOTAL_WEIGHT_BPS);
    assert_eq!(run.gaps.len(), 1);

    let gap = &run.gaps[0];
    assert_eq!(gap.step_id, "deposits");
    assert_eq!(gap.cause, GapCause::RetriesExhausted);
    assert_eq!(gap.kind, Some(SyncErrorKind::TransientNetwork));
    assert_eq!((gap.window_start, gap.window_end), (ts(2), ts(3)));
    assert_eq!(run.step_outcomes[1].status, StepStatus::CompletedWithGaps);
    // The deposit in the gap window is missing; the trade is not.
    assert_eq!(h.ledger.len(ACCOUNT), 1);
}

#[tokio::test]
async fn test_stalled_cursor_becomes_gap() {
    let h = harness(two_step_adapter().with_stalled_cursor(Capability::Deposits));
    let run = sync_range(&h, 1, 3).await;

    assert_eq!(run.status, SyncRunStatus::Partial);
    assert_eq!(run.gaps.len(), 2);
    assert!(run
        .gaps
        .iter()
        .all(|g| g.cause == GapCause::PaginationStalled));
    // Records from the pages before the stall are kept.
    assert_eq!(h.ledger.len(ACCOUNT), 1);
}

struct CancelAfterFirstChunk {
    flag: Arc<AtomicBool>,
    inner: MockProgressSink,
}

impl ProgressSink for CancelAfterFirstChunk {
    fn emit(&self, event: SyncProgressEvent) {
        if event.phase == ProgressPhase::ChunkCompleted {
            self.flag.store(true, Ordering::SeqCst);
        }
        self.inner.emit(event);
    }
}

#[tokio::test]
async fn test_cancel_between_chunks() {
    let adapter = Arc::new(two_step_adapter());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let flag = Arc::new(AtomicBool::new(false));
    let sink = MockProgressSink::new();
    let orchestrator = SyncOrchestrator::new(
        vault_with_account(ACCOUNT),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        ledger,
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(CancelAfterFirstChunk {
            flag: flag.clone(),
            inner: sink.clone(),
        }),
    )
    .with_config(config());

    let run = orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(ts(1), ts(11))))
        .await
        .unwrap();
    let run = orchestrator.execute(run, flag).await;

    assert_eq!(run.status, SyncRunStatus::Partial);
    assert!(run.cancelled);
    assert_eq!(run.step_outcomes[0].status, StepStatus::Cancelled);
    assert_eq!(run.step_outcomes[0].chunks_done, 1);
    assert_eq!(run.step_outcomes[1].status, StepStatus::NotAttempted);
    assert_eq!(adapter.calls(Capability::Trades), 1);
    assert!(run.progress_bps < TOTAL_WEIGHT_BPS);
    assert_eq!(
        sink.events().last().map(|e| e.phase),
        Some(ProgressPhase::RunFinished)
    );
}

#[tokio::test]
async fn test_corrupt_credential_fails_run() {
    let store = Arc::new(InMemoryCredentialStore::new());
    let writer = CredentialVault::new(CredentialCipher::new([1u8; MASTER_KEY_SIZE]), store.clone());
    writer
        .store(
            ACCOUNT,
            CredentialMetadata::new(SCRIPTED_ID),
            &DecryptedCredential::api_key_pair("key", "secret"),
        )
        .unwrap();
    let reader = CredentialVault::new(CredentialCipher::new([2u8; MASTER_KEY_SIZE]), store);

    let adapter = Arc::new(two_step_adapter());
    let orchestrator = SyncOrchestrator::new(
        Arc::new(reader),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(MockProgressSink::new()),
    )
    .with_config(config());

    let run = orchestrator.run(ACCOUNT, SyncMode::Full).await.unwrap();
    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.errors.len(), 1);
    assert_eq!(run.errors[0].step_id, VAULT_STEP_ID);
    assert_eq!(run.errors[0].kind, SyncErrorKind::CredentialCorruptOrMismatched);
    assert_eq!(adapter.calls(Capability::Trades), 0);

    let stored = orchestrator.runs().get(&run.run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, SyncRunStatus::Failed);
}

#[tokio::test]
async fn test_credential_removed_before_execute_is_unavailable() {
    let vault = vault_with_account(ACCOUNT);
    let adapter = Arc::new(two_step_adapter());
    let orchestrator = SyncOrchestrator::new(
        vault.clone(),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(MockProgressSink::new()),
    )
    .with_config(config());

    let run = orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(ts(1), ts(11))))
        .await
        .unwrap();
    vault.remove(ACCOUNT).unwrap();
    let run = orchestrator
        .execute(run, Arc::new(AtomicBool::new(false)))
        .await;

    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.errors[0].step_id, VAULT_STEP_ID);
    assert_eq!(run.errors[0].kind, SyncErrorKind::CredentialUnavailable);
    assert_eq!(adapter.calls(Capability::Trades), 0);
}

#[tokio::test]
async fn test_unknown_exchange_fails_setup() {
    let store = Arc::new(InMemoryCredentialStore::new());
    let vault = CredentialVault::new(CredentialCipher::new([3u8; MASTER_KEY_SIZE]), store);
    vault
        .store(
            ACCOUNT,
            CredentialMetadata::new("NOPE"),
            &DecryptedCredential::api_key_pair("key", "secret"),
        )
        .unwrap();

    let orchestrator = SyncOrchestrator::new(
        Arc::new(vault),
        Arc::new(ScriptedFactory {
            adapter: Arc::new(two_step_adapter()),
        }),
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(MockProgressSink::new()),
    );

    let run = orchestrator.run(ACCOUNT, SyncMode::Incremental).await.unwrap();
    assert_eq!(run.status, SyncRunStatus::Failed);
    assert_eq!(run.errors[0].step_id, SETUP_STEP_ID);
    assert_eq!(run.errors[0].kind, SyncErrorKind::SetupFailed);
}

#[tokio::test]
async fn test_prepare_requires_credential_and_valid_range() {
    let h = harness(two_step_adapter());
    assert!(h
        .orchestrator
        .prepare("missing", SyncMode::Full, None)
        .await
        .is_err());
    assert!(h
        .orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(ts(5), ts(5))))
        .await
        .is_err());

    let run = h.orchestrator.prepare(ACCOUNT, SyncMode::Full, None).await.unwrap();
    assert_eq!(run.status, SyncRunStatus::Pending);
    assert_eq!(run.exchange_id, SCRIPTED_ID);
}

#[tokio::test]
async fn test_missing_price_is_flagged_not_dropped() {
    let adapter = ScriptedAdapter::new()
        .with_capability(Capability::Trades, Duration::days(1))
        .with_records(
            Capability::Trades,
            vec![record(Capability::Trades, "t-x", ts(2), "buy", "OBSCURE", "7")],
        );
    let h = harness(adapter);
    let run = sync_range(&h, 1, 4).await;

    assert_eq!(run.status, SyncRunStatus::Succeeded);
    assert_eq!(run.summary.price_unavailable, 1);
    let transactions = h.ledger.transactions(ACCOUNT);
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].price_resolution_failed);
    assert_eq!(transactions[0].usd_value, None);
}

#[tokio::test]
async fn test_clock_sync_runs_before_first_call() {
    let h = harness(two_step_adapter().with_clock_sync());
    sync_range(&h, 1, 2).await;
    assert_eq!(
        h.adapter
            .clock_syncs
            .load(std::sync::atomic::Ordering::SeqCst),
        1
    );
}

struct RejectingLedger;

#[async_trait]
impl LedgerStore for RejectingLedger {
    async fn append_transactions(
        &self,
        _account_id: &str,
        _transactions: Vec<Transaction>,
    ) -> ledgersync_core::Result<AppendAck> {
        Err(ledgersync_core::Error::Ledger("disk full".into()))
    }
}

#[tokio::test]
async fn test_ledger_failure_fails_step() {
    let orchestrator = SyncOrchestrator::new(
        vault_with_account(ACCOUNT),
        Arc::new(ScriptedFactory {
            adapter: Arc::new(two_step_adapter()),
        }),
        Arc::new(RejectingLedger),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(MockProgressSink::new()),
    )
    .with_config(config());

    let run = orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(ts(1), ts(11))))
        .await
        .unwrap();
    let run = orchestrator
        .execute(run, Arc::new(AtomicBool::new(false)))
        .await;

    // Neither step wrote anything.
    assert_eq!(run.status, SyncRunStatus::Failed);
    assert!(run.progress_bps < TOTAL_WEIGHT_BPS);
    assert!(run
        .errors
        .iter()
        .all(|e| e.kind == SyncErrorKind::LedgerWriteFailed));
    assert_eq!(run.errors.len(), 2);
}

#[test]
fn test_window_full_mode() {
    let now = ts(20);
    let config = OrchestratorConfig::default();

    let window = compute_sync_window(
        SyncMode::Full,
        now,
        None,
        Some(ts(15)),
        Some(ts(3)),
        Duration::days(3650),
        &config,
    );
    assert_eq!(window, TimeWindow::new(ts(3), now));

    let window = compute_sync_window(
        SyncMode::Full,
        now,
        None,
        None,
        None,
        Duration::days(3650),
        &config,
    );
    assert_eq!(window.start, now - Duration::days(365));
}

#[test]
fn test_window_incremental_resumes_with_overlap() {
    let now = ts(20);
    let config = OrchestratorConfig::default();

    let window = compute_sync_window(
        SyncMode::Incremental,
        now,
        None,
        Some(ts(15)),
        Some(ts(3)),
        Duration::days(3650),
        &config,
    );
    assert_eq!(window, TimeWindow::new(ts(14), now));

    // No prior run: same as full.
    let window = compute_sync_window(
        SyncMode::Incremental,
        now,
        None,
        None,
        Some(ts(3)),
        Duration::days(3650),
        &config,
    );
    assert_eq!(window.start, ts(3));
}

#[test]
fn test_window_clamped_to_max_lookback_and_now() {
    let now = ts(20);
    let config = OrchestratorConfig::default();

    let window = compute_sync_window(
        SyncMode::Full,
        now,
        None,
        None,
        Some(ts(1)),
        Duration::days(5),
        &config,
    );
    assert_eq!(window.start, ts(15));

    let window = compute_sync_window(
        SyncMode::Incremental,
        now,
        Some(TimeWindow::new(ts(1), ts(25))),
        Some(ts(18)),
        None,
        Duration::days(10),
        &config,
    );
    assert_eq!(window, TimeWindow::new(ts(10), now));
}

#[tokio::test]
async fn test_full_sync_starts_at_earliest_activity_within_lookback() {
    let earliest = Utc::now() - Duration::days(3);
    let h = harness(
        two_step_adapter()
            .with_earliest_activity(earliest)
            .with_max_lookback(Duration::days(2)),
    );
    let run = h.orchestrator.run(ACCOUNT, SyncMode::Full).await.unwrap();

    assert_eq!(run.status, SyncRunStatus::Succeeded);
    let start = run.range_start.unwrap();
    assert!(start > earliest);
    assert!(run.range_end.unwrap() - start <= Duration::days(2));
}

#[tokio::test]
async fn test_incremental_after_cancel_refetches_skipped_history() {
    let now = Utc::now();
    let start = now - Duration::days(3);
    let adapter = Arc::new(
        ScriptedAdapter::new()
            .with_capability(Capability::Trades, Duration::days(1))
            .with_records(
                Capability::Trades,
                vec![
                    record(Capability::Trades, "t-new", now - Duration::hours(6), "buy", "USDT", "5"),
                    record(Capability::Trades, "t-old", start + Duration::hours(6), "buy", "USDT", "9"),
                ],
            ),
    );
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let cancel = Arc::new(AtomicBool::new(false));
    let orchestrator = SyncOrchestrator::new(
        vault_with_account(ACCOUNT),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        ledger.clone(),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(CancelAfterFirstChunk {
            flag: cancel.clone(),
            inner: MockProgressSink::new(),
        }),
    )
    .with_config(config());

    // Descending chunks: only the most recent day is fetched.
    let first = orchestrator
        .prepare(ACCOUNT, SyncMode::Full, Some(TimeWindow::new(start, now)))
        .await
        .unwrap();
    let first = orchestrator.execute(first, cancel).await;
    assert!(first.cancelled);
    assert_eq!(ledger.len(ACCOUNT), 1);

    let second = orchestrator
        .prepare(ACCOUNT, SyncMode::Incremental, None)
        .await
        .unwrap();
    let second = orchestrator
        .execute(second, Arc::new(AtomicBool::new(false)))
        .await;

    assert_eq!(second.status, SyncRunStatus::Succeeded);
    assert!(second.range_start.unwrap() <= start);
    let mut refs: Vec<String> = ledger
        .transactions(ACCOUNT)
        .into_iter()
        .map(|t| t.raw_ref)
        .collect();
    refs.sort();
    assert_eq!(refs, vec!["t-new".to_string(), "t-old".to_string()]);
}

#[tokio::test]
async fn test_concurrent_accounts_share_limiter_and_price_cache() {
    const OTHER: &str = "acc-2";
    let adapter = Arc::new(two_step_adapter());
    let ledger = Arc::new(InMemoryLedgerStore::new());
    let limiter = Arc::new(RateLimiter::new());
    let cache = Arc::new(PriceCache::default());
    let orchestrator = SyncOrchestrator::new(
        vault_with_accounts(&[ACCOUNT, OTHER]),
        Arc::new(ScriptedFactory {
            adapter: adapter.clone(),
        }),
        ledger.clone(),
        Arc::new(InMemorySyncRunRepository::new()),
        Arc::new(MockProgressSink::new()),
    )
    .with_config(config())
    .with_limiter(limiter.clone())
    .with_price_cache(cache.clone());

    let window = Some(TimeWindow::new(ts(1), ts(11)));
    let first = orchestrator
        .prepare(ACCOUNT, SyncMode::Full, window)
        .await
        .unwrap();
    let second = orchestrator
        .prepare(OTHER, SyncMode::Full, window)
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        orchestrator.execute(first, Arc::new(AtomicBool::new(false))),
        orchestrator.execute(second, Arc::new(AtomicBool::new(false))),
    );

    assert_eq!(first.status, SyncRunStatus::Succeeded);
    assert_eq!(second.status, SyncRunStatus::Succeeded);
    assert_eq!(ledger.len(ACCOUNT), 2);
    assert_eq!(ledger.len(OTHER), 2);

    // Same records, different accounts: no id collides.
    let ids = |account: &str| {
        ledger
            .transactions(account)
            .into_iter()
            .map(|t| t.id)
            .collect::<Vec<_>>()
    };
    assert!(ids(ACCOUNT).iter().all(|id| !ids(OTHER).contains(id)));

    // One BTC and one USDT price, shared by both runs.
    assert_eq!(cache.len(), 2);
    assert_eq!(adapter.calls(Capability::Trades), 20);
}
