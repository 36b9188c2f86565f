//! Chunked, cursor-paginated fetching for one sync step.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use ledgersync_core::credentials::CredentialVault;
use ledgersync_core::sync::{Capability, ChunkDirection, GapCause, SyncErrorKind};
use ledgersync_exchanges::{
    call_with_retry, fetch_capability, BackoffPolicy, ExchangeAdapter, ExchangeError, RateLimiter,
    RawRecord, RetryClass, TimeWindow,
};
use log::{debug, warn};

/// Default per-chunk page cap.
pub const DEFAULT_MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct PagerConfig {
    /// Pages fetched inside one chunk before giving up on it.
    pub max_pages_per_chunk: usize,
    pub backoff: BackoffPolicy,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            max_pages_per_chunk: DEFAULT_MAX_PAGES,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Tile `[start, end)` with half-open windows of `width`.
///
/// Ascending walks from `start` and clips the last window at `end`.
/// Descending walks from `end` and clips the last window at `start`.
/// An empty range yields no windows; a non-positive width yields the whole
/// range as one window.
pub fn chunk_windows(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    width: Duration,
    direction: ChunkDirection,
) -> Vec<TimeWindow> {
    if end <= start {
        return Vec::new();
    }
    if width <= Duration::zero() {
        return vec![TimeWindow::new(start, end)];
    }

    let mut windows = Vec::new();
    match direction {
        ChunkDirection::Ascending => {
            let mut cursor = start;
            while cursor < end {
                let next = (cursor + width).min(end);
                windows.push(TimeWindow::new(cursor, next));
                cursor = next;
            }
        }
        ChunkDirection::Descending => {
            let mut cursor = end;
            while cursor > start {
                let previous = (cursor - width).max(start);
                windows.push(TimeWindow::new(previous, cursor));
                cursor = previous;
            }
        }
    }
    windows
}

/// Why a chunk stopped early.
#[derive(Debug)]
pub enum ChunkFailure {
    /// The window is recorded as a gap; the step continues.
    Gap {
        cause: GapCause,
        kind: Option<SyncErrorKind>,
        message: String,
    },
    /// The step cannot continue (authentication, credential).
    Fatal(ExchangeError),
}

/// Records fetched for one chunk, plus how it ended. Records from pages
/// fetched before a failure are kept.
#[derive(Debug, Default)]
pub struct ChunkFetch {
    pub records: Vec<RawRecord>,
    pub pages: usize,
    pub failure: Option<ChunkFailure>,
}

/// Fetches chunks for one (account, exchange) pair.
///
/// Every page goes through the shared rate limiter and backoff policy. The
/// credential is loaded from the vault for each call and dropped right
/// after it.
pub struct ChunkPager<'a> {
    pub adapter: &'a dyn ExchangeAdapter,
    pub vault: &'a CredentialVault,
    pub account_id: &'a str,
    pub limiter: &'a RateLimiter,
    pub limiter_key: &'a str,
    pub config: &'a PagerConfig,
}

impl ChunkPager<'_> {
    pub async fn fetch_chunk(&self, capability: Capability, window: &TimeWindow) -> ChunkFetch {
        let mut fetch = ChunkFetch::default();
        let mut cursor: Option<String> = None;
        let mut seen_cursors: HashSet<String> = HashSet::new();

        loop {
            if fetch.pages >= self.config.max_pages_per_chunk {
                warn!(
                    "{} {}: page cap {} reached in [{}, {})",
                    self.adapter.id(),
                    capability,
                    self.config.max_pages_per_chunk,
                    window.start,
                    window.end
                );
                fetch.failure = Some(ChunkFailure::Gap {
                    cause: GapCause::PageLimitReached,
                    kind: None,
                    message: format!(
                        "more than {} pages in one chunk",
                        self.config.max_pages_per_chunk
                    ),
                });
                break;
            }

            let page = match self.fetch_page(capability, window, cursor.as_deref()).await {
                Ok(page) => page,
                Err(err) => {
                    fetch.failure = Some(classify_failure(err));
                    break;
                }
            };
            fetch.pages += 1;
            fetch.records.extend(page.items);

            match page.next_cursor {
                None => break,
                Some(next) => {
                    if !seen_cursors.insert(next.clone()) {
                        warn!(
                            "{} {}: cursor '{}' repeated, pagination stalled",
                            self.adapter.id(),
                            capability,
                            next
                        );
                        fetch.failure = Some(ChunkFailure::Gap {
                            cause: GapCause::PaginationStalled,
                            kind: None,
                            message: format!("cursor '{next}' returned twice"),
                        });
                        break;
                    }
                    cursor = Some(next);
                }
            }
        }

        debug!(
            "{} {}: {} records in {} pages for [{}, {})",
            self.adapter.id(),
            capability,
            fetch.records.len(),
            fetch.pages,
            window.start,
            window.end
        );
        fetch
    }

    async fn fetch_page(
        &self,
        capability: Capability,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<ledgersync_exchanges::Page, ExchangeError> {
        let adapter = self.adapter;
        let vault = self.vault;
        let account_id = self.account_id;

        call_with_retry(
            &self.config.backoff,
            self.limiter,
            self.limiter_key,
            adapter,
            move || async move {
                let credential = vault.load(account_id)?;
                fetch_capability(adapter, capability, &credential, window, cursor).await
            },
        )
        .await
    }
}

/// Map an error that survived the retry policy onto the chunk's fate.
fn classify_failure(err: ExchangeError) -> ChunkFailure {
    match err.retry_class() {
        RetryClass::WithBackoff | RetryClass::ResyncClock => ChunkFailure::Gap {
            cause: GapCause::RetriesExhausted,
            kind: err.kind(),
            message: err.to_string(),
        },
        RetryClass::NextTier => ChunkFailure::Gap {
            cause: GapCause::MalformedResponse,
            kind: err.kind(),
            message: err.to_string(),
        },
        RetryClass::Never => ChunkFailure::Fatal(err),
    }
}
