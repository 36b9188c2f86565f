//! Scripted adapter and fixtures shared by the sync crate's tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use ledgersync_core::credentials::{
    CredentialCipher, CredentialMetadata, CredentialVault, DecryptedCredential,
    InMemoryCredentialStore, MASTER_KEY_SIZE,
};
use ledgersync_core::sync::Capability;
use ledgersync_exchanges::{
    AdapterCapabilities, AdapterFactory, ChunkLimits, ExchangeAdapter, ExchangeConfig,
    ExchangeError, Kline, Page, RateLimit, RawRecord, RecordFields, TimeWindow,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub const SCRIPTED_ID: &str = "SCRIPTED";
const PAGE_SIZE: usize = 2;

pub fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
}

/// Raw record in the scripted adapter's wire shape.
pub fn record(
    capability: Capability,
    id: &str,
    timestamp: DateTime<Utc>,
    kind: &str,
    asset: &str,
    quantity: &str,
) -> RawRecord {
    RawRecord::new(
        SCRIPTED_ID,
        capability,
        json!({
            "id": id,
            "ts": timestamp.timestamp_millis(),
            "kind": kind,
            "asset": asset,
            "qty": quantity,
        }),
    )
}

type ErrorFn = Box<dyn Fn() -> ExchangeError + Send + Sync>;

struct ScriptedFailure {
    capability: Capability,
    /// `None` fails every window.
    window_start: Option<DateTime<Utc>>,
    remaining: u32,
    make: ErrorFn,
}

/// In-memory adapter with scripted records, failures and prices.
pub struct ScriptedAdapter {
    capabilities: AdapterCapabilities,
    records: Mutex<HashMap<Capability, Vec<RawRecord>>>,
    failures: Mutex<Vec<ScriptedFailure>>,
    prices: HashMap<String, Decimal>,
    clock_sync: bool,
    earliest: Option<DateTime<Utc>>,
    stalled: Mutex<Vec<Capability>>,
    calls: Mutex<HashMap<Capability, u32>>,
    pub clock_syncs: AtomicU32,
    pub kline_calls: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            capabilities: AdapterCapabilities::new(Duration::days(3650)),
            records: Mutex::new(HashMap::new()),
            failures: Mutex::new(Vec::new()),
            prices: HashMap::new(),
            clock_sync: false,
            earliest: None,
            stalled: Mutex::new(Vec::new()),
            calls: Mutex::new(HashMap::new()),
            clock_syncs: AtomicU32::new(0),
            kline_calls: AtomicU32::new(0),
        }
    }

    pub fn with_capability(mut self, capability: Capability, width: Duration) -> Self {
        self.capabilities = self.capabilities.with(capability, ChunkLimits::fixed(width));
        self
    }

    pub fn with_max_lookback(mut self, lookback: Duration) -> Self {
        self.capabilities.max_lookback = lookback;
        self
    }

    pub fn with_records(self, capability: Capability, records: Vec<RawRecord>) -> Self {
        self.records
            .lock()
            .unwrap()
            .entry(capability)
            .or_default()
            .extend(records);
        self
    }

    pub fn with_price(mut self, asset: &str, price: Decimal) -> Self {
        self.prices.insert(asset.to_string(), price);
        self
    }

    pub fn with_clock_sync(mut self) -> Self {
        self.clock_sync = true;
        self
    }

    pub fn with_earliest_activity(mut self, at: DateTime<Utc>) -> Self {
        self.earliest = Some(at);
        self
    }

    /// Fail the next `times` calls for `capability` in the window starting at
    /// `window_start` (any window when `None`).
    pub fn fail<F>(
        self,
        capability: Capability,
        window_start: Option<DateTime<Utc>>,
        times: u32,
        make: F,
    ) -> Self
    where
        F: Fn() -> ExchangeError + Send + Sync + 'static,
    {
        self.failures.lock().unwrap().push(ScriptedFailure {
            capability,
            window_start,
            remaining: times,
            make: Box::new(make),
        });
        self
    }

    /// Always hand back the same cursor for `capability`.
    pub fn with_stalled_cursor(self, capability: Capability) -> Self {
        self.stalled.lock().unwrap().push(capability);
        self
    }

    pub fn calls(&self, capability: Capability) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(&capability)
            .copied()
            .unwrap_or(0)
    }

    fn list(
        &self,
        capability: Capability,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        *self.calls.lock().unwrap().entry(capability).or_default() += 1;

        {
            let mut failures = self.failures.lock().unwrap();
            let hit = failures.iter_mut().find(|f| {
                f.capability == capability
                    && f.remaining > 0
                    && f.window_start.map_or(true, |start| start == window.start)
            });
            if let Some(failure) = hit {
                failure.remaining -= 1;
                return Err((failure.make)());
            }
        }

        let in_window: Vec<RawRecord> = self
            .records
            .lock()
            .unwrap()
            .get(&capability)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| {
                        let ms = r.payload["ts"].as_i64().unwrap_or_default();
                        window.contains(Utc.timestamp_millis_opt(ms).unwrap())
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if self.stalled.lock().unwrap().contains(&capability) {
            return Ok(Page::with_cursor(in_window, "same"));
        }

        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let items: Vec<RawRecord> = in_window.iter().skip(offset).take(PAGE_SIZE).cloned().collect();
        let next = offset + items.len();
        if next < in_window.len() {
            Ok(Page::with_cursor(items, next.to_string()))
        } else {
            Ok(Page::last(items))
        }
    }
}

#[async_trait]
impl ExchangeAdapter for ScriptedAdapter {
    fn id(&self) -> &'static str {
        SCRIPTED_ID
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.capabilities.clone()
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            requests_per_minute: 600_000,
            burst_capacity: 1000.0,
            min_interval: std::time::Duration::ZERO,
        }
    }

    fn requires_clock_sync(&self) -> bool {
        self.clock_sync
    }

    async fn sync_clock(&self) -> Result<(), ExchangeError> {
        self.clock_syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn earliest_activity(
        &self,
        _credential: &DecryptedCredential,
    ) -> Result<Option<DateTime<Utc>>, ExchangeError> {
        Ok(self.earliest)
    }

    fn extract(&self, record: &RawRecord) -> Result<RecordFields, ExchangeError> {
        let payload: &Value = &record.payload;
        let text = |key: &str| {
            payload[key]
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| ExchangeError::malformed_record(SCRIPTED_ID, format!("missing {key}")))
        };
        let ms = payload["ts"]
            .as_i64()
            .ok_or_else(|| ExchangeError::malformed_record(SCRIPTED_ID, "missing ts"))?;
        let quantity: Decimal = text("qty")?
            .parse()
            .map_err(|_| ExchangeError::malformed_record(SCRIPTED_ID, "bad qty"))?;

        Ok(RecordFields {
            external_id: text("id")?,
            timestamp: Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| ExchangeError::malformed_record(SCRIPTED_ID, "bad ts"))?,
            kind: text("kind")?
                .parse()
                .map_err(|_| ExchangeError::malformed_record(SCRIPTED_ID, "bad kind"))?,
            asset: text("asset")?,
            quantity,
            fee: Decimal::ZERO,
            fee_asset: None,
            counter_asset: None,
            counter_quantity: None,
        })
    }

    async fn list_trades(
        &self,
        _credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list(Capability::Trades, window, cursor)
    }

    async fn list_orders(
        &self,
        _credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list(Capability::Orders, window, cursor)
    }

    async fn list_deposits(
        &self,
        _credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list(Capability::Deposits, window, cursor)
    }

    async fn list_withdrawals(
        &self,
        _credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list(Capability::Withdrawals, window, cursor)
    }

    async fn get_klines(
        &self,
        base: &str,
        _quote: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Kline>, ExchangeError> {
        self.kline_calls.fetch_add(1, Ordering::SeqCst);
        let price = self
            .prices
            .get(base)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidRequest {
                exchange: SCRIPTED_ID.to_string(),
                message: format!("unknown symbol {base}"),
            })?;
        Ok(vec![Kline {
            open_time: window.start,
            open: price,
            high: price,
            low: price,
            close: price,
        }])
    }
}

/// Factory handing out one shared scripted adapter.
pub struct ScriptedFactory {
    pub adapter: Arc<ScriptedAdapter>,
}

impl AdapterFactory for ScriptedFactory {
    fn create(
        &self,
        exchange_id: &str,
        _config: &ExchangeConfig,
    ) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        if exchange_id != SCRIPTED_ID {
            return Err(ExchangeError::not_supported(exchange_id, "exchange"));
        }
        Ok(self.adapter.clone())
    }
}

/// Vault holding one scripted credential for `account_id`.
pub fn vault_with_account(account_id: &str) -> Arc<CredentialVault> {
    vault_with_accounts(&[account_id])
}

pub fn vault_with_accounts(account_ids: &[&str]) -> Arc<CredentialVault> {
    let vault = CredentialVault::new(
        CredentialCipher::new([7u8; MASTER_KEY_SIZE]),
        Arc::new(InMemoryCredentialStore::new()),
    );
    for account_id in account_ids {
        vault
            .store(
                account_id,
                CredentialMetadata::new(SCRIPTED_ID),
                &DecryptedCredential::api_key_pair("key", "secret"),
            )
            .unwrap();
    }
    Arc::new(vault)
}
