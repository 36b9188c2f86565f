//! Bybit v5 adapter.
//!
//! Signed requests carry `X-BAPI-*` headers; the signature is HMAC-SHA256
//! over `timestamp + api_key + recv_window + query`. Bybit rejects requests
//! whose timestamp drifts from its clock, so the adapter syncs the server
//! clock before the first signed call.

mod records;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use ledgersync_core::credentials::DecryptedCredential;
use ledgersync_core::sync::Capability;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;

use crate::adapter::capabilities::{AdapterCapabilities, ChunkLimits, RateLimit};
use crate::adapter::traits::ExchangeAdapter;
use crate::adapter::wire::{decimal_field, encode_query, hmac_sha256_hex, string_field};
use crate::config::ExchangeConfig;
use crate::errors::ExchangeError;
use crate::models::{Kline, Page, RawRecord, RecordFields, TimeWindow};

/// Exchange id constant
pub const BYBIT_ID: &str = "BYBIT";

const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const RECV_WINDOW_MS: i64 = 20_000;
const EXECUTION_PAGE_LIMIT: usize = 100;
const ASSET_PAGE_LIMIT: usize = 50;
const MAX_LOOKBACK_DAYS: i64 = 722;

/// Trading categories scanned by the trades and orders steps.
const TRADE_CATEGORIES: &[&str] = &["spot", "linear"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BybitRegion {
    Global,
    Eu,
    Tr,
    Kz,
}

impl BybitRegion {
    pub fn parse(code: Option<&str>) -> Result<Self, ExchangeError> {
        match code.map(str::to_ascii_uppercase).as_deref() {
            None | Some("GLOBAL") | Some("ASIA") => Ok(Self::Global),
            Some("EU") => Ok(Self::Eu),
            Some("TR") => Ok(Self::Tr),
            Some("KZ") => Ok(Self::Kz),
            Some(other) => Err(ExchangeError::InvalidRequest {
                exchange: BYBIT_ID.to_string(),
                message: format!("unknown region '{other}'"),
            }),
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Global => "https://api.bybit.com",
            Self::Eu => "https://api.bybit.eu",
            Self::Tr => "https://api.bybit-tr.com",
            Self::Kz => "https://api.bybit.kz",
        }
    }
}

pub struct BybitAdapter {
    client: Client,
    base_url: String,
    clock_offset_ms: AtomicI64,
}

impl BybitAdapter {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let region = BybitRegion::parse(config.region_code().as_deref())?;
        let base_url = match (&config.base_url, config.testnet) {
            (Some(url), _) => url.trim_end_matches('/').to_string(),
            (None, true) => TESTNET_URL.to_string(),
            (None, false) => region.base_url().to_string(),
        };

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        debug!(
            "Bybit adapter: region={:?} testnet={} base_url={}",
            region, config.testnet, base_url
        );

        Ok(Self {
            client,
            base_url,
            clock_offset_ms: AtomicI64::new(0),
        })
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    async fn signed_get(
        &self,
        credential: &DecryptedCredential,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExchangeError> {
        let (api_key, api_secret) = credential.key_pair().ok_or_else(|| {
            ExchangeError::AuthRejected {
                exchange: BYBIT_ID.to_string(),
                message: "Bybit requires an API key pair credential".to_string(),
            }
        })?;

        let query = encode_query(params);
        let timestamp = self.timestamp_ms().to_string();
        let recv_window = RECV_WINDOW_MS.to_string();
        let payload = format!("{timestamp}{api_key}{recv_window}{query}");
        let signature = hmac_sha256_hex(api_secret, &payload)?;

        let request = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query))
            .header("X-BAPI-API-KEY", api_key)
            .header("X-BAPI-TIMESTAMP", timestamp)
            .header("X-BAPI-RECV-WINDOW", recv_window)
            .header("X-BAPI-SIGN", signature);
        self.send(request).await
    }

    async fn public_get(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, encode_query(params));
        self.send(self.client.get(url)).await
    }

    /// Send and unwrap the `{retCode, retMsg, result}` envelope.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value, ExchangeError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(BYBIT_ID, e))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_transport(BYBIT_ID, e))?;

        let parsed: Option<Value> = serde_json::from_str(&body).ok();
        let ret_code = parsed
            .as_ref()
            .and_then(|v| v.get("retCode"))
            .and_then(Value::as_i64);
        let message = parsed
            .as_ref()
            .and_then(|v| string_field(v, "retMsg"))
            .unwrap_or_else(|| body.chars().take(200).collect());

        if !status.is_success() || ret_code.is_some_and(|code| code != 0) {
            let err = classify_error(status, ret_code, message);
            warn!("Bybit request failed ({}): {}", status, err);
            return Err(err);
        }

        parsed
            .and_then(|mut v| v.get_mut("result").map(Value::take))
            .ok_or_else(|| ExchangeError::malformed(BYBIT_ID, "missing result envelope"))
    }

    /// Cursor pagination shared by every list endpoint.
    #[allow(clippy::too_many_arguments)]
    async fn list_page(
        &self,
        credential: &DecryptedCredential,
        capability: Capability,
        path: &str,
        mut params: Vec<(String, String)>,
        limit: usize,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<(Vec<RawRecord>, Option<String>), ExchangeError> {
        params.push(("startTime".to_string(), window.start_ms().to_string()));
        params.push(("endTime".to_string(), window.end_ms_inclusive().to_string()));
        params.push(("limit".to_string(), limit.to_string()));
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            params.push(("cursor".to_string(), cursor.to_string()));
        }

        let result = self.signed_get(credential, path, &params).await?;
        let rows = match result.get("list") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(_) => return Err(ExchangeError::malformed(BYBIT_ID, "list is not an array")),
            None => Vec::new(),
        };
        let next = result
            .get("nextPageCursor")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .map(str::to_string);

        let items = rows
            .into_iter()
            .filter(|row| {
                records::record_time(capability, row).map_or(true, |ts| window.contains(ts))
            })
            .filter(|row| is_settled(capability, row))
            .map(|row| RawRecord::new(BYBIT_ID, capability, row))
            .collect();
        Ok((items, next))
    }

    /// Walks each trading category in turn; the cursor is `index|inner`.
    async fn list_by_category(
        &self,
        credential: &DecryptedCredential,
        capability: Capability,
        path: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (index, inner) = match cursor {
            None => (0, None),
            Some(raw) => {
                let (index, inner) = raw.split_once('|').ok_or_else(|| {
                    ExchangeError::malformed(BYBIT_ID, format!("invalid cursor '{raw}'"))
                })?;
                let index = index.parse::<usize>().map_err(|_| {
                    ExchangeError::malformed(BYBIT_ID, format!("invalid cursor '{raw}'"))
                })?;
                (index, Some(inner))
            }
        };
        let Some(category) = TRADE_CATEGORIES.get(index) else {
            return Ok(Page::default());
        };

        let params = vec![("category".to_string(), category.to_string())];
        let (items, next) = self
            .list_page(
                credential,
                capability,
                path,
                params,
                EXECUTION_PAGE_LIMIT,
                window,
                inner,
            )
            .await?;

        let next_cursor = match next {
            Some(inner) => Some(format!("{index}|{inner}")),
            None if index + 1 < TRADE_CATEGORIES.len() => Some(format!("{}|", index + 1)),
            None => None,
        };
        Ok(Page { items, next_cursor })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn id(&self) -> &'static str {
        BYBIT_ID
    }

    fn capabilities(&self) -> AdapterCapabilities {
        let days = Duration::days;
        AdapterCapabilities::new(days(MAX_LOOKBACK_DAYS))
            .with(
                Capability::Trades,
                ChunkLimits::new(Duration::hours(1), days(7), days(7)),
            )
            .with(
                Capability::Orders,
                ChunkLimits::new(Duration::hours(1), days(7), days(7)),
            )
            .with(
                Capability::Deposits,
                ChunkLimits::new(days(1), days(30), days(30)),
            )
            .with(
                Capability::Withdrawals,
                ChunkLimits::new(days(1), days(30), days(30)),
            )
            .with(
                Capability::Transfers,
                ChunkLimits::new(days(1), days(7), days(6)),
            )
            .with(Capability::Klines, ChunkLimits::fixed(days(1)))
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            requests_per_minute: 600,
            burst_capacity: 10.0,
            min_interval: StdDuration::from_millis(100),
        }
    }

    fn requires_clock_sync(&self) -> bool {
        true
    }

    async fn sync_clock(&self) -> Result<(), ExchangeError> {
        let result = self.public_get("/v5/market/time", &[]).await?;
        let server_ms = string_field(&result, "timeNano")
            .and_then(|nanos| nanos.parse::<i64>().ok())
            .map(|nanos| nanos / 1_000_000)
            .or_else(|| {
                string_field(&result, "timeSecond")
                    .and_then(|secs| secs.parse::<i64>().ok())
                    .map(|secs| secs * 1000)
            })
            .ok_or_else(|| ExchangeError::malformed(BYBIT_ID, "missing server time"))?;

        let offset = server_ms - Utc::now().timestamp_millis();
        self.clock_offset_ms.store(offset, Ordering::Relaxed);
        debug!("Bybit clock offset set to {}ms", offset);
        Ok(())
    }

    fn extract(&self, record: &RawRecord) -> Result<RecordFields, ExchangeError> {
        records::extract(record)
    }

    async fn list_trades(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list_by_category(
            credential,
            Capability::Trades,
            "/v5/execution/list",
            window,
            cursor,
        )
        .await
    }

    async fn list_orders(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list_by_category(
            credential,
            Capability::Orders,
            "/v5/order/history",
            window,
            cursor,
        )
        .await
    }

    async fn list_deposits(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (items, next_cursor) = self
            .list_page(
                credential,
                Capability::Deposits,
                "/v5/asset/deposit/query-record",
                Vec::new(),
                ASSET_PAGE_LIMIT,
                window,
                cursor,
            )
            .await?;
        Ok(Page { items, next_cursor })
    }

    async fn list_withdrawals(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (items, next_cursor) = self
            .list_page(
                credential,
                Capability::Withdrawals,
                "/v5/asset/withdraw/query-record",
                vec![("withdrawType".to_string(), "2".to_string())],
                ASSET_PAGE_LIMIT,
                window,
                cursor,
            )
            .await?;
        Ok(Page { items, next_cursor })
    }

    async fn list_transfers(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (items, next_cursor) = self
            .list_page(
                credential,
                Capability::Transfers,
                "/v5/asset/transfer/query-inter-transfer-list",
                vec![("status".to_string(), "SUCCESS".to_string())],
                ASSET_PAGE_LIMIT,
                window,
                cursor,
            )
            .await?;
        Ok(Page { items, next_cursor })
    }

    async fn get_klines(
        &self,
        base: &str,
        quote: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let params = vec![
            ("category".to_string(), "spot".to_string()),
            ("symbol".to_string(), format!("{base}{quote}")),
            ("interval".to_string(), "D".to_string()),
            ("start".to_string(), window.start_ms().to_string()),
            ("end".to_string(), window.end_ms_inclusive().to_string()),
        ];
        let result = self.public_get("/v5/market/kline", &params).await?;
        let rows = match result.get("list") {
            Some(Value::Array(rows)) => rows,
            _ => return Err(ExchangeError::malformed(BYBIT_ID, "kline list missing")),
        };
        rows.iter().map(parse_kline).collect()
    }
}

/// Map a failed Bybit response to the error taxonomy.
pub(crate) fn classify_error(
    status: StatusCode,
    ret_code: Option<i64>,
    message: String,
) -> ExchangeError {
    let exchange = BYBIT_ID.to_string();
    match ret_code {
        Some(10002) => return ExchangeError::ClockSkew { exchange, message },
        Some(10003) | Some(10004) | Some(10005) | Some(10007) | Some(10009) | Some(33004) => {
            return ExchangeError::AuthRejected { exchange, message }
        }
        Some(10006) | Some(10018) => {
            return ExchangeError::RateLimited {
                exchange,
                retry_after: None,
            }
        }
        Some(10016) => return ExchangeError::TransientNetwork { exchange, message },
        _ => {}
    }

    // Bybit answers an IP-level throttle with a bare 403.
    if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
        ExchangeError::RateLimited {
            exchange,
            retry_after: None,
        }
    } else if status == StatusCode::UNAUTHORIZED {
        ExchangeError::AuthRejected { exchange, message }
    } else if status.is_server_error() {
        ExchangeError::TransientNetwork { exchange, message }
    } else if ret_code.is_some() || status.is_client_error() {
        ExchangeError::InvalidRequest { exchange, message }
    } else {
        ExchangeError::MalformedResponse { exchange, message }
    }
}

fn is_settled(capability: Capability, row: &Value) -> bool {
    match capability {
        // 3 = success
        Capability::Deposits => row.get("status").and_then(Value::as_i64).map_or(true, |s| s == 3),
        Capability::Withdrawals => row
            .get("status")
            .and_then(Value::as_str)
            .map_or(true, |s| s.eq_ignore_ascii_case("success")),
        Capability::Transfers => row
            .get("status")
            .and_then(Value::as_str)
            .map_or(true, |s| s == "SUCCESS"),
        Capability::Orders => decimal_field(row, "cumExecQty").is_some_and(|q| !q.is_zero()),
        _ => true,
    }
}

fn parse_kline(row: &Value) -> Result<Kline, ExchangeError> {
    let cell = |i: usize| -> Option<&str> { row.get(i).and_then(Value::as_str) };
    let number = |i: usize| -> Result<rust_decimal::Decimal, ExchangeError> {
        cell(i)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::malformed(BYBIT_ID, format!("bad kline cell {i}")))
    };
    let open_time = cell(0)
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| ExchangeError::malformed(BYBIT_ID, "bad kline start time"))?;

    Ok(Kline {
        open_time,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
    })
}
