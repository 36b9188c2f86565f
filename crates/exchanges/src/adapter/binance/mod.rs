//! Binance adapter.
//!
//! Covers the global, US, Japan and Turkey deployments plus the spot testnet.
//! Signed endpoints use HMAC-SHA256 over the query string with the key in the
//! `X-MBX-APIKEY` header.

mod records;

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use ledgersync_core::credentials::DecryptedCredential;
use ledgersync_core::sync::Capability;
use log::{debug, warn};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;

use crate::adapter::capabilities::{AdapterCapabilities, ChunkLimits, RateLimit};
use crate::adapter::traits::ExchangeAdapter;
use crate::adapter::wire::{decimal_field, encode_query, hmac_sha256_hex, string_field};
use crate::config::ExchangeConfig;
use crate::errors::ExchangeError;
use crate::models::{Kline, Page, RawRecord, RecordFields, TimeWindow};

/// Exchange id constant
pub const BINANCE_ID: &str = "BINANCE";

const TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: i64 = 60_000;
const ID_PAGE_LIMIT: usize = 1000;
const OFFSET_PAGE_LIMIT: usize = 1000;
const TRANSFER_PAGE_SIZE: usize = 100;
const EARNINGS_PAGE_SIZE: usize = 100;
const DIVIDEND_LIMIT: usize = 500;

/// Symbols scanned for trades and orders when none are configured.
const DEFAULT_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "ADAUSDT"];

/// Universal transfer directions scanned by the transfers step.
const TRANSFER_TYPES: &[&str] = &[
    "MAIN_UMFUTURE",
    "UMFUTURE_MAIN",
    "MAIN_FUNDING",
    "FUNDING_MAIN",
    "MAIN_MARGIN",
    "MARGIN_MAIN",
];

/// Deployment selected by the account's region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinanceRegion {
    Global,
    Us,
    Jp,
    Tr,
}

impl BinanceRegion {
    pub fn parse(code: Option<&str>) -> Result<Self, ExchangeError> {
        match code.map(str::to_ascii_uppercase).as_deref() {
            None | Some("GLOBAL") => Ok(Self::Global),
            Some("US") => Ok(Self::Us),
            Some("JP") => Ok(Self::Jp),
            Some("TR") => Ok(Self::Tr),
            Some(other) => Err(ExchangeError::InvalidRequest {
                exchange: BINANCE_ID.to_string(),
                message: format!("unknown region '{other}'"),
            }),
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::Global => "https://api.binance.com",
            Self::Us => "https://api.binance.us",
            Self::Jp => "https://api.binance.co.jp",
            Self::Tr => "https://api.binance.tr",
        }
    }
}

/// Product variant selecting the capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinanceVariant {
    /// Spot, wallet, convert, earn and dividends.
    Full,
    /// Spot trades plus deposits and withdrawals.
    SpotOnly,
}

impl BinanceVariant {
    pub fn parse(code: Option<&str>) -> Result<Self, ExchangeError> {
        match code.map(str::to_ascii_uppercase).as_deref() {
            None | Some("FULL") => Ok(Self::Full),
            Some("SPOT") | Some("SPOT_ONLY") => Ok(Self::SpotOnly),
            Some(other) => Err(ExchangeError::InvalidRequest {
                exchange: BINANCE_ID.to_string(),
                message: format!("unknown product variant '{other}'"),
            }),
        }
    }
}

pub struct BinanceAdapter {
    client: Client,
    base_url: String,
    region: BinanceRegion,
    variant: BinanceVariant,
    testnet: bool,
    symbols: Vec<String>,
    clock_offset_ms: AtomicI64,
}

impl BinanceAdapter {
    pub fn new(config: &ExchangeConfig) -> Result<Self, ExchangeError> {
        let region = BinanceRegion::parse(config.region_code().as_deref())?;
        let variant = BinanceVariant::parse(config.product_variant.as_deref())?;
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
            "Binance adapter: region={:?} variant={:?} testnet={} base_url={}",
            region, variant, config.testnet, base_url
        );

        Ok(Self {
            client,
            base_url,
            region,
            variant,
            testnet: config.testnet,
            symbols: DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            clock_offset_ms: AtomicI64::new(0),
        })
    }

    /// Replace the symbols scanned for trades and orders.
    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        if !symbols.is_empty() {
            self.symbols = symbols;
        }
        self
    }

    fn timestamp_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock_offset_ms.load(Ordering::Relaxed)
    }

    async fn signed_get(
        &self,
        credential: &DecryptedCredential,
        path: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        let (api_key, api_secret) = credential.key_pair().ok_or_else(|| {
            ExchangeError::AuthRejected {
                exchange: BINANCE_ID.to_string(),
                message: "Binance requires an API key pair credential".to_string(),
            }
        })?;

        params.push(("recvWindow".to_string(), RECV_WINDOW_MS.to_string()));
        params.push(("timestamp".to_string(), self.timestamp_ms().to_string()));
        let query = encode_query(&params);
        let signature = hmac_sha256_hex(api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.send(self.client.get(url).header("X-MBX-APIKEY", api_key))
            .await
    }

    async fn public_get(
        &self,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<Value, ExchangeError> {
        let url = format!("{}{}?{}", self.base_url, path, encode_query(&params));
        self.send(self.client.get(url)).await
    }

    async fn send(&self, request: RequestBuilder) -> Result<Value, ExchangeError> {
        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(BINANCE_ID, e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(StdDuration::from_secs);
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::from_transport(BINANCE_ID, e))?;

        if !status.is_success() {
            let err = classify_error(status, retry_after, &body);
            warn!("Binance request failed ({}): {}", status, err);
            return Err(err);
        }

        serde_json::from_str(&body).map_err(|e| ExchangeError::malformed(BINANCE_ID, e.to_string()))
    }

    /// Per-symbol pagination by record id: the first page of a symbol is
    /// bounded by the window, later pages continue from the last id seen.
    async fn list_by_symbol(
        &self,
        credential: &DecryptedCredential,
        capability: Capability,
        path: &str,
        id_key: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (index, from_id) = parse_indexed_cursor(cursor)?;
        let Some(symbol) = self.symbols.get(index) else {
            return Ok(Page::default());
        };

        let mut params = vec![
            ("symbol".to_string(), symbol.clone()),
            ("limit".to_string(), ID_PAGE_LIMIT.to_string()),
        ];
        match from_id {
            Some(id) => params.push((id_key_param(id_key).to_string(), id.to_string())),
            None => {
                params.push(("startTime".to_string(), window.start_ms().to_string()));
                params.push(("endTime".to_string(), window.end_ms_inclusive().to_string()));
            }
        }

        let rows = into_rows(self.signed_get(credential, path, params).await?)?;
        let full_page = rows.len() >= ID_PAGE_LIMIT;

        let mut items = Vec::with_capacity(rows.len());
        let mut last_id: Option<i64> = None;
        let mut past_end = false;
        for row in rows {
            if let Some(id) = row.get(id_key).and_then(Value::as_i64) {
                last_id = Some(last_id.map_or(id, |prev| prev.max(id)));
            }
            match records::record_time(capability, &row) {
                Some(ts) if ts >= window.end => past_end = true,
                Some(ts) if ts < window.start => {}
                _ => {
                    if capability == Capability::Orders && !is_filled_order(&row) {
                        continue;
                    }
                    items.push(RawRecord::new(BINANCE_ID, capability, row));
                }
            }
        }

        let next = match last_id {
            Some(id) if full_page && !past_end => Some(format!("{}:{}", index, id + 1)),
            _ if index + 1 < self.symbols.len() => Some(format!("{}:", index + 1)),
            _ => None,
        };
        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    /// Offset pagination inside one window (capital deposit/withdraw history).
    async fn list_by_offset(
        &self,
        credential: &DecryptedCredential,
        capability: Capability,
        path: &str,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let offset = parse_number_cursor(cursor)?;
        let params = vec![
            ("startTime".to_string(), window.start_ms().to_string()),
            ("endTime".to_string(), window.end_ms_inclusive().to_string()),
            ("offset".to_string(), offset.to_string()),
            ("limit".to_string(), OFFSET_PAGE_LIMIT.to_string()),
        ];

        let rows = into_rows(self.signed_get(credential, path, params).await?)?;
        let next = (rows.len() >= OFFSET_PAGE_LIMIT).then(|| (offset + rows.len()).to_string());
        let items = rows
            .into_iter()
            .filter(|row| in_window(capability, row, window))
            .filter(|row| is_settled(capability, row))
            .map(|row| RawRecord::new(BINANCE_ID, capability, row))
            .collect();

        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    fn window_params(window: &TimeWindow) -> Vec<(String, String)> {
        vec![
            ("startTime".to_string(), window.start_ms().to_string()),
            ("endTime".to_string(), window.end_ms_inclusive().to_string()),
        ]
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn id(&self) -> &'static str {
        BINANCE_ID
    }

    fn capabilities(&self) -> AdapterCapabilities {
        let days = Duration::days;
        let mut caps = AdapterCapabilities::new(days(5 * 365))
            .with(Capability::Trades, ChunkLimits::fixed(Duration::hours(24)))
            .with(Capability::Orders, ChunkLimits::fixed(Duration::hours(24)))
            .with(Capability::Klines, ChunkLimits::fixed(days(1)));

        if self.testnet {
            return caps;
        }

        caps = caps
            .with(
                Capability::Deposits,
                ChunkLimits::new(days(1), days(90), days(90)),
            )
            .with(
                Capability::Withdrawals,
                ChunkLimits::new(days(1), days(90), days(90)),
            );

        if self.variant == BinanceVariant::SpotOnly {
            return caps;
        }

        caps = caps
            .with(
                Capability::Transfers,
                ChunkLimits::new(days(1), days(30), days(30)),
            )
            .with(
                Capability::Conversions,
                ChunkLimits::new(days(1), days(30), days(30)),
            );

        match self.region {
            BinanceRegion::Global | BinanceRegion::Jp => caps
                .with(
                    Capability::Earnings,
                    ChunkLimits::new(days(1), days(90), days(90)),
                )
                .with(
                    Capability::Dividends,
                    ChunkLimits::new(days(1), days(180), days(90)),
                ),
            BinanceRegion::Us => caps.without(Capability::Conversions),
            BinanceRegion::Tr => caps,
        }
    }

    fn rate_limit(&self) -> RateLimit {
        RateLimit {
            requests_per_minute: 1200,
            burst_capacity: 10.0,
            min_interval: StdDuration::from_millis(100),
        }
    }

    async fn sync_clock(&self) -> Result<(), ExchangeError> {
        let body = self.public_get("/api/v3/time", Vec::new()).await?;
        let server_ms = body
            .get("serverTime")
            .and_then(Value::as_i64)
            .ok_or_else(|| ExchangeError::malformed(BINANCE_ID, "missing serverTime"))?;
        let offset = server_ms - Utc::now().timestamp_millis();
        self.clock_offset_ms.store(offset, Ordering::Relaxed);
        debug!("Binance clock offset set to {}ms", offset);
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
        self.list_by_symbol(
            credential,
            Capability::Trades,
            "/api/v3/myTrades",
            "id",
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
        self.list_by_symbol(
            credential,
            Capability::Orders,
            "/api/v3/allOrders",
            "orderId",
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
        self.list_by_offset(
            credential,
            Capability::Deposits,
            "/sapi/v1/capital/deposit/hisrec",
            window,
            cursor,
        )
        .await
    }

    async fn list_withdrawals(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        self.list_by_offset(
            credential,
            Capability::Withdrawals,
            "/sapi/v1/capital/withdraw/history",
            window,
            cursor,
        )
        .await
    }

    async fn list_transfers(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let (index, page) = parse_indexed_cursor(cursor)?;
        let Some(transfer_type) = TRANSFER_TYPES.get(index) else {
            return Ok(Page::default());
        };
        let current = page.unwrap_or(1);

        let mut params = Self::window_params(window);
        params.push(("type".to_string(), transfer_type.to_string()));
        params.push(("current".to_string(), current.to_string()));
        params.push(("size".to_string(), TRANSFER_PAGE_SIZE.to_string()));

        let body = self
            .signed_get(credential, "/sapi/v1/asset/transfer", params)
            .await?;
        // An empty result omits "rows" entirely.
        let rows = match body.get("rows") {
            Some(rows) => into_rows(rows.clone())?,
            None => Vec::new(),
        };

        let next = if rows.len() >= TRANSFER_PAGE_SIZE {
            Some(format!("{}:{}", index, current + 1))
        } else if index + 1 < TRANSFER_TYPES.len() {
            Some(format!("{}:", index + 1))
        } else {
            None
        };
        let items = rows
            .into_iter()
            .filter(|row| in_window(Capability::Transfers, row, window))
            .filter(|row| is_settled(Capability::Transfers, row))
            .map(|row| RawRecord::new(BINANCE_ID, Capability::Transfers, row))
            .collect();

        Ok(Page {
            items,
            next_cursor: next,
        })
    }

    async fn list_conversions(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let mut params = Self::window_params(window);
        params.push(("limit".to_string(), "1000".to_string()));

        let body = self
            .signed_get(credential, "/sapi/v1/convert/tradeFlow", params)
            .await?;
        let rows = into_rows(body.get("list").cloned().unwrap_or(Value::Array(vec![])))?;
        if body.get("moreData").and_then(Value::as_bool) == Some(true) {
            warn!("Binance convert history truncated for window {:?}", window);
        }

        Ok(Page::last(
            rows.into_iter()
                .filter(|row| in_window(Capability::Conversions, row, window))
                .filter(|row| is_settled(Capability::Conversions, row))
                .map(|row| RawRecord::new(BINANCE_ID, Capability::Conversions, row))
                .collect(),
        ))
    }

    async fn list_earnings(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let current = parse_number_cursor(cursor)?.max(1);
        let mut params = Self::window_params(window);
        params.push(("product".to_string(), "STAKING".to_string()));
        params.push(("txnType".to_string(), "INTEREST".to_string()));
        params.push(("current".to_string(), current.to_string()));
        params.push(("size".to_string(), EARNINGS_PAGE_SIZE.to_string()));

        let rows = into_rows(
            self.signed_get(credential, "/sapi/v1/staking/stakingRecord", params)
                .await?,
        )?;
        let next = (rows.len() >= EARNINGS_PAGE_SIZE).then(|| (current + 1).to_string());

        Ok(Page {
            items: rows
                .into_iter()
                .filter(|row| in_window(Capability::Earnings, row, window))
                .map(|row| RawRecord::new(BINANCE_ID, Capability::Earnings, row))
                .collect(),
            next_cursor: next,
        })
    }

    async fn list_dividends(
        &self,
        credential: &DecryptedCredential,
        window: &TimeWindow,
        _cursor: Option<&str>,
    ) -> Result<Page, ExchangeError> {
        let mut params = Self::window_params(window);
        params.push(("limit".to_string(), DIVIDEND_LIMIT.to_string()));

        let body = self
            .signed_get(credential, "/sapi/v1/asset/assetDividend", params)
            .await?;
        let rows = into_rows(body.get("rows").cloned().unwrap_or(Value::Array(vec![])))?;

        Ok(Page::last(
            rows.into_iter()
                .filter(|row| in_window(Capability::Dividends, row, window))
                .map(|row| RawRecord::new(BINANCE_ID, Capability::Dividends, row))
                .collect(),
        ))
    }

    async fn get_klines(
        &self,
        base: &str,
        quote: &str,
        window: &TimeWindow,
    ) -> Result<Vec<Kline>, ExchangeError> {
        let mut params = vec![
            ("symbol".to_string(), format!("{base}{quote}")),
            ("interval".to_string(), "1d".to_string()),
        ];
        params.extend(Self::window_params(window));

        let rows = into_rows(self.public_get("/api/v3/klines", params).await?)?;
        rows.iter().map(parse_kline).collect()
    }
}

/// Map a non-2xx Binance response to the error taxonomy.
pub(crate) fn classify_error(
    status: StatusCode,
    retry_after: Option<StdDuration>,
    body: &str,
) -> ExchangeError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let code = parsed
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(Value::as_i64);
    let message = parsed
        .as_ref()
        .and_then(|v| string_field(v, "msg"))
        .unwrap_or_else(|| body.chars().take(200).collect());
    let exchange = BINANCE_ID.to_string();

    if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 418 || code == Some(-1003) {
        return ExchangeError::RateLimited {
            exchange,
            retry_after,
        };
    }

    match code {
        Some(-1021) => return ExchangeError::ClockSkew { exchange, message },
        Some(-1022) | Some(-2008) | Some(-2014) | Some(-2015) => {
            return ExchangeError::AuthRejected { exchange, message }
        }
        _ => {}
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ExchangeError::AuthRejected { exchange, message }
    } else if status.is_server_error() {
        ExchangeError::TransientNetwork { exchange, message }
    } else if status.is_client_error() {
        ExchangeError::InvalidRequest { exchange, message }
    } else {
        ExchangeError::MalformedResponse { exchange, message }
    }
}

fn id_key_param(id_key: &str) -> &'static str {
    match id_key {
        "orderId" => "orderId",
        _ => "fromId",
    }
}

/// "index:value" where value may be empty.
fn parse_indexed_cursor(cursor: Option<&str>) -> Result<(usize, Option<i64>), ExchangeError> {
    let Some(cursor) = cursor else {
        return Ok((0, None));
    };
    let bad = || ExchangeError::malformed(BINANCE_ID, format!("invalid cursor '{cursor}'"));
    let (index, value) = cursor.split_once(':').ok_or_else(bad)?;
    let index = index.parse::<usize>().map_err(|_| bad())?;
    let value = if value.is_empty() {
        None
    } else {
        Some(value.parse::<i64>().map_err(|_| bad())?)
    };
    Ok((index, value))
}

fn parse_number_cursor(cursor: Option<&str>) -> Result<usize, ExchangeError> {
    match cursor {
        None => Ok(0),
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ExchangeError::malformed(BINANCE_ID, format!("invalid cursor '{raw}'"))),
    }
}

fn into_rows(body: Value) -> Result<Vec<Value>, ExchangeError> {
    match body {
        Value::Array(rows) => Ok(rows),
        other => Err(ExchangeError::malformed(
            BINANCE_ID,
            format!("expected an array, got {}", type_name(&other)),
        )),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Rows without a parsable timestamp are kept so the normalizer can count
/// them as malformed.
fn in_window(capability: Capability, row: &Value, window: &TimeWindow) -> bool {
    records::record_time(capability, row).map_or(true, |ts| window.contains(ts))
}

fn is_settled(capability: Capability, row: &Value) -> bool {
    match capability {
        // 1 = success, 6 = credited but cannot withdraw
        Capability::Deposits => matches!(row.get("status").and_then(Value::as_i64), Some(1) | Some(6)),
        // 6 = completed
        Capability::Withdrawals => row.get("status").and_then(Value::as_i64) == Some(6),
        Capability::Transfers => row
            .get("status")
            .and_then(Value::as_str)
            .map_or(true, |s| s == "CONFIRMED"),
        Capability::Conversions => row
            .get("orderStatus")
            .and_then(Value::as_str)
            .map_or(true, |s| s == "SUCCESS"),
        _ => true,
    }
}

fn is_filled_order(row: &Value) -> bool {
    decimal_field(row, "executedQty").is_some_and(|qty| !qty.is_zero())
}

fn parse_kline(row: &Value) -> Result<Kline, ExchangeError> {
    let cell = |i: usize| -> Result<rust_decimal::Decimal, ExchangeError> {
        row.get(i)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ExchangeError::malformed(BINANCE_ID, format!("bad kline cell {i}")))
    };
    let open_time = row
        .get(0)
        .and_then(Value::as_i64)
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(|| ExchangeError::malformed(BINANCE_ID, "bad kline open time"))?;

    Ok(Kline {
        open_time,
        open: cell(1)?,
        high: cell(2)?,
        low: cell(3)?,
        close: cell(4)?,
    })
}
