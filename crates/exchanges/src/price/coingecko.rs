//! CoinGecko historical price oracle.
//!
//! Uses `/coins/{id}/history?date=dd-mm-yyyy`; with an API key the pro host
//! is used instead of the public one.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use log::{debug, info};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;

use super::source::{PriceSource, PriceTier};
use crate::adapter::wire::decimal_field;
use crate::errors::ExchangeError;
use crate::registry::{call_with_backoff, BackoffPolicy};

const ORACLE_ID: &str = "COINGECKO";
const PUBLIC_URL: &str = "https://api.coingecko.com/api/v3";
const PRO_URL: &str = "https://pro-api.coingecko.com/api/v3";

/// Symbol to CoinGecko coin id.
const COIN_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("USDT", "tether"),
    ("USDC", "usd-coin"),
    ("BNB", "binancecoin"),
    ("XRP", "ripple"),
    ("ADA", "cardano"),
    ("DOGE", "dogecoin"),
    ("SOL", "solana"),
    ("TRX", "tron"),
    ("DOT", "polkadot"),
    ("MATIC", "matic-network"),
    ("AVAX", "avalanche-2"),
    ("SHIB", "shiba-inu"),
    ("WBTC", "wrapped-bitcoin"),
    ("WETH", "weth"),
    ("UNI", "uniswap"),
    ("LINK", "chainlink"),
    ("LTC", "litecoin"),
    ("NEAR", "near"),
    ("ATOM", "cosmos"),
    ("XLM", "stellar"),
    ("XMR", "monero"),
    ("BCH", "bitcoin-cash"),
    ("ALGO", "algorand"),
    ("HBAR", "hedera"),
    ("ICP", "internet-computer"),
    ("XTZ", "tezos"),
    ("AAVE", "aave"),
    ("EOS", "eos"),
    ("FTM", "fantom"),
    ("GRT", "the-graph"),
    ("MKR", "maker"),
    ("APE", "apecoin"),
    ("LDO", "lido-dao"),
    ("CRV", "curve-dao-token"),
    ("SNX", "havven"),
    ("OP", "optimism"),
    ("ARB", "arbitrum"),
    ("INJ", "injective-protocol"),
    ("SUI", "sui"),
    ("PEPE", "pepe"),
    ("TON", "the-open-network"),
    ("WIF", "dogwifhat"),
    ("BONK", "bonk"),
    ("DAI", "dai"),
];

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    market_data: Option<MarketData>,
}

#[derive(Debug, Deserialize)]
struct MarketData {
    current_price: Value,
}

/// External price oracle, the last tier before giving up.
pub struct CoinGeckoOracle {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    ids: HashMap<String, String>,
    retry: BackoffPolicy,
}

impl CoinGeckoOracle {
    pub fn new(api_key: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        let base_url = if api_key.is_some() { PRO_URL } else { PUBLIC_URL };

        Self {
            client,
            base_url: base_url.to_string(),
            api_key,
            ids: COIN_IDS
                .iter()
                .map(|(symbol, id)| (symbol.to_string(), id.to_string()))
                .collect(),
            retry: BackoffPolicy {
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(8),
                max_retries: 3,
                jitter: false,
            },
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register or replace a symbol mapping.
    pub fn with_coin_id(mut self, symbol: &str, coin_id: &str) -> Self {
        self.ids
            .insert(symbol.to_ascii_uppercase(), coin_id.to_string());
        self
    }

    pub fn coin_id(&self, symbol: &str) -> Option<&str> {
        self.ids.get(&symbol.to_ascii_uppercase()).map(String::as_str)
    }

    async fn fetch_once(&self, coin_id: &str, day: NaiveDate) -> Result<Value, ExchangeError> {
        let url = format!("{}/coins/{}/history", self.base_url, coin_id);
        let date = day.format("%d-%m-%Y").to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("date", date.as_str()), ("localization", "false")]);
        if let Some(key) = &self.api_key {
            request = request.header("x-cg-pro-api-key", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_transport(ORACLE_ID, e))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited {
                exchange: ORACLE_ID.to_string(),
                retry_after: None,
            });
        }
        if status.is_server_error() {
            return Err(ExchangeError::TransientNetwork {
                exchange: ORACLE_ID.to_string(),
                message: format!("HTTP {status}"),
            });
        }
        if !status.is_success() {
            return Err(ExchangeError::InvalidRequest {
                exchange: ORACLE_ID.to_string(),
                message: format!("HTTP {status}"),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ExchangeError::from_transport(ORACLE_ID, e))
    }

    /// `fetch_once` under the shared backoff policy.
    async fn fetch_with_retry(
        &self,
        coin_id: &str,
        day: NaiveDate,
    ) -> Result<Value, ExchangeError> {
        call_with_backoff(&self.retry, ORACLE_ID, || self.fetch_once(coin_id, day)).await
    }
}

/// USD price out of a `/coins/{id}/history` body.
fn parse_history(body: Value) -> Option<Decimal> {
    let parsed: HistoryResponse = serde_json::from_value(body).ok()?;
    decimal_field(&parsed.market_data?.current_price, "usd")
}

#[async_trait]
impl PriceSource for CoinGeckoOracle {
    fn tier(&self) -> PriceTier {
        PriceTier::Oracle
    }

    async fn quote(&self, asset: &str, day: NaiveDate) -> Result<Decimal, ExchangeError> {
        let unavailable = || ExchangeError::PriceUnavailable {
            asset: asset.to_ascii_uppercase(),
            day,
        };

        let Some(coin_id) = self.coin_id(asset) else {
            debug!("CoinGecko: no coin id for {}", asset);
            return Err(unavailable());
        };

        let body = self.fetch_with_retry(coin_id, day).await?;
        match parse_history(body) {
            Some(price) => {
                info!("CoinGecko: {} on {} = {}", asset, day, price);
                Ok(price)
            }
            None => Err(unavailable()),
        }
    }
}
