//! Error types and retry classification for the exchanges crate.
//!
//! This module provides:
//! - [`ExchangeError`]: The main error enum for adapter and price operations
//! - [`RetryClass`]: Classification for determining retry behavior

mod retry;

pub use retry::RetryClass;

use std::time::Duration;

use chrono::NaiveDate;
use ledgersync_core::sync::SyncErrorKind;
use thiserror::Error;

/// Errors raised by exchange adapters, the rate limiter and price sources.
///
/// Each variant is classified into a [`RetryClass`] via
/// [`retry_class`](Self::retry_class) and into the run-level failure taxonomy
/// via [`kind`](Self::kind).
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Connection reset, timeout, 5xx.
    #[error("Network error from {exchange}: {message}")]
    TransientNetwork { exchange: String, message: String },

    /// The source throttled us. `retry_after` carries a mandated delay if the
    /// source sent one.
    #[error("Rate limited by {exchange}")]
    RateLimited {
        exchange: String,
        retry_after: Option<Duration>,
    },

    /// The source rejected the API key or signature.
    #[error("Authentication rejected by {exchange}: {message}")]
    AuthRejected { exchange: String, message: String },

    /// The request timestamp fell outside the source's receive window.
    #[error("Clock skew rejected by {exchange}: {message}")]
    ClockSkew { exchange: String, message: String },

    /// The response body could not be interpreted.
    #[error("Malformed response from {exchange}: {message}")]
    MalformedResponse { exchange: String, message: String },

    /// A single record could not be mapped; the record is skipped.
    #[error("Malformed record from {exchange}: {message}")]
    MalformedRecord { exchange: String, message: String },

    /// The adapter does not implement this capability.
    #[error("{operation} is not supported by {exchange}")]
    NotSupported { exchange: String, operation: String },

    /// The source rejected the request parameters (unknown symbol etc.).
    #[error("Invalid request to {exchange}: {message}")]
    InvalidRequest { exchange: String, message: String },

    /// Every price tier failed.
    #[error("No USD price available for {asset} on {day}")]
    PriceUnavailable { asset: String, day: NaiveDate },

    /// Vault failure while loading the credential for a call.
    #[error(transparent)]
    Credential(#[from] ledgersync_core::Error),
}

impl ExchangeError {
    pub fn not_supported(exchange: &str, operation: &str) -> Self {
        Self::NotSupported {
            exchange: exchange.to_string(),
            operation: operation.to_string(),
        }
    }

    pub fn malformed(exchange: &str, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            exchange: exchange.to_string(),
            message: message.into(),
        }
    }

    pub fn malformed_record(exchange: &str, message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            exchange: exchange.to_string(),
            message: message.into(),
        }
    }

    /// Map a transport-level reqwest error.
    pub fn from_transport(exchange: &str, err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::malformed(exchange, err.to_string())
        } else {
            Self::TransientNetwork {
                exchange: exchange.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Returns the retry classification for this error.
    ///
    /// ```
    /// use ledgersync_exchanges::errors::{ExchangeError, RetryClass};
    ///
    /// let error = ExchangeError::RateLimited { exchange: "BINANCE".to_string(), retry_after: None };
    /// assert_eq!(error.retry_class(), RetryClass::WithBackoff);
    /// ```
    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::TransientNetwork { .. } | Self::RateLimited { .. } => RetryClass::WithBackoff,

            Self::ClockSkew { .. } => RetryClass::ResyncClock,

            Self::MalformedResponse { .. }
            | Self::MalformedRecord { .. }
            | Self::NotSupported { .. }
            | Self::InvalidRequest { .. } => RetryClass::NextTier,

            Self::AuthRejected { .. } | Self::PriceUnavailable { .. } | Self::Credential(_) => {
                RetryClass::Never
            }
        }
    }

    /// Whether waiting and calling again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.retry_class() == RetryClass::WithBackoff
    }

    /// Run-level failure kind, if this error belongs to the taxonomy.
    pub fn kind(&self) -> Option<SyncErrorKind> {
        match self {
            Self::TransientNetwork { .. } => Some(SyncErrorKind::TransientNetwork),
            Self::RateLimited { .. } => Some(SyncErrorKind::SourceRateLimited),
            Self::AuthRejected { .. } => Some(SyncErrorKind::SourceAuthRejected),
            Self::ClockSkew { .. } => Some(SyncErrorKind::ClockSkewRejected),
            Self::MalformedResponse { .. } | Self::MalformedRecord { .. } => {
                Some(SyncErrorKind::MalformedRecord)
            }
            Self::PriceUnavailable { .. } => Some(SyncErrorKind::PriceUnavailable),
            Self::Credential(ledgersync_core::Error::CredentialCorruptOrMismatched { .. }) => {
                Some(SyncErrorKind::CredentialCorruptOrMismatched)
            }
            Self::Credential(_) => Some(SyncErrorKind::CredentialUnavailable),
            Self::NotSupported { .. } | Self::InvalidRequest { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_back_off() {
        let err = ExchangeError::TransientNetwork {
            exchange: "BYBIT".into(),
            message: "connection reset".into(),
        };
        assert_eq!(err.retry_class(), RetryClass::WithBackoff);
        assert_eq!(err.kind(), Some(SyncErrorKind::TransientNetwork));
    }

    #[test]
    fn test_rate_limited_backs_off() {
        let err = ExchangeError::RateLimited {
            exchange: "BINANCE".into(),
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_class(), RetryClass::WithBackoff);
        assert_eq!(err.kind(), Some(SyncErrorKind::SourceRateLimited));
    }

    #[test]
    fn test_clock_skew_resyncs() {
        let err = ExchangeError::ClockSkew {
            exchange: "BYBIT".into(),
            message: "invalid request, please check your server timestamp".into(),
        };
        assert_eq!(err.retry_class(), RetryClass::ResyncClock);
        assert_eq!(err.kind(), Some(SyncErrorKind::ClockSkewRejected));
    }

    #[test]
    fn test_auth_rejected_never_retries() {
        let err = ExchangeError::AuthRejected {
            exchange: "BINANCE".into(),
            message: "Invalid API-key".into(),
        };
        assert_eq!(err.retry_class(), RetryClass::Never);
        assert_eq!(err.kind(), Some(SyncErrorKind::SourceAuthRejected));
    }

    #[test]
    fn test_not_supported_falls_through() {
        let err = ExchangeError::not_supported("BYBIT", "list_dividends");
        assert_eq!(err.retry_class(), RetryClass::NextTier);
        assert_eq!(err.kind(), None);
        assert_eq!(err.to_string(), "list_dividends is not supported by BYBIT");
    }

    #[test]
    fn test_malformed_maps_to_malformed_record() {
        let err = ExchangeError::malformed("BINANCE", "expected array");
        assert_eq!(err.retry_class(), RetryClass::NextTier);
        assert_eq!(err.kind(), Some(SyncErrorKind::MalformedRecord));
    }

    #[test]
    fn test_credential_corruption_kind() {
        let err: ExchangeError =
            ledgersync_core::Error::credential_corrupt("acc", "decryption failed").into();
        assert_eq!(err.retry_class(), RetryClass::Never);
        assert_eq!(err.kind(), Some(SyncErrorKind::CredentialCorruptOrMismatched));

        let missing: ExchangeError = ledgersync_core::Error::CredentialNotFound("acc".into()).into();
        assert_eq!(missing.retry_class(), RetryClass::Never);
        assert_eq!(missing.kind(), Some(SyncErrorKind::CredentialUnavailable));
    }

    #[test]
    fn test_price_unavailable_is_terminal() {
        let err = ExchangeError::PriceUnavailable {
            asset: "OBSCURE".into(),
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        };
        assert_eq!(err.retry_class(), RetryClass::Never);
        assert_eq!(err.to_string(), "No USD price available for OBSCURE on 2024-03-01");
    }
}
