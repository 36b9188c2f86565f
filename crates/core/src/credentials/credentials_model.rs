//! Credential domain models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Class of credential material. Each class is bound to exactly one
/// encryption scheme (see [`CredentialClass::scheme`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialClass {
    /// Simple key/secret pair (optionally with a passphrase).
    ApiKeyPair,
    /// Structured private-key blob (e.g. an EC key in PEM form).
    PrivateKeyBlob,
}

impl CredentialClass {
    /// The one scheme records of this class are written and read with.
    pub fn scheme(self) -> EncryptionScheme {
        match self {
            CredentialClass::ApiKeyPair => EncryptionScheme::ChaCha20Poly1305,
            CredentialClass::PrivateKeyBlob => EncryptionScheme::XChaCha20Poly1305Hkdf,
        }
    }
}

impl fmt::Display for CredentialClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialClass::ApiKeyPair => write!(f, "api_key_pair"),
            CredentialClass::PrivateKeyBlob => write!(f, "private_key_blob"),
        }
    }
}

/// Encryption scheme tag persisted with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionScheme {
    /// ChaCha20-Poly1305 under the master key, 12-byte nonce.
    #[serde(rename = "chacha20poly1305")]
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 under an HKDF-SHA256 per-account subkey, 24-byte nonce.
    #[serde(rename = "xchacha20poly1305-hkdf")]
    XChaCha20Poly1305Hkdf,
}

impl fmt::Display for EncryptionScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionScheme::ChaCha20Poly1305 => write!(f, "chacha20poly1305"),
            EncryptionScheme::XChaCha20Poly1305Hkdf => write!(f, "xchacha20poly1305-hkdf"),
        }
    }
}

/// Non-secret metadata describing which source an account links to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    /// Exchange identifier, e.g. "BINANCE".
    pub exchange_id: String,
    /// Region selecting the base endpoint (exchange-specific, e.g. "US").
    pub region: Option<String>,
    /// Product variant selecting the exposed capability set.
    pub product_variant: Option<String>,
    #[serde(default)]
    pub testnet: bool,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
}

impl CredentialMetadata {
    pub fn new(exchange_id: impl Into<String>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            region: None,
            product_variant: None,
            testnet: false,
            created_at: Utc::now(),
            rotated_at: None,
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_product_variant(mut self, variant: impl Into<String>) -> Self {
        self.product_variant = Some(variant.into());
        self
    }

    pub fn with_testnet(mut self, testnet: bool) -> Self {
        self.testnet = testnet;
        self
    }
}

/// Plaintext credential material.
///
/// Only ever held for the duration of one adapter call. `Debug` redacts
/// every secret field.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum DecryptedCredential {
    ApiKeyPair {
        api_key: String,
        api_secret: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    PrivateKeyBlob {
        key_name: String,
        private_key_pem: String,
    },
}

impl DecryptedCredential {
    pub fn api_key_pair(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        DecryptedCredential::ApiKeyPair {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: None,
        }
    }

    pub fn class(&self) -> CredentialClass {
        match self {
            DecryptedCredential::ApiKeyPair { .. } => CredentialClass::ApiKeyPair,
            DecryptedCredential::PrivateKeyBlob { .. } => CredentialClass::PrivateKeyBlob,
        }
    }

    /// Returns (key, secret) for HMAC-signing sources.
    pub fn key_pair(&self) -> Option<(&str, &str)> {
        match self {
            DecryptedCredential::ApiKeyPair {
                api_key, api_secret, ..
            } => Some((api_key.as_str(), api_secret.as_str())),
            DecryptedCredential::PrivateKeyBlob { .. } => None,
        }
    }
}

impl fmt::Debug for DecryptedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecryptedCredential::ApiKeyPair { passphrase, .. } => f
                .debug_struct("ApiKeyPair")
                .field("api_key", &"<redacted>")
                .field("api_secret", &"<redacted>")
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            DecryptedCredential::PrivateKeyBlob { key_name, .. } => f
                .debug_struct("PrivateKeyBlob")
                .field("key_name", key_name)
                .field("private_key_pem", &"<redacted>")
                .finish(),
        }
    }
}

/// Encrypted credential as persisted by a [`CredentialStore`](super::CredentialStore).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedCredential {
    pub account_id: String,
    pub class: CredentialClass,
    pub scheme: EncryptionScheme,
    /// Base64-encoded nonce.
    pub nonce: String,
    /// Base64-encoded ciphertext including the AEAD tag.
    pub ciphertext: String,
    pub metadata: CredentialMetadata,
}
