//! Authenticated encryption for credential records.
//!
//! Every credential class has exactly one scheme. The account id is bound as
//! associated data, so a record copied onto another account fails to open.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;

use super::credentials_model::{
    CredentialMetadata, DecryptedCredential, EncryptedCredential,
    EncryptionScheme,
};
use crate::errors::{Error, Result};

/// Master key size in bytes.
pub const MASTER_KEY_SIZE: usize = 32;

const CHACHA_NONCE_SIZE: usize = 12;
const XCHACHA_NONCE_SIZE: usize = 24;

/// HKDF info string for per-account subkeys.
const SUBKEY_INFO: &[u8] = b"ledgersync-credential-subkey";

/// Holds the vault master key and performs the per-scheme AEAD operations.
pub struct CredentialCipher {
    master_key: [u8; MASTER_KEY_SIZE],
}

impl CredentialCipher {
    pub fn new(master_key: [u8; MASTER_KEY_SIZE]) -> Self {
        Self { master_key }
    }

    /// Build from a base64 string, or a raw 32-character ASCII value.
    pub fn from_encoded_key(raw: &str) -> Result<Self> {
        Ok(Self::new(decode_master_key(raw)?))
    }

    /// Encrypt a credential under the scheme bound to its class.
    pub fn seal(
        &self,
        account_id: &str,
        credential: &DecryptedCredential,
        metadata: CredentialMetadata,
    ) -> Result<EncryptedCredential> {
        let class = credential.class();
        let scheme = class.scheme();
        let plaintext = serde_json::to_vec(credential)?;
        let payload = Payload {
            msg: &plaintext,
            aad: account_id.as_bytes(),
        };

        let (nonce_bytes, ciphertext) = match scheme {
            EncryptionScheme::ChaCha20Poly1305 => {
                let mut nonce_bytes = [0u8; CHACHA_NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.master_key));
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), payload)
                    .map_err(|_| Error::Secret("Failed to encrypt credential".into()))?;
                (nonce_bytes.to_vec(), ciphertext)
            }
            EncryptionScheme::XChaCha20Poly1305Hkdf => {
                let mut nonce_bytes = [0u8; XCHACHA_NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let subkey = self.derive_subkey(account_id)?;
                let cipher = XChaCha20Poly1305::new(Key::from_slice(&subkey));
                let ciphertext = cipher
                    .encrypt(XNonce::from_slice(&nonce_bytes), payload)
                    .map_err(|_| Error::Secret("Failed to encrypt credential".into()))?;
                (nonce_bytes.to_vec(), ciphertext)
            }
        };

        Ok(EncryptedCredential {
            account_id: account_id.to_string(),
            class,
            scheme,
            nonce: BASE64.encode(nonce_bytes),
            ciphertext: BASE64.encode(ciphertext),
            metadata,
        })
    }

    /// Decrypt a record. Any failure is reported as
    /// [`Error::CredentialCorruptOrMismatched`].
    pub fn open(&self, record: &EncryptedCredential) -> Result<DecryptedCredential> {
        let account_id = record.account_id.as_str();

        if record.class.scheme() != record.scheme {
            return Err(Error::credential_corrupt(
                account_id,
                format!(
                    "scheme '{}' is not valid for credential class '{}'",
                    record.scheme, record.class
                ),
            ));
        }

        let nonce_bytes = BASE64
            .decode(&record.nonce)
            .map_err(|e| Error::credential_corrupt(account_id, format!("bad nonce: {e}")))?;
        let cipher_bytes = BASE64
            .decode(&record.ciphertext)
            .map_err(|e| Error::credential_corrupt(account_id, format!("bad ciphertext: {e}")))?;
        let payload = Payload {
            msg: &cipher_bytes,
            aad: account_id.as_bytes(),
        };

        let plaintext = match record.scheme {
            EncryptionScheme::ChaCha20Poly1305 => {
                if nonce_bytes.len() != CHACHA_NONCE_SIZE {
                    return Err(Error::credential_corrupt(account_id, "nonce length mismatch"));
                }
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.master_key));
                cipher.decrypt(Nonce::from_slice(&nonce_bytes), payload)
            }
            EncryptionScheme::XChaCha20Poly1305Hkdf => {
                if nonce_bytes.len() != XCHACHA_NONCE_SIZE {
                    return Err(Error::credential_corrupt(account_id, "nonce length mismatch"));
                }
                let subkey = self.derive_subkey(account_id)?;
                let cipher = XChaCha20Poly1305::new(Key::from_slice(&subkey));
                cipher.decrypt(XNonce::from_slice(&nonce_bytes), payload)
            }
        }
        .map_err(|_| Error::credential_corrupt(account_id, "decryption failed"))?;

        let credential: DecryptedCredential = serde_json::from_slice(&plaintext)
            .map_err(|e| Error::credential_corrupt(account_id, format!("invalid payload: {e}")))?;

        if credential.class() != record.class {
            return Err(Error::credential_corrupt(
                account_id,
                format!(
                    "payload class '{}' does not match record class '{}'",
                    credential.class(),
                    record.class
                ),
            ));
        }

        Ok(credential)
    }

    fn derive_subkey(&self, account_id: &str) -> Result<[u8; MASTER_KEY_SIZE]> {
        let hk = Hkdf::<Sha256>::new(Some(account_id.as_bytes()), &self.master_key);
        let mut subkey = [0u8; MASTER_KEY_SIZE];
        hk.expand(SUBKEY_INFO, &mut subkey)
            .map_err(|e| Error::Secret(format!("HKDF expansion failed: {e}")))?;
        Ok(subkey)
    }
}

impl std::fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("master_key", &"<redacted>")
            .finish()
    }
}

fn decode_master_key(raw: &str) -> Result<[u8; MASTER_KEY_SIZE]> {
    let trimmed = raw.trim();
    // 32 characters that are not base64 of 32 bytes are the raw key.
    let decoded = match BASE64.decode(trimmed) {
        Ok(bytes) if bytes.len() == MASTER_KEY_SIZE => bytes,
        _ if trimmed.len() == MASTER_KEY_SIZE => trimmed.as_bytes().to_vec(),
        Ok(bytes) => bytes,
        Err(_) => {
            return Err(Error::InvalidConfigValue(
                "vault key must be a base64 string or 32-byte ascii value".into(),
            ))
        }
    };

    if decoded.len() != MASTER_KEY_SIZE {
        return Err(Error::InvalidConfigValue(
            "vault key must decode to exactly 32 bytes".into(),
        ));
    }

    let mut key = [0u8; MASTER_KEY_SIZE];
    key.copy_from_slice(&decoded);
    Ok(key)
}
