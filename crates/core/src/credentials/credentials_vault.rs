use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};

use super::credentials_cipher::CredentialCipher;
use super::credentials_model::{CredentialMetadata, DecryptedCredential};
use super::credentials_store::CredentialStore;
use crate::errors::{Error, Result};

/// Encrypts credentials at rest and hands out plaintext on demand.
///
/// Callers are expected to drop the returned [`DecryptedCredential`] as soon
/// as the adapter call that needed it has finished.
pub struct CredentialVault {
    cipher: CredentialCipher,
    store: Arc<dyn CredentialStore>,
}

impl CredentialVault {
    pub fn new(cipher: CredentialCipher, store: Arc<dyn CredentialStore>) -> Self {
        Self { cipher, store }
    }

    /// Encrypt and persist a credential. Storing over an existing record is a
    /// rotation: the original `created_at` survives and `rotated_at` is set.
    pub fn store(
        &self,
        account_id: &str,
        mut metadata: CredentialMetadata,
        credential: &DecryptedCredential,
    ) -> Result<CredentialMetadata> {
        if account_id.trim().is_empty() {
            return Err(Error::Validation("account id must not be empty".into()));
        }

        if let Some(existing) = self.store.get(account_id)? {
            metadata.created_at = existing.metadata.created_at;
            metadata.rotated_at = Some(Utc::now());
            debug!("Rotating credential for account {}", account_id);
        }

        let record = self.cipher.seal(account_id, credential, metadata)?;
        let stored = record.metadata.clone();
        self.store.put(record)?;
        Ok(stored)
    }

    pub fn load(&self, account_id: &str) -> Result<DecryptedCredential> {
        let record = self
            .store
            .get(account_id)?
            .ok_or_else(|| Error::CredentialNotFound(account_id.to_string()))?;

        self.cipher.open(&record).inspect_err(|e| {
            warn!("Credential load failed for account {}: {}", account_id, e);
        })
    }

    /// Non-secret metadata; never decrypts.
    pub fn metadata(&self, account_id: &str) -> Result<CredentialMetadata> {
        self.store
            .get(account_id)?
            .map(|record| record.metadata)
            .ok_or_else(|| Error::CredentialNotFound(account_id.to_string()))
    }

    pub fn remove(&self, account_id: &str) -> Result<()> {
        self.store.delete(account_id)
    }
}
