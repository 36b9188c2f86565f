use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Mutex, RwLock},
};

use serde::{Deserialize, Serialize};

use super::credentials_model::EncryptedCredential;
use crate::errors::{Error, Result};

const CURRENT_VERSION: u32 = 1;

/// Persistence for encrypted credential records, keyed by account id.
///
/// Stores only ever see ciphertext; encryption happens in the vault.
pub trait CredentialStore: Send + Sync {
    fn put(&self, record: EncryptedCredential) -> Result<()>;
    fn get(&self, account_id: &str) -> Result<Option<EncryptedCredential>>;
    fn delete(&self, account_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    records: RwLock<HashMap<String, EncryptedCredential>>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn put(&self, record: EncryptedCredential) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Secret("Credential store lock poisoned".into()))?;
        records.insert(record.account_id.clone(), record);
        Ok(())
    }

    fn get(&self, account_id: &str) -> Result<Option<EncryptedCredential>> {
        let records = self
            .records
            .read()
            .map_err(|_| Error::Secret("Credential store lock poisoned".into()))?;
        Ok(records.get(account_id).cloned())
    }

    fn delete(&self, account_id: &str) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| Error::Secret("Credential store lock poisoned".into()))?;
        records.remove(account_id);
        Ok(())
    }
}

/// JSON file holding every encrypted record. Each write rewrites the file.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

#[derive(Serialize, Deserialize, Default)]
struct CredentialFile {
    version: u32,
    records: HashMap<String, EncryptedCredential>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn with_file<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce(&mut HashMap<String, EncryptedCredential>),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Secret("Credential store lock poisoned".into()))?;
        let mut records = self.load_locked()?;
        op(&mut records);
        self.persist_locked(records)
    }

    fn load_locked(&self) -> Result<HashMap<String, EncryptedCredential>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let raw = fs::read(&self.path)?;
        if raw.is_empty() {
            return Ok(HashMap::new());
        }

        let file: CredentialFile = serde_json::from_slice(&raw)?;
        if file.version != CURRENT_VERSION {
            return Err(Error::Secret(format!(
                "Unsupported credential file version {}",
                file.version
            )));
        }
        Ok(file.records)
    }

    fn persist_locked(&self, records: HashMap<String, EncryptedCredential>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = CredentialFile {
            version: CURRENT_VERSION,
            records,
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn put(&self, record: EncryptedCredential) -> Result<()> {
        self.with_file(|records| {
            records.insert(record.account_id.clone(), record);
        })
    }

    fn get(&self, account_id: &str) -> Result<Option<EncryptedCredential>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Secret("Credential store lock poisoned".into()))?;
        Ok(self.load_locked()?.remove(account_id))
    }

    fn delete(&self, account_id: &str) -> Result<()> {
        self.with_file(|records| {
            records.remove(account_id);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{CredentialClass, CredentialMetadata, EncryptionScheme};
    use tempfile::tempdir;

    fn record(account_id: &str) -> EncryptedCredential {
        EncryptedCredential {
            account_id: account_id.to_string(),
            class: CredentialClass::ApiKeyPair,
            scheme: EncryptionScheme::ChaCha20Poly1305,
            nonce: "bm9uY2U=".to_string(),
            ciphertext: "Y2lwaGVy".to_string(),
            metadata: CredentialMetadata::new("BINANCE"),
        }
    }

    #[test]
    fn file_store_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = FileCredentialStore::new(path.clone());
        store.put(record("acc-1")).unwrap();
        store.put(record("acc-2")).unwrap();

        let reopened = FileCredentialStore::new(path.clone());
        let loaded = reopened.get("acc-1").unwrap().unwrap();
        assert_eq!(loaded.ciphertext, "Y2lwaGVy");

        reopened.delete("acc-1").unwrap();
        assert!(reopened.get("acc-1").unwrap().is_none());
        assert!(reopened.get("acc-2").unwrap().is_some());

        let contents = fs::read_to_string(path).unwrap();
        assert!(contents.contains("\"version\": 1"));
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested/credentials.json"));
        assert!(store.get("nobody").unwrap().is_none());
    }

    #[test]
    fn memory_store_overwrites_by_account() {
        let store = InMemoryCredentialStore::new();
        store.put(record("acc-1")).unwrap();
        let mut updated = record("acc-1");
        updated.nonce = "other".to_string();
        store.put(updated).unwrap();
        assert_eq!(store.get("acc-1").unwrap().unwrap().nonce, "other");
    }
}
