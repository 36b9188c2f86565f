//! Credential vault: per-account API credentials encrypted at rest.

mod credentials_cipher;
mod credentials_model;
mod credentials_store;
mod credentials_vault;

pub use credentials_cipher::{CredentialCipher, MASTER_KEY_SIZE};
pub use credentials_model::{
    CredentialClass, CredentialMetadata, DecryptedCredential, EncryptedCredential,
    EncryptionScheme,
};
pub use credentials_store::{CredentialStore, FileCredentialStore, InMemoryCredentialStore};
pub use credentials_vault::CredentialVault;
