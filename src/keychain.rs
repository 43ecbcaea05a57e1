//! OS keychain storage for secrets that must not land in the session file.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use keyring::Entry;
use zeroize::Zeroizing;

use crate::error::KeychainError;

/// Keychain service identifier.
const SERVICE: &str = "de.malvik.azuresession";

/// Secret storage keyed by account name.
pub trait SecretStore: Send + Sync {
    /// Returns `None` when nothing is stored under `account`.
    fn get_secret(&self, account: &str) -> Result<Option<Zeroizing<String>>, KeychainError>;
    fn set_secret(&self, account: &str, secret: &str) -> Result<(), KeychainError>;
    /// Deleting a missing secret is not an error.
    fn delete_secret(&self, account: &str) -> Result<(), KeychainError>;
}

/// Secrets in the platform keychain (macOS Keychain, Windows Credential
/// Manager, Secret Service).
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_service(SERVICE)
    }

    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, account: &str) -> Result<Entry, KeychainError> {
        Entry::new(&self.service, account).map_err(|e| KeychainError::RetrieveFailed(e.to_string()))
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretStore for KeyringStore {
    fn get_secret(&self, account: &str) -> Result<Option<Zeroizing<String>>, KeychainError> {
        match self.entry(account)?.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(KeychainError::RetrieveFailed(e.to_string())),
        }
    }

    fn set_secret(&self, account: &str, secret: &str) -> Result<(), KeychainError> {
        self.entry(account)?
            .set_password(secret)
            .map_err(|e| KeychainError::StoreFailed(e.to_string()))
    }

    fn delete_secret(&self, account: &str) -> Result<(), KeychainError> {
        match self.entry(account)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeychainError::DeleteFailed(e.to_string())),
        }
    }
}

/// In-process secrets, dropped with the process.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: Mutex<HashMap<String, Zeroizing<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get_secret(&self, account: &str) -> Result<Option<Zeroizing<String>>, KeychainError> {
        let secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(secrets.get(account).cloned())
    }

    fn set_secret(&self, account: &str, secret: &str) -> Result<(), KeychainError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        secrets.insert(account.to_string(), Zeroizing::new(secret.to_string()));
        Ok(())
    }

    fn delete_secret(&self, account: &str) -> Result<(), KeychainError> {
        let mut secrets = self.secrets.lock().unwrap_or_else(PoisonError::into_inner);
        secrets.remove(account);
        Ok(())
    }
}
