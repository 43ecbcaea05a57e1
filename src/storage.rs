//! Persistent key-value storage shared by the delegate and the session.
//!
//! Every durable piece of session state (callback queue, Graph cache,
//! custom data, pending sign-in) is plain JSON text under a namespaced key.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use directories::ProjectDirs;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::StorageError;

/// Store file name.
const STORE_FILE: &str = "session.json";

/// Key of the durable callback queue.
pub const CALLBACK_QUEUE_KEY: &str = "msal.callbackqueue";
/// Key of the application-defined custom data blob.
pub const CUSTOM_DATA_KEY: &str = "msal.custom";
/// Prefix of the per-access-token Graph result cache.
pub const GRAPH_CACHE_PREFIX: &str = "msal.msgraph-";
/// Key naming the Graph cache entry written last.
pub const GRAPH_CACHE_CURRENT_KEY: &str = "msal.msgraph.current";

/// Graph cache key for the given access token value.
pub fn graph_cache_key(access_token: &str) -> String {
    format!("{}{}", GRAPH_CACHE_PREFIX, access_token)
}

/// Minimal storage contract, modeled after the browser's `localStorage`.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Read and deserialize a JSON value.
pub fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get_item(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value.
pub fn save_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set_item(key, &raw)
}

/// In-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

/// File-backed store: one JSON object, rewritten whole on every mutation.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    items: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Get the path to the default store file.
    ///
    /// Returns `~/Library/Application Support/de.malvik.azuresession/session.json` on macOS.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("de", "malvik", "azuresession")
            .map(|dirs| dirs.config_dir().join(STORE_FILE))
    }

    /// Open the store at the default location.
    pub fn open_default() -> Result<Self, StorageError> {
        let path = Self::default_path().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Could not determine config directory",
            ))
        })?;
        Self::open(path)
    }

    /// Open the store at `path`.
    ///
    /// A missing file is an empty store. A corrupted file is logged and
    /// treated as empty; it is overwritten on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();

        let items = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| StorageError::ReadFailed(format!("{}: {}", path.display(), e)))?;
            match serde_json::from_str(&content) {
                Ok(items) => {
                    debug!("Loaded session store from {:?}", path);
                    items
                }
                Err(e) => {
                    error!("Failed to parse session store: {}, starting empty", e);
                    BTreeMap::new()
                }
            }
        } else {
            debug!("Session store does not exist yet: {:?}", path);
            BTreeMap::new()
        };

        Ok(Self {
            path,
            items: Mutex::new(items),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, items: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(items)?;
        fs::write(&self.path, content).map_err(|e| {
            warn!("Failed to write session store {:?}: {}", self.path, e);
            StorageError::WriteFailed(e.to_string())
        })
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        self.flush(&items)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if items.remove(key).is_some() {
            self.flush(&items)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_path() {
        let path = FileStore::default_path();
        assert!(path.is_some());
        assert!(path.unwrap().ends_with("session.json"));
    }

    #[test]
    fn test_graph_cache_key_is_scoped_to_token() {
        assert_eq!(graph_cache_key("abc"), "msal.msgraph-abc");
        assert_ne!(graph_cache_key("abc"), graph_cache_key("abd"));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.get_item("k").unwrap().is_none());

        store.set_item("k", "v").unwrap();
        assert_eq!(store.get_item("k").unwrap().as_deref(), Some("v"));

        store.remove_item("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = FileStore::open(&path).unwrap();
        save_json(&store, CUSTOM_DATA_KEY, &json!({ "theme": "dark" })).unwrap();
        store.set_item("other", "1").unwrap();
        store.remove_item("other").unwrap();
        drop(store);

        let reopened = FileStore::open(&path).unwrap();
        let custom: serde_json::Value = load_json(&reopened, CUSTOM_DATA_KEY).unwrap().unwrap();
        assert_eq!(custom["theme"], "dark");
        assert!(reopened.get_item("other").unwrap().is_none());
    }

    #[test]
    fn test_file_store_tolerates_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "not json").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.get_item(CALLBACK_QUEUE_KEY).unwrap().is_none());
    }

    #[test]
    fn test_load_json_rejects_invalid_value() {
        let store = MemoryStore::new();
        store.set_item(CUSTOM_DATA_KEY, "{broken").unwrap();
        let result: Result<Option<serde_json::Value>, _> = load_json(&store, CUSTOM_DATA_KEY);
        assert!(matches!(result, Err(StorageError::Serialization(_))));
    }
}
