//! Graph result cache scoped to an access token.
//!
//! Results are stored under a key derived from the token value, so a new
//! token starts from an empty cache without explicit invalidation. Saving
//! for a new token removes the entry of the previous one.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crate::error::StorageError;
use crate::storage::{self, graph_cache_key, KeyValueStore, GRAPH_CACHE_CURRENT_KEY};

/// Cached response bodies keyed by endpoint id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphResultCache {
    key: String,
    entries: BTreeMap<String, Value>,
}

impl GraphResultCache {
    /// Load the cache persisted for `access_token`.
    pub fn load(store: &dyn KeyValueStore, access_token: &str) -> Result<Self, StorageError> {
        let key = graph_cache_key(access_token);
        let entries = storage::load_json(store, &key)?.unwrap_or_default();
        Ok(Self { key, entries })
    }

    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    pub fn into_entries(self) -> BTreeMap<String, Value> {
        self.entries
    }

    /// Ids that do not need to be fetched again: cached and not forced.
    pub fn fresh_ids(&self, forced: &HashSet<String>) -> HashSet<String> {
        self.entries
            .keys()
            .filter(|id| !forced.contains(*id))
            .cloned()
            .collect()
    }

    pub fn merge(&mut self, results: BTreeMap<String, Value>) {
        self.entries.extend(results);
    }

    /// Persist every entry except the forced ones, replacing the cache of
    /// any earlier token.
    pub fn save(&self, store: &dyn KeyValueStore, forced: &HashSet<String>) -> Result<(), StorageError> {
        let to_save: BTreeMap<&String, &Value> = self
            .entries
            .iter()
            .filter(|(id, _)| !forced.contains(*id))
            .collect();
        storage::save_json(store, &self.key, &to_save)?;

        if let Some(previous) = store.get_item(GRAPH_CACHE_CURRENT_KEY)? {
            if previous != self.key {
                store.remove_item(&previous)?;
            }
        }
        store.set_item(GRAPH_CACHE_CURRENT_KEY, &self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[test]
    fn test_cache_empty() {
        let store = MemoryStore::new();
        let cache = GraphResultCache::load(&store, "token").unwrap();
        assert!(cache.entries().is_empty());
        assert!(cache.fresh_ids(&HashSet::new()).is_empty());
    }

    #[test]
    fn test_forced_entries_are_never_persisted() {
        let store = MemoryStore::new();
        let forced: HashSet<String> = ["photo".to_string()].into();

        let mut cache = GraphResultCache::load(&store, "token").unwrap();
        cache.merge(BTreeMap::from([
            ("profile".to_string(), json!({ "displayName": "Ada" })),
            ("photo".to_string(), json!("binary")),
        ]));
        cache.save(&store, &forced).unwrap();

        let reloaded = GraphResultCache::load(&store, "token").unwrap();
        assert_eq!(reloaded.entries().len(), 1);
        assert_eq!(reloaded.entries()["profile"]["displayName"], "Ada");
    }

    #[test]
    fn test_fresh_ids_exclude_forced() {
        let store = MemoryStore::new();
        storage::save_json(
            &store,
            &graph_cache_key("token"),
            &json!({ "profile": {}, "manager": {} }),
        )
        .unwrap();

        let cache = GraphResultCache::load(&store, "token").unwrap();
        let forced: HashSet<String> = ["manager".to_string()].into();
        assert_eq!(cache.fresh_ids(&forced), HashSet::from(["profile".to_string()]));
    }

    #[test]
    fn test_cache_is_scoped_to_token() {
        let store = MemoryStore::new();
        let mut cache = GraphResultCache::load(&store, "old").unwrap();
        cache.merge(BTreeMap::from([("profile".to_string(), json!(1))]));
        cache.save(&store, &HashSet::new()).unwrap();

        let other = GraphResultCache::load(&store, "new").unwrap();
        assert!(other.entries().is_empty());
    }

    #[test]
    fn test_save_removes_previous_token_cache() {
        let store = MemoryStore::new();
        for token in ["at-1", "at-2", "at-3"] {
            let mut cache = GraphResultCache::load(&store, token).unwrap();
            cache.merge(BTreeMap::from([("profile".to_string(), json!(token))]));
            cache.save(&store, &HashSet::new()).unwrap();
        }

        assert!(store.get_item(&graph_cache_key("at-1")).unwrap().is_none());
        assert!(store.get_item(&graph_cache_key("at-2")).unwrap().is_none());
        assert_eq!(
            store.get_item(GRAPH_CACHE_CURRENT_KEY).unwrap().as_deref(),
            Some(graph_cache_key("at-3").as_str())
        );
        // current cache plus its pointer
        assert_eq!(store.len(), 2);

        let cache = GraphResultCache::load(&store, "at-3").unwrap();
        assert_eq!(cache.entries()["profile"], "at-3");
    }

    #[test]
    fn test_save_same_token_keeps_cache() {
        let store = MemoryStore::new();
        let mut cache = GraphResultCache::load(&store, "at-1").unwrap();
        cache.merge(BTreeMap::from([("profile".to_string(), json!(1))]));
        cache.save(&store, &HashSet::new()).unwrap();
        cache.save(&store, &HashSet::new()).unwrap();

        let reloaded = GraphResultCache::load(&store, "at-1").unwrap();
        assert_eq!(reloaded.entries()["profile"], 1);
    }
}
