// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable key/value stores backing the caches.
//!
//! The store is injected; the pipeline only relies on [`KeyValueStore`].
//! [`InMemoryStore`] is used for inert pipelines and tests, [`JsonFileStore`]
//! persists entries across restarts in a single JSON document.

use crate::errors::StoreError;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Logical cache an entry belongs to. Partitions the shared key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Dedup,
    Identity,
}

impl CacheType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dedup => "dedup",
            Self::Identity => "identity",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub last_used: u64,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
}

/// Synchronous key/value access. Implementations may do file I/O, so async
/// callers go through `tokio::task::spawn_blocking`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Returns whether the value was written.
    fn put(&self, key: &str, entry: CacheEntry) -> Result<bool, StoreError>;

    /// Only used by cache eviction.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    fn keys_of_type(&self, cache_type: CacheType) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: CacheEntry) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries.insert(key.to_string(), entry);
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.remove(key).is_some())
    }

    fn keys_of_type(&self, cache_type: CacheType) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .iter()
            .filter(|(_, entry)| entry.cache_type == cache_type)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

/// Whole-file JSON store. Every mutation rewrites the file through a
/// temporary sibling and a rename, including the recency refresh on an
/// identity cache hit.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl JsonFileStore {
    /// Opens the store at `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(
                    "TELEMETRY | No cache file at {}, starting empty",
                    path.display()
                );
                HashMap::new()
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let encoded = serde_json::to_vec(entries)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, entry: CacheEntry) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let previous = entries.insert(key.to_string(), entry);
        if let Err(err) = self.persist(&entries) {
            // Keep memory and disk consistent
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(err);
        }
        Ok(true)
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let Some(previous) = entries.remove(key) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(err);
        }
        Ok(true)
    }

    fn keys_of_type(&self, cache_type: CacheType) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .iter()
            .filter(|(_, entry)| entry.cache_type == cache_type)
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(key: &str, cache_type: CacheType, last_used: u64) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            payload: json!("value"),
            last_used,
            cache_type,
        }
    }

    #[test]
    fn test_in_memory_store_partitions_by_type() {
        let store = InMemoryStore::new();
        assert!(store.put("dedup:a", entry("a", CacheType::Dedup, 1)).unwrap());
        assert!(store
            .put("identity:a", entry("a", CacheType::Identity, 1))
            .unwrap());
        assert!(store
            .put("identity:b", entry("b", CacheType::Identity, 2))
            .unwrap());

        let mut identity_keys = store.keys_of_type(CacheType::Identity).unwrap();
        identity_keys.sort();
        assert_eq!(identity_keys, vec!["identity:a", "identity:b"]);
        assert_eq!(store.keys_of_type(CacheType::Dedup).unwrap().len(), 1);

        assert!(store.remove("identity:a").unwrap());
        assert!(!store.remove("identity:a").unwrap());
        assert!(store.get("identity:a").unwrap().is_none());
        assert_eq!(store.get("dedup:a").unwrap().unwrap().key, "a");
    }

    #[test]
    fn test_json_file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("telemetry.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("dedup:startup").unwrap().is_none());
        store
            .put("dedup:startup", entry("startup", CacheType::Dedup, 42))
            .unwrap();
        store
            .put("identity:x", entry("x", CacheType::Identity, 43))
            .unwrap();
        store.remove("identity:x").unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(
            reopened.get("dedup:startup").unwrap(),
            Some(entry("startup", CacheType::Dedup, 42))
        );
        assert!(reopened.get("identity:x").unwrap().is_none());
        assert_eq!(reopened.path(), path.as_path());
    }

    #[test]
    fn test_json_file_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telemetry.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            JsonFileStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn test_cache_entry_wire_shape() {
        let encoded = serde_json::to_value(entry("k", CacheType::Identity, 7)).unwrap();
        assert_eq!(
            encoded,
            json!({"key": "k", "payload": "value", "lastUsed": 7, "type": "identity"})
        );
    }
}
