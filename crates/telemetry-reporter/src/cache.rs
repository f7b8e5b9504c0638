// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dedup and identity caches over one shared [`KeyValueStore`].
//!
//! Store failures never propagate: reads degrade to misses and writes report
//! `false`, with a warning in the log.

use crate::store::{CacheEntry, CacheType, KeyValueStore};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use uuid::Uuid;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn store_key(cache_type: CacheType, key: &str) -> String {
    format!("{}:{}", cache_type.as_str(), key)
}

pub struct BatchCache {
    store: Arc<dyn KeyValueStore>,
    identity_ceiling: usize,
    evicting: AtomicBool,
    /// Held across the lookup and insert of [`BatchCache::stable_id_for`]
    minting: Mutex<()>,
}

impl std::fmt::Debug for BatchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCache")
            .field("identity_ceiling", &self.identity_ceiling)
            .field("evicting", &self.evicting.load(Ordering::Relaxed))
            .finish()
    }
}

impl BatchCache {
    pub fn new(store: Arc<dyn KeyValueStore>, identity_ceiling: usize) -> Self {
        Self {
            store,
            identity_ceiling,
            evicting: AtomicBool::new(false),
            minting: Mutex::new(()),
        }
    }

    fn read(&self, cache_type: CacheType, key: &str) -> Option<CacheEntry> {
        match self.store.get(&store_key(cache_type, key)) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("TELEMETRY | Failed to read {} cache entry: {}", cache_type.as_str(), e);
                None
            }
        }
    }

    fn write(&self, cache_type: CacheType, key: &str, payload: Value) -> bool {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            last_used: now_millis(),
            cache_type,
        };
        match self.store.put(&store_key(cache_type, key), entry) {
            Ok(written) => written,
            Err(e) => {
                warn!("TELEMETRY | Failed to write {} cache entry: {}", cache_type.as_str(), e);
                false
            }
        }
    }

    /// Hash of the last payload sent under `name`.
    pub fn dedup_get(&self, name: &str) -> Option<String> {
        self.read(CacheType::Dedup, name)
            .and_then(|entry| entry.payload.as_str().map(str::to_string))
    }

    pub fn dedup_put(&self, name: &str, hash: &str) -> bool {
        self.write(CacheType::Dedup, name, Value::String(hash.to_string()))
    }

    /// Stable id cached for `volatile_id`, refreshing its recency on hit.
    pub fn identity_get(&self, volatile_id: &str) -> Option<String> {
        let entry = self.read(CacheType::Identity, volatile_id)?;
        let stable_id = entry.payload.as_str()?.to_string();
        let touched = CacheEntry {
            last_used: now_millis(),
            ..entry
        };
        if let Err(e) = self
            .store
            .put(&store_key(CacheType::Identity, volatile_id), touched)
        {
            warn!("TELEMETRY | Failed to refresh identity cache entry: {}", e);
        }
        Some(stable_id)
    }

    pub fn identity_put(&self, volatile_id: &str, stable_id: &str) -> bool {
        let written = self.write(
            CacheType::Identity,
            volatile_id,
            Value::String(stable_id.to_string()),
        );
        if written {
            self.evict_if_over_ceiling();
        }
        written
    }

    /// Returns the cached stable id for `volatile_id`, minting a new one on miss.
    ///
    /// Concurrent callers with the same fingerprint all get the same id. Calls
    /// block on the store, see [`KeyValueStore`].
    pub fn stable_id_for(&self, volatile_id: &str) -> String {
        let _minting = self.minting.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(stable_id) = self.identity_get(volatile_id) {
            return stable_id;
        }
        let stable_id = Uuid::new_v4().to_string();
        self.identity_put(volatile_id, &stable_id);
        stable_id
    }

    /// Drops the least recently used half of the identity entries once the
    /// ceiling is exceeded. A trigger that arrives while another pass runs is
    /// ignored; the next overflowing write re-evaluates.
    fn evict_if_over_ceiling(&self) {
        let keys = match self.store.keys_of_type(CacheType::Identity) {
            Ok(keys) => keys,
            Err(e) => {
                warn!("TELEMETRY | Failed to enumerate identity cache: {}", e);
                return;
            }
        };
        if keys.len() <= self.identity_ceiling {
            return;
        }
        if self
            .evicting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("TELEMETRY | Identity cache eviction already running");
            return;
        }

        let mut aged: Vec<(u64, String)> = keys
            .into_iter()
            .filter_map(|key| match self.store.get(&key) {
                Ok(Some(entry)) => Some((entry.last_used, key)),
                Ok(None) => None,
                Err(e) => {
                    warn!("TELEMETRY | Failed to read identity cache entry: {}", e);
                    None
                }
            })
            .collect();
        aged.sort_by_key(|(last_used, _)| *last_used);

        let evict = aged.len() / 2;
        let mut evicted = 0;
        for (_, key) in aged.into_iter().take(evict) {
            match self.store.remove(&key) {
                Ok(true) => evicted += 1,
                Ok(false) => {}
                Err(e) => warn!("TELEMETRY | Failed to evict identity cache entry: {}", e),
            }
        }
        debug!("TELEMETRY | Evicted {} identity cache entries", evicted);

        self.evicting.store(false, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn identity_len(&self) -> usize {
        self.store
            .keys_of_type(CacheType::Identity)
            .map(|keys| keys.len())
            .unwrap_or_default()
    }
}
