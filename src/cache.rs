//! Read cache for list and detail queries.
//!
//! Entries are never evicted by invalidation, only marked stale, so an
//! offline device can still render the last known value while a fresh fetch
//! is impossible.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::entities::EntityKind;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: EntityKind,
    pub scope: String,
}

impl QueryKey {
    /// Key for a list query. Parameters are sorted so that the same filter
    /// in a different order hits the same entry.
    pub fn list(kind: EntityKind, query: &[(String, String)]) -> Self {
        let mut params: Vec<String> = query.iter().map(|(k, v)| format!("{k}={v}")).collect();
        params.sort();
        Self {
            kind,
            scope: format!("list:{}", params.join("&")),
        }
    }

    pub fn detail(kind: EntityKind, id: &str) -> Self {
        Self {
            kind,
            scope: format!("detail:{id}"),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    fetched_at: Instant,
    stale: bool,
}

#[derive(Debug, Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<QueryKey, CacheEntry>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value fetched less than `stale_time` ago and not invalidated since.
    pub fn get_fresh(&self, key: &QueryKey, stale_time: Duration) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| !e.stale && e.fetched_at.elapsed() < stale_time)
            .map(|e| e.value.clone())
    }

    /// Whatever is cached, fresh or not.
    pub fn get_any(&self, key: &QueryKey) -> Option<Value> {
        let entries = self.entries.lock().ok()?;
        entries.get(key).map(|e| e.value.clone())
    }

    pub fn insert(&self, key: QueryKey, value: Value) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                CacheEntry {
                    value,
                    fetched_at: Instant::now(),
                    stale: false,
                },
            );
        }
    }

    /// Mark every list and detail entry of `kind` stale. Returns how many
    /// entries were touched.
    pub fn invalidate_entity(&self, kind: EntityKind) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let mut touched = 0;
        for (key, entry) in entries.iter_mut() {
            if key.kind == kind {
                entry.stale = true;
                touched += 1;
            }
        }
        touched
    }

    /// Drop a detail entry outright (the record was deleted).
    pub fn remove_detail(&self, kind: EntityKind, id: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(&QueryKey::detail(kind, id));
        }
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
