use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::security::audit::arg_digest;

/// Read-only Odoo methods whose results may be served from cache. Writes
/// bypass the cache and invalidate the model's entries.
pub const CACHEABLE_METHODS: &[&str] = &[
    "read",
    "search",
    "search_read",
    "search_count",
    "read_group",
    "fields_get",
    "name_search",
];

pub fn is_cacheable(method: &str) -> bool {
    CACHEABLE_METHODS.contains(&method)
}

/// Cache key: every component that can change the answer, including the
/// schema version tag so a dictionary change orphans older entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub db: String,
    pub uid: i64,
    pub model: String,
    pub method: String,
    pub args_digest: String,
    pub schema_version: String,
}

impl CacheKey {
    pub fn new(
        db: &str,
        uid: i64,
        model: &str,
        method: &str,
        args: &Value,
        kwargs: &Value,
        schema_version: &str,
    ) -> Self {
        let payload = serde_json::json!([args, kwargs]);
        Self {
            db: db.to_string(),
            uid,
            model: model.to_string(),
            method: method.to_string(),
            args_digest: arg_digest(&payload),
            schema_version: schema_version.to_string(),
        }
    }
}

struct Entry {
    value: Value,
    expires_at: Instant,
    last_access: u64,
}

struct CacheState {
    entries: HashMap<CacheKey, Entry>,
    tick: u64,
}

/// TTL + LRU bounded cache for Odoo read results.
#[derive(Clone)]
pub struct ResponseCache {
    state: Arc<Mutex<CacheState>>,
    ttl: Duration,
    capacity: usize,
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
            })),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.tick += 1;
        let tick = state.tick;

        let expired = match state.entries.get_mut(key) {
            Some(entry) => {
                if Instant::now() < entry.expires_at {
                    entry.last_access = tick;
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: CacheKey, value: Value) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.tick += 1;
        let tick = state.tick;

        if state.entries.len() >= self.capacity && !state.entries.contains_key(&key) {
            // Evict the least recently used entry.
            if let Some(lru) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone())
            {
                state.entries.remove(&lru);
            }
        }

        state.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
                last_access: tick,
            },
        );
    }

    /// Drop every cached answer for `(db, model)` after a write.
    pub fn invalidate_model(&self, db: &str, model: &str) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state
            .entries
            .retain(|k, _| !(k.db == db && k.model == model));
    }

    /// Drop entries tagged with a schema version other than `current`.
    pub fn purge_stale_versions(&self, current: &str) {
        let mut state = self.state.lock().expect("cache mutex poisoned");
        state.entries.retain(|k, _| k.schema_version == current);
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("cache mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
