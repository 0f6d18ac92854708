//! Namespaced in-memory KV cache with per-entry TTL.
//!
//! Keys are stored as `"{namespace}:{key}"`. Expiry is lazy on read plus a
//! periodic sweep; TTLs are absolute expirations, not sliding windows.
//! `get_or_compute` guarantees at most one in-flight computation per key:
//! late callers queue on a per-key lock and pick up the cached result.
//! Failed computations are never cached.

use crate::error::{Error, Result};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Namespace {
    Killmails,
    Systems,
    Characters,
    Corporations,
    Alliances,
    ShipTypes,
    CharacterExtraction,
}

impl Namespace {
    pub const ALL: [Namespace; 7] = [
        Namespace::Killmails,
        Namespace::Systems,
        Namespace::Characters,
        Namespace::Corporations,
        Namespace::Alliances,
        Namespace::ShipTypes,
        Namespace::CharacterExtraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Killmails => "killmails",
            Namespace::Systems => "systems",
            Namespace::Characters => "characters",
            Namespace::Corporations => "corporations",
            Namespace::Alliances => "alliances",
            Namespace::ShipTypes => "ship_types",
            Namespace::CharacterExtraction => "character_extraction",
        }
    }

    fn index(&self) -> usize {
        match self {
            Namespace::Killmails => 0,
            Namespace::Systems => 1,
            Namespace::Characters => 2,
            Namespace::Corporations => 3,
            Namespace::Alliances => 4,
            Namespace::ShipTypes => 5,
            Namespace::CharacterExtraction => 6,
        }
    }
}

/// Outcome of a cache read. `Expired` entries have already been reclaimed
/// when this is returned; callers treat it like a miss but may log it.
#[derive(Debug)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    Expired,
}

impl<T> Lookup<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Lookup::Hit(value) => Some(value),
            _ => None,
        }
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

#[derive(Default)]
struct NamespaceCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct NamespaceStats {
    pub namespace: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

pub struct NamespacedCache {
    entries: DashMap<String, Entry>,
    inflight: DashMap<String, Arc<Mutex<()>>>,
    counters: [NamespaceCounters; 7],
}

impl NamespacedCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            counters: Default::default(),
        }
    }

    fn full_key(namespace: Namespace, key: &str) -> String {
        format!("{}:{}", namespace.as_str(), key)
    }

    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Lookup<T> {
        let full_key = Self::full_key(namespace, key);
        let counters = &self.counters[namespace.index()];
        let expired = match self.entries.get(&full_key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                match serde_json::from_value(entry.value.clone()) {
                    Ok(value) => {
                        counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Lookup::Hit(value);
                    }
                    Err(err) => {
                        tracing::warn!(key = %full_key, %err, "cache entry failed to decode");
                        false
                    }
                }
            }
            Some(_) => true,
            None => false,
        };
        counters.misses.fetch_add(1, Ordering::Relaxed);
        if expired {
            self.entries
                .remove_if(&full_key, |_, entry| entry.expires_at <= Instant::now());
            Lookup::Expired
        } else {
            Lookup::Miss
        }
    }

    /// Last write wins; a zero TTL effectively deletes on next read.
    pub fn put<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T, ttl: Duration) {
        let encoded = match serde_json::to_value(value) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::warn!(namespace = namespace.as_str(), key, %err, "cache put failed to encode");
                return;
            }
        };
        self.entries.insert(
            Self::full_key(namespace, key),
            Entry {
                value: encoded,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Presence check without deserializing. Used as the dedup probe.
    pub fn contains(&self, namespace: Namespace, key: &str) -> bool {
        self.entries
            .get(&Self::full_key(namespace, key))
            .map(|entry| entry.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn delete(&self, namespace: Namespace, key: &str) {
        self.entries.remove(&Self::full_key(namespace, key));
    }

    pub fn clear_namespace(&self, namespace: Namespace) {
        let prefix = format!("{}:", namespace.as_str());
        self.entries.retain(|key, _| !key.starts_with(&prefix));
    }

    /// At most one computation runs per (namespace, key) at a time; callers
    /// arriving while one is in flight wait and then read its result. A
    /// failed computation leaves the slot empty.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Duration,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Lookup::Hit(value) = self.get(namespace, key) {
            return Ok(value);
        }

        let full_key = Self::full_key(namespace, key);
        let lock = self
            .inflight
            .entry(full_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // A winner may have populated the slot while we waited.
        if let Lookup::Hit(value) = self.get(namespace, key) {
            return Ok(value);
        }

        let result = compute().await;
        if let Ok(value) = &result {
            self.put(namespace, key, value, ttl);
        }
        drop(_guard);
        self.inflight
            .remove_if(&full_key, |_, lock| Arc::strong_count(lock) <= 2);
        result
    }

    /// Reclaim expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }

    pub fn stats(&self) -> Vec<NamespaceStats> {
        let mut sizes = [0usize; 7];
        for entry in self.entries.iter() {
            for namespace in Namespace::ALL {
                if entry.key().starts_with(namespace.as_str())
                    && entry.key().as_bytes().get(namespace.as_str().len()) == Some(&b':')
                {
                    sizes[namespace.index()] += 1;
                    break;
                }
            }
        }
        Namespace::ALL
            .iter()
            .map(|namespace| {
                let counters = &self.counters[namespace.index()];
                NamespaceStats {
                    namespace: namespace.as_str(),
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    size: sizes[namespace.index()],
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for NamespacedCache {
    fn default() -> Self {
        Self::new()
    }
}
