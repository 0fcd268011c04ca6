//! Content-hashed result cache with TTL and LRU eviction.

use crate::error::{PipelineError, Result};
use crate::task::Task;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Derive a stable key from `(task_type, canonicalized payload)`.
    pub fn for_task(task: &Task) -> Result<Self> {
        let mut hasher = Sha256::new();
        hasher.update(task.task_type().as_str().as_bytes());
        hasher.update(b":");
        hasher.update(task.payload.canonical_bytes()?);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Ok(CacheKey(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    inserted_at: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    entries: HashMap<CacheKey, Entry>,
    /// Access order, most-recently-used at the back.
    lru: Vec<CacheKey>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Inner {
    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            let k = self.lru.remove(pos);
            self.lru.push(k);
        }
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self.lru.first().copied() {
            self.lru.remove(0);
            self.entries.remove(&victim);
            self.evictions += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            max_size: 10_000,
        }
    }
}

/// Content-hashed cache of task results, keyed by `(task type, canonical
/// payload)`. TTL expiry is checked lazily on read; LRU eviction happens on
/// insert once `max_size` is reached.
pub struct ResultCache {
    inner: Mutex<Inner>,
    config: CacheConfig,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: Vec::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            config,
        }
    }

    pub fn get(&self, task: &Task) -> Result<Option<Vec<u8>>> {
        let key = CacheKey::for_task(task)?;
        let mut inner = self.inner.lock();

        let expired = inner.entries.get(&key).is_some_and(Entry::is_expired);
        if expired {
            inner.entries.remove(&key);
            inner.lru.retain(|k| k != &key);
        }

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.hit_count += 1;
            inner.hits += 1;
            inner.touch(&key);
            Ok(Some(entry.value.clone()))
        } else {
            inner.misses += 1;
            Ok(None)
        }
    }

    pub fn set(&self, task: &Task, value: Vec<u8>) -> Result<()> {
        let key = CacheKey::for_task(task)?;
        let mut inner = self.inner.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.config.max_size {
            inner.evict_lru();
        }

        inner.entries.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                ttl: Duration::from_secs(self.config.ttl_seconds),
                hit_count: 0,
            },
        );
        inner.lru.retain(|k| k != &key);
        inner.lru.push(key);
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}

/// Marker error for callers that want `PipelineError::serialization` style
/// mapping when bincode-encoding cached results; kept here to avoid every
/// call site repeating the closure.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(PipelineError::serialization)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(PipelineError::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, TaskPayload};

    fn task(id: &str) -> Task {
        Task::new(
            id,
            TaskPayload::Dev {
                target_path: "a.py".to_string(),
                language_hint: None,
                instructions: "write it".to_string(),
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        )
    }

    #[test]
    fn test_cache_key_ignores_field_order() {
        let t1 = Task::new(
            "a",
            TaskPayload::Dev {
                target_path: "a.py".to_string(),
                language_hint: None,
                instructions: "x".to_string(),
                extra: serde_json::json!({"x": 1, "y": 2}),
            },
            Priority::NORMAL,
        );
        let t2 = Task::new(
            "b",
            TaskPayload::Dev {
                target_path: "a.py".to_string(),
                language_hint: None,
                instructions: "x".to_string(),
                extra: serde_json::json!({"y": 2, "x": 1}),
            },
            Priority::NORMAL,
        );
        assert_eq!(CacheKey::for_task(&t1).unwrap(), CacheKey::for_task(&t2).unwrap());
    }

    #[test]
    fn test_set_then_get_returns_value() {
        let cache = ResultCache::new(CacheConfig::default());
        let t = task("a");
        cache.set(&t, b"result".to_vec()).unwrap();
        assert_eq!(cache.get(&t).unwrap(), Some(b"result".to_vec()));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_miss_then_hit_rate_half() {
        let cache = ResultCache::new(CacheConfig::default());
        let t = task("a");
        assert_eq!(cache.get(&t).unwrap(), None);
        cache.set(&t, b"result".to_vec()).unwrap();
        cache.get(&t).unwrap();
        assert_eq!(cache.stats().hit_rate(), 0.5);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = ResultCache::new(CacheConfig {
            ttl_seconds: 0,
            max_size: 10,
        });
        let t = task("a");
        cache.set(&t, b"result".to_vec()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(&t).unwrap(), None);
    }

    fn dev_task(id: &str, path: &str) -> Task {
        Task::new(
            id,
            TaskPayload::Dev {
                target_path: path.to_string(),
                language_hint: None,
                instructions: "x".to_string(),
                extra: serde_json::Value::Null,
            },
            Priority::NORMAL,
        )
    }

    #[test]
    fn test_lru_eviction_on_full_insert() {
        let cache = ResultCache::new(CacheConfig {
            ttl_seconds: 3600,
            max_size: 2,
        });
        let a = dev_task("a", "a.py");
        let b = dev_task("b", "b.py");
        let c = dev_task("c", "c.py");

        cache.set(&a, b"a-result".to_vec()).unwrap();
        cache.set(&b, b"b-result".to_vec()).unwrap();
        // touch `a` so `b` becomes least-recently-used
        cache.get(&a).unwrap();
        cache.set(&c, b"c-result".to_vec()).unwrap();

        assert_eq!(cache.get(&b).unwrap(), None);
        assert_eq!(cache.get(&a).unwrap(), Some(b"a-result".to_vec()));
        assert_eq!(cache.stats().evictions, 1);
    }
}
