//! Bounded LRU cache with per-entry TTL for semantic query results.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::namespace::NamespaceScope;
use crate::query::QueryInput;

/// The query input part of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InputKey {
    Vector { dimension: usize, fingerprint: u64 },
    Text(String),
}

/// Identity of a semantic query: `(input, k, threshold, scope)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    input: InputKey,
    k: usize,
    threshold_bits: u32,
    scope: Option<String>,
    generation: u64,
}

impl CacheKey {
    pub fn new(input: &QueryInput, k: usize, threshold: f32, scope: &NamespaceScope) -> Self {
        let input = match input {
            QueryInput::Vector(vector) => InputKey::Vector {
                dimension: vector.dimension(),
                fingerprint: vector.fingerprint(),
            },
            QueryInput::Text(text) => InputKey::Text(text.clone()),
        };
        CacheKey {
            input,
            k,
            threshold_bits: threshold.to_bits(),
            scope: scope.single().map(str::to_string),
            generation: 0,
        }
    }

    /// Bind the key to a write generation of the owning store.
    ///
    /// Results computed before a mutation carry an older generation and are
    /// never served after it, even if they land in the cache late.
    pub fn at_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub ttl_ms: u64,
    pub hits: u64,
    pub misses: u64,
    /// Entries pushed out by the capacity bound.
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: Arc<V>,
    inserted: Instant,
    tick: u64,
}

#[derive(Debug)]
struct Inner<V> {
    map: AHashMap<CacheKey, Slot<V>>,
    /// Recency order: lowest tick is least recently used.
    order: BTreeMap<u64, CacheKey>,
    tick: u64,
}

impl<V> Inner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot<V>> {
        let slot = self.map.remove(key)?;
        self.order.remove(&slot.tick);
        Some(slot)
    }
}

/// LRU cache with a fixed capacity and a time-to-live per entry.
///
/// A capacity of zero disables caching.
#[derive(Debug)]
pub struct QueryCache<V> {
    capacity: usize,
    ttl: Duration,
    inner: Mutex<Inner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V> QueryCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        QueryCache {
            capacity,
            ttl,
            inner: Mutex::new(Inner {
                map: AHashMap::with_capacity(capacity.min(1024)),
                order: BTreeMap::new(),
                tick: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Look up a live entry and mark it most recently used.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<V>> {
        if self.capacity == 0 {
            return None;
        }

        let mut inner = self.inner.lock();
        let expired = match inner.map.get(key) {
            Some(slot) => slot.inserted.elapsed() >= self.ttl,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        if expired {
            inner.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let tick = inner.next_tick();
        let slot = inner.map.get_mut(key)?;
        let previous = std::mem::replace(&mut slot.tick, tick);
        let value = slot.value.clone();
        inner.order.remove(&previous);
        inner.order.insert(tick, key.clone());

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Insert a value, evicting the least recently used entries if full.
    pub fn insert(&self, key: CacheKey, value: V) -> Arc<V> {
        let value = Arc::new(value);
        if self.capacity == 0 {
            return value;
        }

        let mut inner = self.inner.lock();
        inner.remove(&key);

        while inner.map.len() >= self.capacity {
            let Some((_, oldest)) = inner.order.pop_first() else {
                break;
            };
            inner.map.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = inner.next_tick();
        inner.order.insert(tick, key.clone());
        inner.map.insert(
            key,
            Slot {
                value: value.clone(),
                inserted: Instant::now(),
                tick,
            },
        );
        value
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            ttl_ms: self.ttl.as_millis() as u64,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }
}
