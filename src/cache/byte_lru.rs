//! Byte-budgeted least-recently-used cache
//!
//! Both the full-image cache and the thumbnail cache sit on this. Recency is
//! kept by an unbounded `lru::LruCache`; the byte budget (and an optional
//! entry cap) is enforced on top by popping the least recently used entry
//! until a new one fits. A single entry larger than the whole budget is
//! still admitted after everything else has gone.

use std::hash::Hash;

use lru::LruCache;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub used_bytes: u64,
    pub budget_bytes: u64,
}

#[derive(Debug)]
struct Slot<V> {
    value: V,
    byte_size: u64,
}

pub struct ByteLru<K, V> {
    entries: LruCache<K, Slot<V>>,
    used_bytes: u64,
    budget_bytes: u64,
    max_entries: Option<usize>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K, V> ByteLru<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            used_bytes: 0,
            budget_bytes,
            max_entries: None,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Also cap the number of entries (0 means no cap)
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = (max_entries > 0).then_some(max_entries);
        self
    }

    /// Look up and mark as most recently used
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up without touching recency or counters
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key).map(|entry| &entry.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Insert or replace `key`, evicting as needed. Returns the evicted keys.
    pub fn put(&mut self, key: K, value: V, byte_size: u64) -> Vec<K> {
        self.remove(&key);
        let evicted = self.evict_for(byte_size);

        self.entries.put(key, Slot { value, byte_size });
        self.used_bytes += byte_size;
        evicted
    }

    fn fits(&self, byte_size: u64) -> bool {
        let under_cap = self
            .max_entries
            .map_or(true, |max| self.entries.len() < max);
        under_cap && self.used_bytes.saturating_add(byte_size) <= self.budget_bytes
    }

    fn evict_for(&mut self, byte_size: u64) -> Vec<K> {
        let mut evicted = Vec::new();
        while !self.fits(byte_size) {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.used_bytes = self.used_bytes.saturating_sub(entry.byte_size);
            self.evictions += 1;
            evicted.push(key);
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.pop(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.byte_size);
        Some(entry.value)
    }

    /// Move an entry to a new key. The moved entry counts as just used.
    /// Returns `false` when `from` was not cached.
    pub fn rekey(&mut self, from: &K, to: K) -> bool {
        let Some(entry) = self.entries.pop(from) else {
            return false;
        };
        if let Some(replaced) = self.entries.pop(&to) {
            self.used_bytes = self.used_bytes.saturating_sub(replaced.byte_size);
        }
        self.entries.put(to, entry);
        true
    }

    /// Drop every entry whose key matches; returns how many went
    pub fn remove_where(&mut self, mut matches: impl FnMut(&K) -> bool) -> usize {
        let doomed = self.keys_where(&mut matches);
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }

    /// Keys matching `matches`, oldest first
    pub fn keys_where(&self, mut matches: impl FnMut(&K) -> bool) -> Vec<K> {
        self.entries
            .iter()
            .rev()
            .map(|(key, _)| key)
            .filter(|key| matches(key))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
            used_bytes: self.used_bytes,
            budget_bytes: self.budget_bytes,
        }
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for ByteLru<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteLru")
            .field("entries", &self.entries.len())
            .field("used_bytes", &self.used_bytes)
            .field("budget_bytes", &self.budget_bytes)
            .finish()
    }
}
