//! Expiring key-value store backing every in-memory cache.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use super::traits::Sweep;

/// A cached value together with its absolute expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
  pub value: V,
  pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
  fn new(value: V, ttl: Duration) -> Self {
    Self {
      value,
      expires_at: Instant::now() + ttl,
    }
  }

  /// An entry is expired from its expiry instant onwards, so a zero TTL
  /// never yields a hit.
  pub fn is_expired(&self, now: Instant) -> bool {
    now >= self.expires_at
  }
}

/// Thread-safe TTL cache.
///
/// Expired entries are purged lazily by `get` and eagerly by `sweep`, so keys
/// that are never read again still get dropped.
pub struct TtlCache<K, V> {
  entries: RwLock<HashMap<K, CacheEntry<V>>>,
  default_ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new(default_ttl: Duration) -> Self {
    Self {
      entries: RwLock::new(HashMap::new()),
      default_ttl,
    }
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Store a value with the default TTL.
  pub fn set(&self, key: K, value: V) {
    self.set_with_ttl(key, value, self.default_ttl);
  }

  pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
    let mut entries = self.write();
    entries.insert(key, CacheEntry::new(value, ttl));
  }

  /// Look up a live value. An expired entry reports absent and is removed.
  pub fn get(&self, key: &K) -> Option<V> {
    let now = Instant::now();
    {
      let entries = self.read();
      match entries.get(key) {
        None => return None,
        Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
        Some(_) => {}
      }
    }

    // Re-check under the write lock: a concurrent set may have refreshed it.
    let mut entries = self.write();
    match entries.get(key) {
      Some(entry) if entry.is_expired(now) => {
        entries.remove(key);
        None
      }
      Some(entry) => Some(entry.value.clone()),
      None => None,
    }
  }

  /// Atomically read-modify-write an entry, refreshing its TTL.
  ///
  /// The closure sees the current live value (or `None`) and returns the
  /// replacement.
  pub fn update<F>(&self, key: K, f: F) -> V
  where
    F: FnOnce(Option<V>) -> V,
  {
    let now = Instant::now();
    let mut entries = self.write();
    let current = entries
      .remove(&key)
      .filter(|entry| !entry.is_expired(now))
      .map(|entry| entry.value);
    let value = f(current);
    entries.insert(key, CacheEntry::new(value.clone(), self.default_ttl));
    value
  }

  /// Remove an entry, returning its value if it was still live.
  pub fn remove(&self, key: &K) -> Option<V> {
    let now = Instant::now();
    self
      .write()
      .remove(key)
      .filter(|entry| !entry.is_expired(now))
      .map(|entry| entry.value)
  }

  /// Number of stored entries, including expired ones not yet swept.
  pub fn len(&self) -> usize {
    self.read().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove every expired entry. Returns how many were dropped.
  pub fn sweep(&self) -> usize {
    let now = Instant::now();
    let mut entries = self.write();
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now));
    before - entries.len()
  }

  // A panic while holding the lock cannot leave a half-written entry behind
  // (every mutation is a single map operation), so poisoning is recovered.
  fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<K, CacheEntry<V>>> {
    self.entries.read().unwrap_or_else(|e| e.into_inner())
  }

  fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<K, CacheEntry<V>>> {
    self.entries.write().unwrap_or_else(|e| e.into_inner())
  }
}

impl<K, V> Sweep for TtlCache<K, V>
where
  K: Eq + Hash + Clone + Send + Sync,
  V: Clone + Send + Sync,
{
  fn sweep(&self) -> usize {
    TtlCache::sweep(self)
  }

  fn name(&self) -> &'static str {
    "ttl"
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn test_set_and_get() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set("a", 1);
    assert_eq!(cache.get(&"a"), Some(1));
    assert_eq!(cache.get(&"b"), None);
  }

  #[test]
  fn test_expired_read_purges_entry() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set_with_ttl("a", 1, Duration::ZERO);
    assert_eq!(cache.len(), 1);

    assert_eq!(cache.get(&"a"), None);
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_read_after_ttl_elapsed() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set_with_ttl("a", 1, Duration::from_millis(20));
    assert_eq!(cache.get(&"a"), Some(1));

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a"), None);
  }

  #[test]
  fn test_sweep_removes_unread_expired_entries() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set_with_ttl("stale-1", 1, Duration::ZERO);
    cache.set_with_ttl("stale-2", 2, Duration::ZERO);
    cache.set("fresh", 3);

    assert_eq!(cache.sweep(), 2);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&"fresh"), Some(3));
  }

  #[test]
  fn test_update_ignores_expired_value() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set_with_ttl("a", vec![1], Duration::ZERO);

    let merged = cache.update("a", |current| {
      let mut v = current.unwrap_or_default();
      v.push(2);
      v
    });
    assert_eq!(merged, vec![2]);
    assert_eq!(cache.get(&"a"), Some(vec![2]));
  }

  #[test]
  fn test_update_refreshes_ttl() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set_with_ttl("a", 1, Duration::from_millis(20));
    cache.update("a", |current| current.unwrap_or(0) + 1);

    std::thread::sleep(Duration::from_millis(40));
    assert_eq!(cache.get(&"a"), Some(2));
  }

  #[test]
  fn test_remove() {
    let cache = TtlCache::new(Duration::from_secs(60));
    cache.set("a", 1);
    assert_eq!(cache.remove(&"a"), Some(1));
    assert_eq!(cache.remove(&"a"), None);
    assert!(cache.is_empty());
  }

  #[test]
  fn test_concurrent_updates() {
    let cache = Arc::new(TtlCache::new(Duration::from_secs(60)));
    let handles: Vec<_> = (0..8)
      .map(|_| {
        let cache = Arc::clone(&cache);
        std::thread::spawn(move || {
          for _ in 0..100 {
            cache.update("counter", |current| current.unwrap_or(0) + 1);
          }
        })
      })
      .collect();

    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(cache.get(&"counter"), Some(800));
  }
}
