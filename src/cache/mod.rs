//! Bounded, TTL-limited session cache
//!
//! Used to memoise provisioning metadata that is expensive to obtain:
//! the region of a container for a given credential set, and authenticated
//! delegated-credential backends for a given configuration. Values are
//! advisory, so racing writers of the same key are last-write-wins.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Deserialize;
use tracing::trace;

/// Session cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SessionCacheConfig {
    /// How long an entry stays valid (e.g., "2m", "30s")
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of entries kept
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_ttl() -> Duration {
    Duration::from_secs(120)
}

fn default_capacity() -> usize {
    64
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

impl<V> CachedEntry<V> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted_at.elapsed() < ttl
    }
}

/// Concurrent map with a TTL per entry and a capacity bound.
///
/// When full, expired entries are dropped first, then the oldest one.
pub struct SessionCache<K, V> {
    entries: DashMap<K, CachedEntry<V>>,
    ttl: Duration,
    capacity: usize,
}

impl<K, V> SessionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(config: &SessionCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.ttl,
            capacity: config.capacity.max(1),
        }
    }

    /// Get a fresh value, dropping it if it has expired
    pub fn get(&self, key: &K) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_fresh(self.ttl) => {
                trace!("session cache hit");
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!("session cache entry expired");
            self.entries
                .remove_if(key, |_, entry| !entry.is_fresh(self.ttl));
        }
        None
    }

    /// Insert or replace a value
    pub fn insert(&self, key: K, value: V) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.make_room();
        }
        self.entries.insert(
            key,
            CachedEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop a single entry
    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    fn make_room(&self) {
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.is_fresh(ttl));

        while self.entries.len() >= self.capacity {
            // Collect the key first: removing while holding a ref would deadlock
            let oldest = self
                .entries
                .iter()
                .min_by_key(|entry| entry.value().inserted_at)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl: Duration, capacity: usize) -> SessionCache<String, u32> {
        SessionCache::new(&SessionCacheConfig { ttl, capacity })
    }

    #[test]
    fn test_get_after_insert() {
        let c = cache(Duration::from_secs(60), 4);
        c.insert("a".to_string(), 1);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"b".to_string()), None);
    }

    #[test]
    fn test_last_write_wins() {
        let c = cache(Duration::from_secs(60), 4);
        c.insert("a".to_string(), 1);
        c.insert("a".to_string(), 2);
        assert_eq!(c.get(&"a".to_string()), Some(2));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let c = cache(Duration::from_millis(10), 4);
        c.insert("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(c.get(&"a".to_string()), None);
        assert!(c.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let c = cache(Duration::from_secs(60), 2);
        c.insert("a".to_string(), 1);
        std::thread::sleep(Duration::from_millis(2));
        c.insert("b".to_string(), 2);
        std::thread::sleep(Duration::from_millis(2));
        c.insert("c".to_string(), 3);

        assert_eq!(c.len(), 2);
        assert_eq!(c.get(&"a".to_string()), None);
        assert_eq!(c.get(&"b".to_string()), Some(2));
        assert_eq!(c.get(&"c".to_string()), Some(3));
    }

    #[test]
    fn test_replacing_does_not_evict() {
        let c = cache(Duration::from_secs(60), 2);
        c.insert("a".to_string(), 1);
        c.insert("b".to_string(), 2);
        c.insert("b".to_string(), 3);
        assert_eq!(c.get(&"a".to_string()), Some(1));
        assert_eq!(c.get(&"b".to_string()), Some(3));
    }

    #[test]
    fn test_parse_config() {
        let config: SessionCacheConfig = serde_yaml::from_str("ttl: 30s\ncapacity: 8\n").unwrap();
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.capacity, 8);

        let config: SessionCacheConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.ttl, Duration::from_secs(120));
    }
}
