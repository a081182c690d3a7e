//! Local Kademlia storage: a value store and a provider record store,
//! both bounded and expiring.
//!
//! When a store is full the entry closest to expiry goes first.

use std::time::{Duration, Instant};

use linked_hash_map::LinkedHashMap;

use crate::p2p::error::*;
use crate::p2p::peer::PeerId;

/// Decides which values are acceptable and which of several competing
/// values wins a lookup.
pub trait RecordValidator: Send + Sync {
    /// Rejects values that must not be stored or served.
    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Picks the best value among `values` (all previously validated).
    /// Returns an index into `values`.
    fn select(&self, key: &[u8], values: &[Vec<u8>]) -> usize;
}

/// The default policy: everything validates, the first value wins.
pub struct AcceptAllValidator;

impl RecordValidator for AcceptAllValidator {
    fn validate(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn select(&self, _key: &[u8], _values: &[Vec<u8>]) -> usize {
        0
    }
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Bounded key/value store with per-entry expiry.
pub struct ValueStore {
    map: LinkedHashMap<Vec<u8>, StoredValue>,
    capacity: usize,
    default_ttl: Duration,
}

impl ValueStore {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            map: LinkedHashMap::new(),
            capacity,
            default_ttl,
        }
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let expires_at = Instant::now() + self.default_ttl;
        if self.map.get(&key).is_none() && self.map.len() >= self.capacity {
            self.evict_soonest();
        }
        self.map.insert(key, StoredValue { value, expires_at });
    }

    pub fn get(&mut self, key: &[u8]) -> Option<Vec<u8>> {
        match self.map.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Some(stored.value.clone()),
            Some(_) => {
                self.map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops expired entries.
    pub fn collect_garbage(&mut self) {
        let now = Instant::now();
        let expired: Vec<Vec<u8>> = self
            .map
            .iter()
            .filter(|(_, v)| v.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.map.remove(&key);
        }
    }

    fn evict_soonest(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, v)| v.expires_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.map.remove(&key);
        }
    }
}

struct ProviderEntry {
    peer: PeerId,
    expires_at: Instant,
}

/// Bounded store of provider records per content key.
pub struct ProviderStore {
    map: LinkedHashMap<Vec<u8>, Vec<ProviderEntry>>,
    max_keys: usize,
    providers_per_key: usize,
    ttl: Duration,
}

impl ProviderStore {
    pub fn new(max_keys: usize, providers_per_key: usize, ttl: Duration) -> Self {
        Self {
            map: LinkedHashMap::new(),
            max_keys,
            providers_per_key,
            ttl,
        }
    }

    /// Records that `peer` can serve `key`. Re-announcing refreshes
    /// the expiry.
    pub fn add(&mut self, key: &[u8], peer: PeerId) {
        let expires_at = Instant::now() + self.ttl;
        if self.map.get(key).is_none() {
            if self.map.len() >= self.max_keys {
                self.evict_soonest_key();
            }
            self.map.insert(key.to_vec(), Vec::new());
        }
        let entries = self.map.get_mut(key).expect("key inserted above");
        match entries.iter_mut().find(|e| e.peer == peer) {
            Some(entry) => entry.expires_at = expires_at,
            None => {
                if entries.len() >= self.providers_per_key {
                    // full key: the provider closest to expiry leaves
                    if let Some(pos) = entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.expires_at)
                        .map(|(i, _)| i)
                    {
                        entries.remove(pos);
                    }
                }
                entries.push(ProviderEntry { peer, expires_at });
            }
        }
    }

    /// The live providers of `key`.
    pub fn get(&mut self, key: &[u8]) -> Vec<PeerId> {
        let now = Instant::now();
        match self.map.get_mut(key) {
            Some(entries) => {
                entries.retain(|e| e.expires_at > now);
                entries.iter().map(|e| e.peer).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn collect_garbage(&mut self) {
        let now = Instant::now();
        let empty: Vec<Vec<u8>> = self
            .map
            .iter_mut()
            .filter_map(|(k, entries)| {
                entries.retain(|e| e.expires_at > now);
                if entries.is_empty() {
                    Some(k.clone())
                } else {
                    None
                }
            })
            .collect();
        for key in empty {
            self.map.remove(&key);
        }
    }

    fn evict_soonest_key(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, entries)| entries.iter().map(|e| e.expires_at).min())
            .map(|(k, _)| k.clone());
        if let Some(key) = victim {
            self.map.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_roundtrip_and_overwrite() {
        let mut store = ValueStore::new(16, Duration::from_secs(60));
        store.put(b"k".to_vec(), b"v1".to_vec());
        assert_eq!(store.get(b"k"), Some(b"v1".to_vec()));
        store.put(b"k".to_vec(), b"v2".to_vec());
        assert_eq!(store.get(b"k"), Some(b"v2".to_vec()));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_value_capacity_evicts() {
        let mut store = ValueStore::new(4, Duration::from_secs(60));
        for i in 0..8u8 {
            store.put(vec![i], vec![i]);
        }
        assert_eq!(store.len(), 4);
        // the last inserted values survived
        assert_eq!(store.get(&[7]), Some(vec![7]));
    }

    #[test]
    fn test_value_expiry() {
        let mut store = ValueStore::new(4, Duration::from_millis(0));
        store.put(b"k".to_vec(), b"v".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get(b"k"), None);
        store.collect_garbage();
        assert!(store.is_empty());
    }

    #[test]
    fn test_provider_refresh_and_cap() {
        let mut store = ProviderStore::new(16, 2, Duration::from_secs(60));
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        store.add(b"k", a);
        store.add(b"k", a);
        store.add(b"k", b);
        assert_eq!(store.get(b"k").len(), 2);
        // over the per-key cap: someone is displaced
        store.add(b"k", c);
        let providers = store.get(b"k");
        assert_eq!(providers.len(), 2);
        assert!(providers.contains(&c));
    }

    #[test]
    fn test_provider_expiry() {
        let mut store = ProviderStore::new(16, 8, Duration::from_millis(0));
        store.add(b"k", PeerId::random());
        std::thread::sleep(Duration::from_millis(5));
        assert!(store.get(b"k").is_empty());
    }
}
