//! In-memory repositories for what we know about peers: addresses,
//! public keys and supported protocols, each with its own lifetime
//! rules.
//!
//! All three books are guarded by one short-lived lock; nothing here
//! ever suspends while holding it.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use multiaddr::Multiaddr;
use parking_lot::Mutex;

use crate::p2p::crypto::signature::{KeyPair, PublicKey};
use crate::p2p::multiselect::ProtocolId;
use crate::p2p::peer::{PeerId, PeerInfo};

/// Lifetime classes for stored addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressTtl {
    /// Seconds; a dial hint that goes stale quickly.
    Transient,
    /// Minutes; learned from a live connection.
    RecentlyConnected,
    /// A day; learned from routing gossip.
    Day,
    /// Never expires; bootstrap peers.
    Permanent,
}

impl AddressTtl {
    fn duration(&self) -> Option<Duration> {
        match self {
            AddressTtl::Transient => Some(Duration::from_secs(30)),
            AddressTtl::RecentlyConnected => Some(Duration::from_secs(10 * 60)),
            AddressTtl::Day => Some(Duration::from_secs(24 * 60 * 60)),
            AddressTtl::Permanent => None,
        }
    }
}

struct AddressEntry {
    addr: Multiaddr,
    // None marks a permanent entry
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Books {
    addresses: HashMap<PeerId, Vec<AddressEntry>>,
    keys: HashMap<PeerId, Vec<PublicKey>>,
    local_keys: Vec<KeyPair>,
    protocols: HashMap<PeerId, BTreeSet<ProtocolId>>,
}

/// The per-host peer repository.
#[derive(Default)]
pub struct PeerStore {
    books: Mutex<Books>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or refreshes addresses for `peer`. An address already
    /// present keeps the longer of the two lifetimes.
    pub fn upsert_addresses(&self, peer: &PeerId, addrs: &[Multiaddr], ttl: AddressTtl) {
        let expires_at = ttl.duration().map(|d| Instant::now() + d);
        let mut books = self.books.lock();
        let entries = books.addresses.entry(*peer).or_default();
        for addr in addrs {
            match entries.iter_mut().find(|e| e.addr == *addr) {
                Some(entry) => {
                    entry.expires_at = match (entry.expires_at, expires_at) {
                        (None, _) | (_, None) => None,
                        (Some(a), Some(b)) => Some(a.max(b)),
                    };
                }
                None => entries.push(AddressEntry {
                    addr: addr.clone(),
                    expires_at,
                }),
            }
        }
    }

    /// The live addresses of `peer`, in first-seen order.
    pub fn get_addresses(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let now = Instant::now();
        let mut books = self.books.lock();
        match books.addresses.get_mut(peer) {
            Some(entries) => {
                entries.retain(|e| e.expires_at.map(|t| t > now).unwrap_or(true));
                entries.iter().map(|e| e.addr.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get_peer_info(&self, peer: &PeerId) -> PeerInfo {
        PeerInfo::with_addresses(*peer, self.get_addresses(peer))
    }

    /// Every peer with at least one live address.
    pub fn peers_with_addresses(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let mut books = self.books.lock();
        let mut out = Vec::new();
        for (peer, entries) in books.addresses.iter_mut() {
            entries.retain(|e| e.expires_at.map(|t| t > now).unwrap_or(true));
            if !entries.is_empty() {
                out.push(*peer);
            }
        }
        out
    }

    /// Records a public key for `peer`. Keys are immutable once added.
    pub fn add_public_key(&self, peer: &PeerId, key: PublicKey) {
        let mut books = self.books.lock();
        let keys = books.keys.entry(*peer).or_default();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    pub fn get_public_keys(&self, peer: &PeerId) -> Vec<PublicKey> {
        self.books
            .lock()
            .keys
            .get(peer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_local_keypair(&self, keypair: KeyPair) {
        self.books.lock().local_keys.push(keypair);
    }

    pub fn local_keypairs(&self) -> Vec<KeyPair> {
        self.books.lock().local_keys.clone()
    }

    /// Adds protocols supported by `peer`. Idempotent.
    pub fn add_protocols(&self, peer: &PeerId, protocols: &[ProtocolId]) {
        let mut books = self.books.lock();
        let set = books.protocols.entry(*peer).or_default();
        for proto in protocols {
            set.insert(proto.clone());
        }
    }

    /// Removes protocols from `peer`'s record. Idempotent.
    pub fn remove_protocols(&self, peer: &PeerId, protocols: &[ProtocolId]) {
        let mut books = self.books.lock();
        if let Some(set) = books.protocols.get_mut(peer) {
            for proto in protocols {
                set.remove(proto);
            }
        }
    }

    pub fn get_protocols(&self, peer: &PeerId) -> Vec<ProtocolId> {
        self.books
            .lock()
            .protocols
            .get(peer)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forgets everything about `peer` across all three books.
    pub fn clear_peer(&self, peer: &PeerId) {
        let mut books = self.books.lock();
        books.addresses.remove(peer);
        books.keys.remove(peer);
        books.protocols.remove(peer);
    }

    /// Drops expired address entries. Run periodically by the host.
    pub fn collect_garbage(&self) {
        let now = Instant::now();
        let mut books = self.books.lock();
        books.addresses.retain(|_, entries| {
            entries.retain(|e| e.expires_at.map(|t| t > now).unwrap_or(true));
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_upsert_keeps_order_and_dedups() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        store.upsert_addresses(
            &peer,
            &[addr("/ip4/1.1.1.1/tcp/1"), addr("/ip4/2.2.2.2/tcp/2")],
            AddressTtl::Day,
        );
        store.upsert_addresses(&peer, &[addr("/ip4/1.1.1.1/tcp/1")], AddressTtl::Day);
        assert_eq!(
            store.get_addresses(&peer),
            vec![addr("/ip4/1.1.1.1/tcp/1"), addr("/ip4/2.2.2.2/tcp/2")]
        );
    }

    #[test]
    fn test_ttl_merges_as_max() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        store.upsert_addresses(&peer, &[addr("/ip4/1.1.1.1/tcp/1")], AddressTtl::Permanent);
        // a shorter refresh must not demote a permanent entry
        store.upsert_addresses(&peer, &[addr("/ip4/1.1.1.1/tcp/1")], AddressTtl::Transient);
        store.collect_garbage();
        assert_eq!(store.get_addresses(&peer).len(), 1);
    }

    #[test]
    fn test_protocols_idempotent() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        store.add_protocols(&peer, &["/echo/1.0.0".to_string(), "/echo/1.0.0".to_string()]);
        store.add_protocols(&peer, &["/echo/1.0.0".to_string()]);
        assert_eq!(store.get_protocols(&peer), vec!["/echo/1.0.0".to_string()]);
        store.remove_protocols(&peer, &["/echo/1.0.0".to_string()]);
        store.remove_protocols(&peer, &["/echo/1.0.0".to_string()]);
        assert!(store.get_protocols(&peer).is_empty());
    }

    #[test]
    fn test_clear_removes_all_books() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        let kp = KeyPair::generate().unwrap();
        store.upsert_addresses(&peer, &[addr("/ip4/1.1.1.1/tcp/1")], AddressTtl::Day);
        store.add_public_key(&peer, kp.public_key());
        store.add_protocols(&peer, &["/echo/1.0.0".to_string()]);
        store.clear_peer(&peer);
        assert!(store.get_addresses(&peer).is_empty());
        assert!(store.get_public_keys(&peer).is_empty());
        assert!(store.get_protocols(&peer).is_empty());
    }

    #[test]
    fn test_keys_are_set_like() {
        let store = PeerStore::new();
        let peer = PeerId::random();
        let kp = KeyPair::generate().unwrap();
        store.add_public_key(&peer, kp.public_key());
        store.add_public_key(&peer, kp.public_key());
        assert_eq!(store.get_public_keys(&peer).len(), 1);
    }
}
