//! The Kademlia routing table: 256 k-buckets indexed by XOR distance
//! from the local peer.
//!
//! Bucket `i` holds peers whose SHA-256 key differs from ours in the
//! most significant bit `i`. Buckets order entries least recently seen
//! first, so the head is always the eviction candidate.

use std::collections::VecDeque;
use std::time::Instant;

use crate::p2p::crypto::hash::{sha256, Digest};
use crate::p2p::peer::PeerId;

/// Default bucket capacity.
pub const K: usize = 20;

const BUCKET_COUNT: usize = Digest::LENGTH * 8;

/// The 256-bit Kademlia coordinate of a peer id.
pub fn kad_key(peer: &PeerId) -> Digest {
    sha256(&peer.to_bytes())
}

#[derive(Clone)]
struct Entry {
    peer: PeerId,
    key: Digest,
    last_seen: Instant,
    permanent: bool,
}

#[derive(Default)]
struct Bucket {
    // least recently seen at the front
    entries: VecDeque<Entry>,
}

/// Outcome of inserting a peer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    /// Appended to a bucket with room.
    Added,
    /// Already present; moved to the most-recently-seen position.
    Refreshed,
    /// The bucket is full. The caller should ping `head`; if it is
    /// dead, `replace_head` admits the candidate.
    BucketFull { head: PeerId },
    /// The candidate is the local peer itself.
    Rejected,
}

pub struct RoutingTable {
    local_peer: PeerId,
    local_key: Digest,
    buckets: Vec<Bucket>,
    k: usize,
}

impl RoutingTable {
    pub fn new(local_peer: PeerId, k: usize) -> Self {
        Self {
            local_peer,
            local_key: kad_key(&local_peer),
            buckets: (0..BUCKET_COUNT).map(|_| Bucket::default()).collect(),
            k,
        }
    }

    fn bucket_index(&self, key: &Digest) -> Option<usize> {
        self.local_key.xor(key).highest_bit()
    }

    /// Inserts or refreshes `peer`.
    pub fn update(&mut self, peer: PeerId, permanent: bool) -> UpdateOutcome {
        if peer == self.local_peer {
            return UpdateOutcome::Rejected;
        }
        let key = kad_key(&peer);
        let index = match self.bucket_index(&key) {
            Some(i) => i,
            None => return UpdateOutcome::Rejected,
        };
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.entries.iter().position(|e| e.peer == peer) {
            let mut entry = bucket.entries.remove(pos).expect("position just found");
            entry.last_seen = Instant::now();
            entry.permanent = entry.permanent || permanent;
            bucket.entries.push_back(entry);
            return UpdateOutcome::Refreshed;
        }
        if bucket.entries.len() < self.k {
            bucket.entries.push_back(Entry {
                peer,
                key,
                last_seen: Instant::now(),
                permanent,
            });
            return UpdateOutcome::Added;
        }
        // full bucket: the least recently seen entry decides
        let head = bucket
            .entries
            .front()
            .expect("full bucket has a head")
            .peer;
        UpdateOutcome::BucketFull { head }
    }

    /// Replaces a dead bucket head with a candidate that found the
    /// bucket full. Permanent entries are never evicted.
    pub fn replace_head(&mut self, head: &PeerId, candidate: PeerId, permanent: bool) {
        let key = kad_key(&candidate);
        let index = match self.bucket_index(&key) {
            Some(i) => i,
            None => return,
        };
        let bucket = &mut self.buckets[index];
        match bucket.entries.front() {
            Some(entry) if entry.peer == *head && !entry.permanent => {
                bucket.entries.pop_front();
                bucket.entries.push_back(Entry {
                    peer: candidate,
                    key,
                    last_seen: Instant::now(),
                    permanent,
                });
            }
            _ => {}
        }
    }

    pub fn remove(&mut self, peer: &PeerId) {
        let key = kad_key(peer);
        if let Some(index) = self.bucket_index(&key) {
            self.buckets[index].entries.retain(|e| e.peer != *peer);
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        let key = kad_key(peer);
        match self.bucket_index(&key) {
            Some(index) => self.buckets[index].entries.iter().any(|e| e.peer == *peer),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Up to `count` known peers, sorted by XOR distance to `target`.
    ///
    /// Buckets are visited outward from the target's bucket, then the
    /// collected candidates are sorted exactly, so the result is a
    /// prefix of the distance-ordered set of all known peers.
    pub fn nearest_peers(&self, target: &Digest, count: usize) -> Vec<PeerId> {
        let start = self.bucket_index(target).unwrap_or(0);
        let mut candidates: Vec<(Digest, PeerId)> = Vec::new();
        let mut visit = |bucket: &Bucket, candidates: &mut Vec<(Digest, PeerId)>| {
            for entry in &bucket.entries {
                candidates.push((entry.key.xor(target), entry.peer));
            }
        };
        visit(&self.buckets[start], &mut candidates);
        for delta in 1..BUCKET_COUNT {
            let below = start.checked_sub(delta);
            let above = start + delta;
            if below.is_none() && above >= BUCKET_COUNT {
                break;
            }
            if let Some(i) = below {
                visit(&self.buckets[i], &mut candidates);
            }
            if above < BUCKET_COUNT {
                visit(&self.buckets[above], &mut candidates);
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.dedup_by(|a, b| a.1 == b.1);
        candidates
            .into_iter()
            .take(count)
            .map(|(_, peer)| peer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_then_contains() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, K);
        let peer = PeerId::random();
        assert_eq!(table.update(peer, false), UpdateOutcome::Added);
        assert!(table.contains(&peer));
        assert_eq!(table.update(peer, false), UpdateOutcome::Refreshed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.update(local, false), UpdateOutcome::Rejected);
    }

    #[test]
    fn test_nearest_is_sorted_prefix_of_all_known() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, K);
        let mut all = Vec::new();
        for _ in 0..200 {
            let peer = PeerId::random();
            if matches!(table.update(peer, false), UpdateOutcome::Added) {
                all.push(peer);
            }
        }
        let target = kad_key(&PeerId::random());

        let nearest = table.nearest_peers(&target, 16);
        assert!(nearest.len() <= 16);

        // no duplicates
        let mut seen = std::collections::HashSet::new();
        assert!(nearest.iter().all(|p| seen.insert(*p)));

        // sorted by distance and a prefix of the full sorted set
        let mut expected: Vec<PeerId> = all.clone();
        expected.sort_by_key(|p| kad_key(p).xor(&target));
        assert_eq!(nearest, expected[..nearest.len()].to_vec());
    }

    #[test]
    fn test_full_bucket_reports_head() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 2);
        // generate peers until one bucket holds two and a third lands
        // in the same bucket
        let mut outcome = None;
        for _ in 0..10_000 {
            let peer = PeerId::random();
            if let UpdateOutcome::BucketFull { head } = table.update(peer, false) {
                outcome = Some((head, peer));
                break;
            }
        }
        let (head, candidate) = outcome.expect("some bucket filled up");
        assert!(table.contains(&head));
        assert!(!table.contains(&candidate));

        // the head turned out dead; the candidate takes its slot
        table.replace_head(&head, candidate, false);
        assert!(!table.contains(&head));
        assert!(table.contains(&candidate));
    }

    #[test]
    fn test_permanent_head_survives_replace() {
        let local = PeerId::random();
        let mut table = RoutingTable::new(local, 1);
        let mut replaced = None;
        for _ in 0..10_000 {
            let peer = PeerId::random();
            match table.update(peer, true) {
                UpdateOutcome::BucketFull { head } => {
                    replaced = Some((head, peer));
                    break;
                }
                _ => {}
            }
        }
        let (head, candidate) = replaced.expect("some bucket filled up");
        table.replace_head(&head, candidate, false);
        assert!(table.contains(&head), "permanent entries are not evicted");
    }
}
