//! The iterative query engine's bookkeeping.
//!
//! `IterativeLookup` is a pure state machine: it tracks the peers seen
//! so far ordered by XOR distance to the target, which of them were
//! queried, and how many requests are in flight. The async driver in
//! the parent module feeds it responses and failures; the machine
//! never does I/O itself, which is what keeps the loop invariant
//! (`in_flight <= alpha`, every known peer is queried, in flight or
//! awaiting dispatch) straightforward to test.

use std::collections::{BTreeMap, HashMap};

use crate::p2p::crypto::hash::Digest;
use crate::p2p::kad::routing::kad_key;
use crate::p2p::peer::PeerId;

/// Default concurrency limit.
pub const ALPHA: usize = 3;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum PeerState {
    /// Known, not yet contacted.
    Awaiting,
    /// A request to it is in flight.
    InFlight,
    /// Responded.
    Queried,
    /// Timed out or failed; never retried.
    Failed,
}

pub struct IterativeLookup {
    target: Digest,
    alpha: usize,
    k: usize,
    // distance-ordered view of every peer seen
    closest_seen: BTreeMap<Digest, PeerId>,
    states: HashMap<PeerId, PeerState>,
    in_flight: usize,
}

impl IterativeLookup {
    pub fn new(target: Digest, seeds: impl IntoIterator<Item = PeerId>, alpha: usize, k: usize) -> Self {
        let mut lookup = Self {
            target,
            alpha,
            k,
            closest_seen: BTreeMap::new(),
            states: HashMap::new(),
            in_flight: 0,
        };
        for peer in seeds {
            lookup.observe(peer);
        }
        lookup
    }

    /// Adds a peer to the candidate set if it is new.
    pub fn observe(&mut self, peer: PeerId) {
        if self.states.contains_key(&peer) {
            return;
        }
        let distance = kad_key(&peer).xor(&self.target);
        self.states.insert(peer, PeerState::Awaiting);
        self.closest_seen.insert(distance, peer);
    }

    /// Pops up to `alpha - in_flight` nearest awaiting peers and marks
    /// them in flight.
    pub fn next_batch(&mut self) -> Vec<PeerId> {
        let slots = self.alpha.saturating_sub(self.in_flight);
        if slots == 0 {
            return Vec::new();
        }
        let picked: Vec<PeerId> = self
            .closest_seen
            .values()
            .filter(|peer| self.states.get(*peer) == Some(&PeerState::Awaiting))
            .take(slots)
            .copied()
            .collect();
        for peer in &picked {
            self.states.insert(*peer, PeerState::InFlight);
            self.in_flight += 1;
        }
        picked
    }

    /// Marks a response from `peer` and folds in the closer peers it
    /// returned.
    pub fn on_response(&mut self, peer: &PeerId, closer: impl IntoIterator<Item = PeerId>) {
        if self.states.get(peer) == Some(&PeerState::InFlight) {
            self.in_flight -= 1;
        }
        self.states.insert(*peer, PeerState::Queried);
        for candidate in closer {
            self.observe(candidate);
        }
    }

    /// Marks a timeout or stream error for `peer`. No retry.
    pub fn on_failure(&mut self, peer: &PeerId) {
        if self.states.get(peer) == Some(&PeerState::InFlight) {
            self.in_flight -= 1;
        }
        self.states.insert(*peer, PeerState::Failed);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether any candidate still awaits dispatch.
    pub fn has_awaiting(&self) -> bool {
        self.states.values().any(|s| *s == PeerState::Awaiting)
    }

    /// The k nearest peers seen so far, queried or not.
    pub fn k_closest(&self) -> Vec<PeerId> {
        self.closest_seen.values().take(self.k).copied().collect()
    }

    /// Termination rule shared by every operation: the k nearest seen
    /// peers have all been dealt with and nothing is in flight.
    pub fn is_exhausted(&self) -> bool {
        if self.in_flight > 0 {
            return false;
        }
        self.closest_seen
            .values()
            .take(self.k)
            .all(|peer| match self.states.get(peer) {
                Some(PeerState::Queried) | Some(PeerState::Failed) => true,
                _ => false,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(peer: &PeerId) -> Digest {
        kad_key(peer)
    }

    #[test]
    fn test_never_more_than_alpha_in_flight() {
        let target = digest_of(&PeerId::random());
        let seeds: Vec<PeerId> = (0..32).map(|_| PeerId::random()).collect();
        let mut lookup = IterativeLookup::new(target, seeds.clone(), ALPHA, 20);

        let batch = lookup.next_batch();
        assert_eq!(batch.len(), ALPHA);
        assert_eq!(lookup.in_flight(), ALPHA);
        assert!(lookup.next_batch().is_empty());

        lookup.on_response(&batch[0], vec![PeerId::random()]);
        assert_eq!(lookup.in_flight(), ALPHA - 1);
        assert_eq!(lookup.next_batch().len(), 1);
        assert_eq!(lookup.in_flight(), ALPHA);
    }

    #[test]
    fn test_dispatch_is_nearest_first() {
        let target_peer = PeerId::random();
        let target = digest_of(&target_peer);
        let seeds: Vec<PeerId> = (0..16).map(|_| PeerId::random()).collect();
        let mut lookup = IterativeLookup::new(target, seeds.clone(), 2, 20);

        let mut by_distance = seeds.clone();
        by_distance.sort_by_key(|p| digest_of(p).xor(&target));
        assert_eq!(lookup.next_batch(), by_distance[..2].to_vec());
    }

    #[test]
    fn test_failures_are_not_retried() {
        let target = digest_of(&PeerId::random());
        let seeds: Vec<PeerId> = (0..3).map(|_| PeerId::random()).collect();
        let mut lookup = IterativeLookup::new(target, seeds, 3, 20);

        let batch = lookup.next_batch();
        for peer in &batch {
            lookup.on_failure(peer);
        }
        assert_eq!(lookup.in_flight(), 0);
        assert!(lookup.next_batch().is_empty());
        assert!(lookup.is_exhausted());
    }

    #[test]
    fn test_terminates_on_any_finite_peer_set() {
        // every queried peer keeps inventing new ones, but the total
        // universe is finite; the lookup must still exhaust
        let target = digest_of(&PeerId::random());
        let universe: Vec<PeerId> = (0..64).map(|_| PeerId::random()).collect();
        let mut lookup =
            IterativeLookup::new(target, universe[..4].iter().copied(), ALPHA, 20);

        let mut steps = 0usize;
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() && lookup.in_flight() == 0 {
                break;
            }
            for peer in batch {
                lookup.on_response(&peer, universe.clone());
            }
            steps += 1;
            assert!(steps < 10_000, "lookup failed to terminate");
        }
        assert!(lookup.is_exhausted());
        assert!(!lookup.has_awaiting() || lookup.is_exhausted());
    }

    #[test]
    fn test_k_closest_is_distance_sorted() {
        let target = digest_of(&PeerId::random());
        let seeds: Vec<PeerId> = (0..40).map(|_| PeerId::random()).collect();
        let lookup = IterativeLookup::new(target, seeds.clone(), ALPHA, 8);

        let got = lookup.k_closest();
        let mut expected = seeds;
        expected.sort_by_key(|p| digest_of(p).xor(&target));
        assert_eq!(got, expected[..8].to_vec());
    }
}
