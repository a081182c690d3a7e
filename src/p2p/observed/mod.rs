//! Externally observed dial-back addresses.
//!
//! Remote peers report, via Identify, the address they saw us dial in
//! from. One report proves nothing behind a NAT; an address counts as
//! confirmed once enough distinct peers agree on it over the same
//! transport.

use std::collections::{HashMap, HashSet};

use multiaddr::Multiaddr;
use parking_lot::Mutex;

use crate::p2p::peer::PeerId;
use crate::p2p::transport::same_transport;

/// Distinct peers that must report an address before it is believed.
pub const CONFIRMATION_THRESHOLD: usize = 4;

#[derive(Default)]
struct Observation {
    reporters: HashSet<PeerId>,
    initiator_count: usize,
    non_initiator_count: usize,
}

/// Per-listener accumulator of observed addresses.
#[derive(Default)]
pub struct ObservedAddresses {
    // local listener address -> observed address -> evidence
    inner: Mutex<HashMap<Multiaddr, HashMap<Multiaddr, Observation>>>,
}

impl ObservedAddresses {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `reporter` saw us as `observed` on the connection
    /// that arrived via `local_listener`. Reports over a different
    /// transport than the listener's are discarded.
    pub fn add(
        &self,
        local_listener: &Multiaddr,
        observed: Multiaddr,
        reporter: PeerId,
        reporter_is_initiator: bool,
    ) {
        if !same_transport(local_listener, &observed) {
            return;
        }
        let mut inner = self.inner.lock();
        let entry = inner
            .entry(local_listener.clone())
            .or_default()
            .entry(observed)
            .or_default();
        if entry.reporters.insert(reporter) {
            if reporter_is_initiator {
                entry.initiator_count += 1;
            } else {
                entry.non_initiator_count += 1;
            }
        }
    }

    /// Confirmed addresses for one listener.
    pub fn confirmed(&self, local_listener: &Multiaddr) -> Vec<Multiaddr> {
        let inner = self.inner.lock();
        match inner.get(local_listener) {
            Some(observations) => observations
                .iter()
                .filter(|(_, o)| o.reporters.len() >= CONFIRMATION_THRESHOLD)
                .map(|(addr, _)| addr.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Confirmed addresses across all listeners, deduplicated. These
    /// are worth advertising in outgoing Identify messages.
    pub fn all_confirmed(&self) -> Vec<Multiaddr> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for observations in inner.values() {
            for (addr, o) in observations {
                if o.reporters.len() >= CONFIRMATION_THRESHOLD && !out.contains(addr) {
                    out.push(addr.clone());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_confirmation_needs_four_distinct_peers() {
        let observed = ObservedAddresses::new();
        let listener = addr("/ip4/0.0.0.0/tcp/4001");
        let seen = addr("/ip4/203.0.113.7/tcp/35021");

        let repeat_reporter = PeerId::random();
        for _ in 0..10 {
            observed.add(&listener, seen.clone(), repeat_reporter, true);
        }
        assert!(observed.confirmed(&listener).is_empty());

        for _ in 0..2 {
            observed.add(&listener, seen.clone(), PeerId::random(), true);
        }
        assert!(observed.confirmed(&listener).is_empty());

        observed.add(&listener, seen.clone(), PeerId::random(), false);
        assert_eq!(observed.confirmed(&listener), vec![seen.clone()]);
        assert_eq!(observed.all_confirmed(), vec![seen]);
    }

    #[test]
    fn test_mismatched_transport_is_ignored() {
        let observed = ObservedAddresses::new();
        let listener = addr("/ip4/0.0.0.0/tcp/4001");
        for _ in 0..8 {
            observed.add(
                &listener,
                addr("/ip4/203.0.113.7/udp/9"),
                PeerId::random(),
                true,
            );
        }
        assert!(observed.confirmed(&listener).is_empty());
    }
}
