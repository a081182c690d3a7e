//! The connection manager: the per-host index of live muxed
//! connections.
//!
//! Closure events are fanned out to subscribers after the bookkeeping
//! lock is released, so a subscriber may call straight back into the
//! manager, including from the teardown path of the connection that
//! just closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::channel::mpsc;
use log::{debug, trace};
use multiaddr::Multiaddr;
use parking_lot::Mutex;

use crate::p2p::error::*;
use crate::p2p::muxer::MuxControl;
use crate::p2p::peer::{PeerId, PeerInfo};

/// How long a peer stays banned after a protocol violation.
pub const BAN_INTERVAL: Duration = Duration::from_secs(60);

/// Four-valued classification of reachability.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Connectedness {
    NotConnected,
    Connected,
    CanConnect,
    CannotConnect,
}

/// A registered muxed connection, as the manager sees it.
#[derive(Clone)]
pub struct ManagedConnection {
    pub id: u64,
    pub peer: PeerId,
    pub control: MuxControl,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
    pub initiator: bool,
    closing: Arc<AtomicBool>,
}

impl ManagedConnection {
    /// Whether teardown has at least started.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Asks the muxer to shut the connection down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::SeqCst);
        self.control.close().await
    }
}

/// Events published on the connection bus.
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    Opened { peer: PeerId, connection: u64 },
    Closed { peer: PeerId, connection: u64 },
}

#[derive(Default)]
struct Index {
    // most recently added last; getters reverse
    connections: HashMap<PeerId, Vec<ManagedConnection>>,
    dial_failures: HashMap<PeerId, Instant>,
    bans: HashMap<PeerId, Instant>,
}

/// Index of live connections per peer, plus the close-event bus.
#[derive(Default)]
pub struct ConnectionManager {
    index: Mutex<Index>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ConnectionEvent>>>,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh connection and announces it on the bus.
    pub fn add(
        &self,
        peer: PeerId,
        control: MuxControl,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        initiator: bool,
    ) -> ManagedConnection {
        let conn = ManagedConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            peer,
            control,
            local_addr,
            remote_addr,
            initiator,
            closing: Arc::new(AtomicBool::new(false)),
        };
        {
            let mut index = self.index.lock();
            index.dial_failures.remove(&peer);
            index.connections.entry(peer).or_default().push(conn.clone());
        }
        trace!("connmgr: added connection {} to {}", conn.id, peer);
        self.publish(ConnectionEvent::Opened {
            peer,
            connection: conn.id,
        });
        conn
    }

    /// All connections to `peer`, most recently added first.
    pub fn get_connections(&self, peer: &PeerId) -> Vec<ManagedConnection> {
        let index = self.index.lock();
        match index.connections.get(peer) {
            Some(list) => list.iter().rev().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// The first open, non-closing connection to `peer`.
    pub fn get_best_connection(&self, peer: &PeerId) -> Option<ManagedConnection> {
        let index = self.index.lock();
        index
            .connections
            .get(peer)?
            .iter()
            .rev()
            .find(|c| !c.is_closing())
            .cloned()
    }

    /// Classifies how reachable `info` currently is.
    pub fn connectedness(&self, info: &PeerInfo) -> Connectedness {
        if self.get_best_connection(&info.id).is_some() {
            return Connectedness::Connected;
        }
        let index = self.index.lock();
        if let Some(failed_at) = index.dial_failures.get(&info.id) {
            if failed_at.elapsed() < BAN_INTERVAL {
                return Connectedness::CannotConnect;
            }
        }
        if !info.addresses.is_empty() {
            Connectedness::CanConnect
        } else {
            Connectedness::NotConnected
        }
    }

    /// Records a failed dial, steering `connectedness` towards
    /// `CannotConnect` for a while.
    pub fn note_dial_failure(&self, peer: &PeerId) {
        self.index.lock().dial_failures.insert(*peer, Instant::now());
    }

    /// Bans `peer` for [`BAN_INTERVAL`] after a protocol violation.
    pub fn ban(&self, peer: &PeerId) {
        debug!("connmgr: banning {} for {:?}", peer, BAN_INTERVAL);
        self.index.lock().bans.insert(*peer, Instant::now());
    }

    pub fn is_banned(&self, peer: &PeerId) -> bool {
        let mut index = self.index.lock();
        match index.bans.get(peer) {
            Some(at) if at.elapsed() < BAN_INTERVAL => true,
            Some(_) => {
                index.bans.remove(peer);
                false
            }
            None => false,
        }
    }

    /// Removes a connection from the index and fires the close event.
    /// Calling it twice for the same connection publishes once.
    pub fn on_connection_closed(&self, peer: &PeerId, connection: u64) {
        let removed = {
            let mut index = self.index.lock();
            match index.connections.get_mut(peer) {
                Some(list) => {
                    let before = list.len();
                    list.retain(|c| c.id != connection);
                    let removed = list.len() != before;
                    if list.is_empty() {
                        index.connections.remove(peer);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            trace!("connmgr: connection {} to {} closed", connection, peer);
            self.publish(ConnectionEvent::Closed {
                peer: *peer,
                connection,
            });
        }
    }

    /// Subscribes to open/close events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: ConnectionEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Ids of peers we have at least one live connection to.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.index.lock().connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::muxer::{mplex, MuxerConfig};
    use futures::StreamExt;

    // a control whose actor never runs; good enough for indexing tests
    fn dummy_control() -> MuxControl {
        let (_conn, control, _inbound) = mplex::Connection::new(
            futures::io::Cursor::new(Vec::new()),
            MuxerConfig::default(),
            true,
        );
        MuxControl::Mplex(control)
    }

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_best_connection_prefers_recent_open() {
        let mgr = ConnectionManager::new();
        let peer = PeerId::random();
        let a = mgr.add(
            peer,
            dummy_control(),
            addr("/ip4/127.0.0.1/tcp/1"),
            addr("/ip4/127.0.0.1/tcp/2"),
            true,
        );
        let b = mgr.add(
            peer,
            dummy_control(),
            addr("/ip4/127.0.0.1/tcp/1"),
            addr("/ip4/127.0.0.1/tcp/3"),
            false,
        );
        assert_eq!(mgr.get_connections(&peer).len(), 2);
        assert_eq!(mgr.get_best_connection(&peer).unwrap().id, b.id);

        b.closing.store(true, Ordering::SeqCst);
        assert_eq!(mgr.get_best_connection(&peer).unwrap().id, a.id);
    }

    #[test]
    fn test_close_event_fires_once() {
        let mgr = ConnectionManager::new();
        let peer = PeerId::random();
        let conn = mgr.add(
            peer,
            dummy_control(),
            addr("/ip4/127.0.0.1/tcp/1"),
            addr("/ip4/127.0.0.1/tcp/2"),
            true,
        );
        let mut events = mgr.subscribe();

        mgr.on_connection_closed(&peer, conn.id);
        mgr.on_connection_closed(&peer, conn.id);

        let first = events.try_next().unwrap().unwrap();
        assert!(matches!(first, ConnectionEvent::Closed { .. }));
        // second close was a no-op
        assert!(events.try_next().is_err() || events.try_next().unwrap().is_none());
    }

    #[test]
    fn test_connectedness_classification() {
        let mgr = ConnectionManager::new();
        let peer = PeerId::random();

        let no_addrs = PeerInfo::new(peer);
        assert_eq!(mgr.connectedness(&no_addrs), Connectedness::NotConnected);

        let with_addrs =
            PeerInfo::with_addresses(peer, vec![addr("/ip4/10.0.0.1/tcp/4001")]);
        assert_eq!(mgr.connectedness(&with_addrs), Connectedness::CanConnect);

        mgr.note_dial_failure(&peer);
        assert_eq!(mgr.connectedness(&with_addrs), Connectedness::CannotConnect);

        let conn = mgr.add(
            peer,
            dummy_control(),
            addr("/ip4/127.0.0.1/tcp/1"),
            addr("/ip4/127.0.0.1/tcp/2"),
            true,
        );
        assert_eq!(mgr.connectedness(&with_addrs), Connectedness::Connected);
        mgr.on_connection_closed(&peer, conn.id);
        assert_eq!(mgr.connectedness(&with_addrs), Connectedness::CanConnect);
    }

    #[test]
    fn test_ban_expires() {
        let mgr = ConnectionManager::new();
        let peer = PeerId::random();
        assert!(!mgr.is_banned(&peer));
        mgr.ban(&peer);
        assert!(mgr.is_banned(&peer));
    }

    #[test]
    fn test_subscriber_may_reenter_manager() {
        let mgr = Arc::new(ConnectionManager::new());
        let peer = PeerId::random();
        let conn = mgr.add(
            peer,
            dummy_control(),
            addr("/ip4/127.0.0.1/tcp/1"),
            addr("/ip4/127.0.0.1/tcp/2"),
            true,
        );
        let mut events = mgr.subscribe();
        mgr.on_connection_closed(&peer, conn.id);
        // reading the event and querying the manager from the same
        // task mirrors a callback re-entering during teardown
        let event = events.try_next().unwrap().unwrap();
        assert!(matches!(event, ConnectionEvent::Closed { .. }));
        assert!(mgr.get_connections(&peer).is_empty());
    }
}
