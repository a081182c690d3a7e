//! Kademlia peer and content discovery.
//!
//! The service glues four parts together: the k-bucket routing table,
//! the iterative query engine, the local value/provider stores and the
//! wire protocol on `/ipfs/kad/1.0.0`. Requests are one message per
//! stream; responses correlate by stream identity.

pub mod query;
pub mod routing;
pub mod store;
pub mod wire;

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::io::AsyncWriteExt;
use futures::stream::FuturesUnordered;
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;
use log::{debug, trace, warn};
use parking_lot::Mutex;
use prost::Message as _;

use crate::p2p::async_runtime as rt;
use crate::p2p::crypto::hash::{sha256, Digest};
use crate::p2p::error::*;
use crate::p2p::framing;
use crate::p2p::host::{Host, StreamContext};
use crate::p2p::multiselect::ProtocolId;
use crate::p2p::muxer::Substream;
use crate::p2p::network::ConnectionEvent;
use crate::p2p::peer::{PeerId, PeerInfo};
use crate::p2p::peerstore::AddressTtl;
use crate::p2p::scheduler;

use query::IterativeLookup;
use routing::{kad_key, RoutingTable, UpdateOutcome};
use store::{AcceptAllValidator, ProviderStore, RecordValidator, ValueStore};
use wire::{Message, MessageType, Record, WirePeer};

pub const KAD_PROTOCOL_ID: &str = "/ipfs/kad/1.0.0";

/// Periodic random-walk bootstrap settings.
#[derive(Clone, Debug)]
pub struct RandomWalkConfig {
    /// Period between walk rounds.
    pub interval: Duration,
    /// FIND_NODE queries issued per round.
    pub queries_per_period: usize,
    /// Spacing between the queries of one round.
    pub delay: Duration,
}

impl Default for RandomWalkConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            queries_per_period: 3,
            delay: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct KademliaConfig {
    pub protocol_id: ProtocolId,
    /// Bucket capacity and lookup breadth.
    pub k: usize,
    /// Iterative query concurrency limit.
    pub alpha: usize,
    pub request_timeout: Duration,
    pub query_deadline: Duration,
    /// Records needed before a GET_VALUE lookup settles early.
    pub value_quorum: usize,
    pub value_capacity: usize,
    pub provider_key_capacity: usize,
    pub providers_per_key: usize,
    pub record_ttl: Duration,
    pub re_announce_interval: Duration,
    /// Answer queries from other peers.
    pub server_mode: bool,
    pub random_walk: Option<RandomWalkConfig>,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            protocol_id: KAD_PROTOCOL_ID.to_string(),
            k: routing::K,
            alpha: query::ALPHA,
            request_timeout: Duration::from_secs(10),
            query_deadline: Duration::from_secs(60),
            value_quorum: 4,
            value_capacity: 1024,
            provider_key_capacity: 1024,
            providers_per_key: 256,
            record_ttl: Duration::from_secs(24 * 60 * 60),
            re_announce_interval: Duration::from_secs(12 * 60 * 60),
            server_mode: true,
            random_walk: None,
        }
    }
}

enum LookupKind {
    /// Chase one peer id; stops early once it answers for itself.
    FindNode { target_peer: PeerId },
    /// Find the k closest peers to a key, nothing else.
    Closest,
    /// Collect provider records until `limit`.
    Providers { limit: usize },
    /// Collect value records until the quorum.
    Value { quorum: usize },
}

#[derive(Default)]
struct LookupOutcome {
    found_peer: Option<PeerInfo>,
    providers: Vec<PeerInfo>,
    records: Vec<(PeerId, Vec<u8>)>,
    k_closest: Vec<PeerId>,
}

/// The Kademlia service attached to one host.
pub struct Kademlia {
    host: Arc<Host>,
    cfg: KademliaConfig,
    validator: Arc<dyn RecordValidator>,
    table: Mutex<RoutingTable>,
    values: Mutex<ValueStore>,
    providers: Mutex<ProviderStore>,
    provided_keys: Mutex<HashSet<Vec<u8>>>,
    handles: Mutex<Vec<scheduler::Handle>>,
    tasks: Mutex<Vec<rt::JoinHandle<()>>>,
}

impl Kademlia {
    pub fn new(host: Arc<Host>, cfg: KademliaConfig) -> Arc<Kademlia> {
        Self::with_validator(host, cfg, Arc::new(AcceptAllValidator))
    }

    pub fn with_validator(
        host: Arc<Host>,
        cfg: KademliaConfig,
        validator: Arc<dyn RecordValidator>,
    ) -> Arc<Kademlia> {
        let local = host.peer_id();
        Arc::new(Kademlia {
            table: Mutex::new(RoutingTable::new(local, cfg.k)),
            values: Mutex::new(ValueStore::new(cfg.value_capacity, cfg.record_ttl)),
            providers: Mutex::new(ProviderStore::new(
                cfg.provider_key_capacity,
                cfg.providers_per_key,
                cfg.record_ttl,
            )),
            provided_keys: Mutex::new(HashSet::new()),
            handles: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            validator,
            host,
            cfg,
        })
    }

    /// Registers the server handler and the background maintenance
    /// tasks.
    pub fn start(self: &Arc<Self>) {
        if self.cfg.server_mode {
            let weak = Arc::downgrade(self);
            self.host
                .set_protocol_handler(&self.cfg.protocol_id, move |stream, ctx| {
                    let weak = weak.clone();
                    async move {
                        if let Some(kad) = weak.upgrade() {
                            if let Err(e) = kad.serve_stream(stream, &ctx).await {
                                trace!("kad: server session with {} ended: {}", ctx.peer, e);
                            }
                        }
                    }
                    .boxed()
                });
        }

        // fresh outbound connections feed the routing table
        let weak = Arc::downgrade(self);
        let mut events = self.host.connections().subscribe();
        let task = rt::spawn(async move {
            while let Some(event) = events.next().await {
                let kad = match weak.upgrade() {
                    Some(kad) => kad,
                    None => break,
                };
                if let ConnectionEvent::Opened { peer, connection } = event {
                    let outbound = kad
                        .host
                        .connections()
                        .get_connections(&peer)
                        .iter()
                        .any(|c| c.id == connection && c.initiator);
                    if outbound {
                        let info = kad.host.peerstore().get_peer_info(&peer);
                        kad.add_peer(&info, false);
                    }
                }
            }
        });
        self.track_task(task);

        if let Some(walk) = self.cfg.random_walk.clone() {
            self.spawn_random_walk(walk);
        }
        self.spawn_re_announce();
    }

    pub fn stop(&self) {
        for mut handle in self.handles.lock().drain(..) {
            handle.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Keeps a background task abortable from `stop`. Finished
    /// handles are reaped on every insert so the list stays bounded
    /// over the node's lifetime.
    fn track_task(&self, task: rt::JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub fn routing_table_len(&self) -> usize {
        self.table.lock().len()
    }

    /// Records `info` in the peerstore and the routing table. On a
    /// full bucket the stale head is pinged and replaced if dead.
    pub fn add_peer(self: &Arc<Self>, info: &PeerInfo, permanent: bool) {
        if info.id == self.host.peer_id() {
            return;
        }
        if !info.addresses.is_empty() {
            let ttl = if permanent {
                AddressTtl::Permanent
            } else {
                AddressTtl::Day
            };
            self.host
                .peerstore()
                .upsert_addresses(&info.id, &info.addresses, ttl);
        }
        let outcome = self.table.lock().update(info.id, permanent);
        trace!("kad: add_peer {} -> {:?}", info.id, outcome);
        if let UpdateOutcome::BucketFull { head } = outcome {
            let kad = self.clone();
            let candidate = info.id;
            let task = rt::spawn(async move {
                if kad.ping(&head).await.is_err() {
                    kad.table.lock().replace_head(&head, candidate, permanent);
                }
            });
            self.track_task(task);
        }
    }

    /// Looks a peer up, locally first, then iteratively in the DHT.
    pub async fn find_peer(self: &Arc<Self>, peer: &PeerId) -> Result<PeerInfo> {
        let local = self.host.peerstore().get_peer_info(peer);
        if !local.addresses.is_empty() {
            trace!("kad: {} found locally", peer);
            return Ok(local);
        }
        let outcome = self
            .run_lookup(
                peer.to_bytes(),
                kad_key(peer),
                LookupKind::FindNode { target_peer: *peer },
            )
            .await;
        match outcome.found_peer {
            Some(info) => Ok(info),
            None => Err(Error::simple(ErrorKind::NotFound)),
        }
    }

    /// Finds peers announcing `key`, up to `limit`.
    pub async fn find_providers(
        self: &Arc<Self>,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<PeerInfo>> {
        let mut found: Vec<PeerInfo> = Vec::new();
        for peer in self.providers.lock().get(key) {
            found.push(self.host.peerstore().get_peer_info(&peer));
        }
        if found.len() >= limit {
            found.truncate(limit);
            return Ok(found);
        }
        let outcome = self
            .run_lookup(
                key.to_vec(),
                sha256(key),
                LookupKind::Providers {
                    limit: limit - found.len(),
                },
            )
            .await;
        for info in outcome.providers {
            if !found.iter().any(|f| f.id == info.id) {
                found.push(info);
            }
        }
        found.truncate(limit);
        Ok(found)
    }

    /// Announces that this host can serve `key`.
    pub async fn provide(self: &Arc<Self>, key: &[u8], announce: bool) -> Result<()> {
        let local = self.host.peer_id();
        self.providers.lock().add(key, local);
        self.provided_keys.lock().insert(key.to_vec());
        if !announce {
            return Ok(());
        }
        self.announce_provider(key).await
    }

    async fn announce_provider(self: &Arc<Self>, key: &[u8]) -> Result<()> {
        let outcome = self
            .run_lookup(key.to_vec(), sha256(key), LookupKind::Closest)
            .await;
        let mut message = Message::new(MessageType::AddProvider, key.to_vec());
        message
            .provider_peers
            .push(self.local_wire_peer());
        let mut sends = FuturesUnordered::new();
        for peer in outcome.k_closest {
            let kad = self.clone();
            let msg = message.clone();
            sends.push(async move { kad.send_only(&peer, msg).await });
        }
        // fire and forget per the protocol; still drain the sends
        while let Some(res) = sends.next().await {
            if let Err(e) = res {
                trace!("kad: provider announce failed: {}", e);
            }
        }
        Ok(())
    }

    /// Stores `value` under `key` locally and on the k closest peers.
    pub async fn put_value(self: &Arc<Self>, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.validator.validate(key, &value)?;
        self.values.lock().put(key.to_vec(), value.clone());

        let outcome = self
            .run_lookup(key.to_vec(), sha256(key), LookupKind::Closest)
            .await;
        let mut message = Message::new(MessageType::PutValue, key.to_vec());
        message.record = Some(Record {
            key: key.to_vec(),
            value,
            time_received: String::new(),
        });
        let mut sends = FuturesUnordered::new();
        for peer in outcome.k_closest {
            let kad = self.clone();
            let msg = message.clone();
            sends.push(async move { (peer, kad.request(&peer, msg).await) });
        }
        let mut stored = 0usize;
        while let Some((peer, res)) = sends.next().await {
            match res {
                // the remote echoes the record on success
                Ok(reply) if reply.record.is_some() => stored += 1,
                Ok(_) => trace!("kad: {} did not echo the record", peer),
                Err(e) => trace!("kad: put to {} failed: {}", peer, e),
            }
        }
        debug!("kad: value stored on {} peers", stored);
        Ok(())
    }

    /// Fetches the best value stored under `key`.
    pub async fn get_value(self: &Arc<Self>, key: &[u8]) -> Result<Vec<u8>> {
        let mut records: Vec<(PeerId, Vec<u8>)> = Vec::new();
        if let Some(value) = self.values.lock().get(key) {
            records.push((self.host.peer_id(), value));
        }
        let quorum = self.cfg.value_quorum.saturating_sub(records.len());
        let outcome = self
            .run_lookup(key.to_vec(), sha256(key), LookupKind::Value { quorum })
            .await;
        records.extend(outcome.records);
        if records.is_empty() {
            return Err(Error::simple(ErrorKind::NotFound));
        }

        let values: Vec<Vec<u8>> = records.iter().map(|(_, v)| v.clone()).collect();
        let best_index = self.validator.select(key, &values).min(values.len() - 1);
        let best = values[best_index].clone();

        // repair peers that answered with a losing value
        let local = self.host.peer_id();
        for (peer, value) in records {
            if peer != local && value != best {
                let mut message = Message::new(MessageType::PutValue, key.to_vec());
                message.record = Some(Record {
                    key: key.to_vec(),
                    value: best.clone(),
                    time_received: String::new(),
                });
                let kad = self.clone();
                let task = rt::spawn(async move {
                    if let Err(e) = kad.request(&peer, message).await {
                        trace!("kad: repair of {} failed: {}", peer, e);
                    }
                });
                self.track_task(task);
            }
        }
        Ok(best)
    }

    /// One request/response on a fresh stream, as a liveness probe.
    async fn ping(self: &Arc<Self>, peer: &PeerId) -> Result<()> {
        let message = Message::new(MessageType::Ping, Vec::new());
        self.request(peer, message).await.map(|_| ())
    }

    // ------------------------------------------------------------------
    // iterative engine driver

    async fn run_lookup(
        self: &Arc<Self>,
        key: Vec<u8>,
        target: Digest,
        kind: LookupKind,
    ) -> LookupOutcome {
        let seeds = self.table.lock().nearest_peers(&target, self.cfg.k);
        let mut lookup = IterativeLookup::new(target, seeds, self.cfg.alpha, self.cfg.k);
        let mut outcome = LookupOutcome::default();

        let request_type = match kind {
            LookupKind::FindNode { .. } | LookupKind::Closest => MessageType::FindNode,
            LookupKind::Providers { .. } => MessageType::GetProviders,
            LookupKind::Value { .. } => MessageType::GetValue,
        };
        let mut request = Message::new(request_type, key);
        if self.cfg.server_mode {
            // announce ourselves so servers can learn the caller
            request.closer_peers.push(self.local_wire_peer());
        }

        let mut pending = FuturesUnordered::new();
        let mut deadline = Delay::new(self.cfg.query_deadline).fuse();

        loop {
            if self.lookup_done(&kind, &outcome, &lookup) {
                break;
            }
            for peer in lookup.next_batch() {
                let kad = self.clone();
                let msg = request.clone();
                pending.push(async move {
                    let res = kad.request(&peer, msg).await;
                    (peer, res)
                });
            }
            if pending.is_empty() {
                break;
            }
            select! {
                item = pending.next() => {
                    let (peer, res) = match item {
                        Some(item) => item,
                        None => break,
                    };
                    match res {
                        Ok(reply) => self.absorb_reply(&kind, &mut outcome, &mut lookup, peer, reply),
                        Err(e) => {
                            trace!("kad: request to {} failed: {}", peer, e);
                            lookup.on_failure(&peer);
                        }
                    }
                }
                _ = deadline => {
                    debug!("kad: lookup hit the deadline");
                    break;
                }
            }
        }
        outcome.k_closest = lookup.k_closest();
        outcome
    }

    fn absorb_reply(
        self: &Arc<Self>,
        kind: &LookupKind,
        outcome: &mut LookupOutcome,
        lookup: &mut IterativeLookup,
        from: PeerId,
        reply: Message,
    ) {
        let mut closer_ids = Vec::new();
        for wire_peer in reply.closer_peers {
            // unreachable entries are dropped outright
            if let Some(info) = wire_peer.into_reachable_info() {
                if info.id == self.host.peer_id() {
                    continue;
                }
                if let LookupKind::FindNode { target_peer } = kind {
                    if info.id == *target_peer {
                        outcome.found_peer = Some(info.clone());
                    }
                }
                closer_ids.push(info.id);
                self.add_peer(&info, false);
            }
        }
        match kind {
            LookupKind::Providers { .. } => {
                for wire_peer in reply.provider_peers {
                    if let Some(info) = wire_peer.into_reachable_info() {
                        if !outcome.providers.iter().any(|p| p.id == info.id) {
                            outcome.providers.push(info);
                        }
                    }
                }
            }
            LookupKind::Value { .. } => {
                if let Some(record) = reply.record {
                    outcome.records.push((from, record.value));
                }
            }
            _ => {}
        }
        lookup.on_response(&from, closer_ids);
    }

    fn lookup_done(
        &self,
        kind: &LookupKind,
        outcome: &LookupOutcome,
        lookup: &IterativeLookup,
    ) -> bool {
        match kind {
            LookupKind::FindNode { .. } => {
                outcome.found_peer.is_some() || lookup.is_exhausted()
            }
            LookupKind::Closest => lookup.is_exhausted(),
            LookupKind::Providers { limit } => {
                outcome.providers.len() >= *limit || lookup.is_exhausted()
            }
            LookupKind::Value { quorum } => {
                outcome.records.len() >= *quorum || lookup.is_exhausted()
            }
        }
    }

    // ------------------------------------------------------------------
    // client plumbing

    async fn request(self: &Arc<Self>, peer: &PeerId, message: Message) -> Result<Message> {
        let (mut stream, _) = self
            .host
            .new_stream(peer, &[self.cfg.protocol_id.clone()])
            .await?;
        let bytes = message.encode_to_vec();
        let reply = scheduler::timeout(self.cfg.request_timeout, async {
            framing::write_frame(&mut stream, &bytes).await?;
            framing::read_frame(&mut stream, framing::MAX_DATA_FRAME).await
        })
        .await??;
        let _ = stream.close().await;
        let reply = Message::decode(&reply[..]).wrapped(ErrorKind::ProtocolError)?;
        if reply.r#type != message.r#type {
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                "unexpected response message type",
            ));
        }
        Ok(reply)
    }

    /// Sends a message that expects no response (ADD_PROVIDER).
    async fn send_only(self: &Arc<Self>, peer: &PeerId, message: Message) -> Result<()> {
        let (mut stream, _) = self
            .host
            .new_stream(peer, &[self.cfg.protocol_id.clone()])
            .await?;
        let bytes = message.encode_to_vec();
        scheduler::timeout(self.cfg.request_timeout, async {
            framing::write_frame(&mut stream, &bytes).await?;
            stream.close().await.map_err(Error::from)
        })
        .await??;
        Ok(())
    }

    fn local_wire_peer(&self) -> WirePeer {
        WirePeer::from_info(
            &self.host.local_info(),
            crate::p2p::network::Connectedness::Connected,
        )
    }

    // ------------------------------------------------------------------
    // server side

    async fn serve_stream(
        self: &Arc<Self>,
        mut stream: Substream,
        ctx: &StreamContext,
    ) -> Result<()> {
        let frame = scheduler::timeout(
            self.cfg.request_timeout,
            framing::read_frame(&mut stream, framing::MAX_DATA_FRAME),
        )
        .await??;
        let message = Message::decode(&frame[..]).wrapped(ErrorKind::ProtocolError)?;
        let message_type = message
            .message_type()
            .ok_or_else(|| Error::wrapped(ErrorKind::ProtocolError, "unknown message type"))?;
        trace!("kad: {:?} request from {}", message_type, ctx.peer);

        // callers may announce themselves in closer_peers
        for wire_peer in &message.closer_peers {
            if let Some(info) = wire_peer.clone().into_reachable_info() {
                if info.id == ctx.peer {
                    self.add_peer(&info, false);
                }
            }
        }

        let reply = match message_type {
            MessageType::FindNode => Some(self.on_find_node(&message)),
            MessageType::GetValue => Some(self.on_get_value(&message)),
            MessageType::PutValue => self.on_put_value(message)?,
            MessageType::GetProviders => Some(self.on_get_providers(&message)),
            MessageType::AddProvider => {
                self.on_add_provider(message, ctx);
                None
            }
            MessageType::Ping => Some(message),
        };
        if let Some(reply) = reply {
            framing::write_frame(&mut stream, &reply.encode_to_vec()).await?;
        }
        stream.close().await?;
        Ok(())
    }

    fn closer_peers_for(&self, key: &[u8]) -> Vec<WirePeer> {
        let target = sha256(key);
        let nearest = self.table.lock().nearest_peers(&target, self.cfg.k);
        let mut out = Vec::new();
        for peer in nearest {
            let info = self.host.peerstore().get_peer_info(&peer);
            // entries without dialable addresses help nobody
            if info.addresses.is_empty() {
                continue;
            }
            let connectedness = self.host.connections().connectedness(&info);
            out.push(WirePeer::from_info(&info, connectedness));
        }
        out
    }

    fn on_find_node(&self, message: &Message) -> Message {
        let mut reply = Message::new(MessageType::FindNode, message.key.clone());
        reply.closer_peers = self.closer_peers_for(&message.key);
        reply
    }

    fn on_get_value(&self, message: &Message) -> Message {
        let mut reply = Message::new(MessageType::GetValue, message.key.clone());
        if let Some(value) = self.values.lock().get(&message.key) {
            reply.record = Some(Record {
                key: message.key.clone(),
                value,
                time_received: String::new(),
            });
        }
        reply.closer_peers = self.closer_peers_for(&message.key);
        reply
    }

    fn on_put_value(&self, message: Message) -> Result<Option<Message>> {
        let record = match &message.record {
            Some(record) => record,
            None => {
                return Err(Error::wrapped(
                    ErrorKind::ProtocolError,
                    "PUT_VALUE without a record",
                ))
            }
        };
        self.validator.validate(&message.key, &record.value)?;
        self.values
            .lock()
            .put(message.key.clone(), record.value.clone());
        // the stored record is echoed back
        Ok(Some(message))
    }

    fn on_get_providers(&self, message: &Message) -> Message {
        let mut reply = Message::new(MessageType::GetProviders, message.key.clone());
        for peer in self.providers.lock().get(&message.key) {
            let info = self.host.peerstore().get_peer_info(&peer);
            let connectedness = self.host.connections().connectedness(&info);
            reply.provider_peers.push(WirePeer::from_info(&info, connectedness));
        }
        reply.closer_peers = self.closer_peers_for(&message.key);
        reply
    }

    fn on_add_provider(&self, message: Message, ctx: &StreamContext) {
        for wire_peer in message.provider_peers {
            let info = match wire_peer.into_info() {
                Some(info) => info,
                None => continue,
            };
            // peers may only announce themselves
            if info.id != ctx.peer {
                warn!("kad: {} tried to announce {} as provider", ctx.peer, info.id);
                continue;
            }
            if !info.addresses.is_empty() {
                self.host
                    .peerstore()
                    .upsert_addresses(&info.id, &info.addresses, AddressTtl::Day);
            }
            self.providers.lock().add(&message.key, info.id);
            trace!("kad: {} provides {:02x?}", info.id, &message.key);
        }
    }

    // ------------------------------------------------------------------
    // periodic maintenance

    fn spawn_random_walk(self: &Arc<Self>, walk: RandomWalkConfig) {
        let weak: Weak<Kademlia> = Arc::downgrade(self);
        let handle = self
            .host
            .scheduler()
            .schedule_repeating(walk.interval, move || {
                let kad = match weak.upgrade() {
                    Some(kad) => kad,
                    None => return,
                };
                for i in 0..walk.queries_per_period {
                    let kad = kad.clone();
                    let pause = walk.delay * i as u32;
                    rt::spawn(async move {
                        Delay::new(pause).await;
                        let target = PeerId::random();
                        trace!("kad: random walk towards {}", target);
                        let _ = kad.find_peer(&target).await;
                    });
                }
            });
        self.handles.lock().push(handle);
    }

    fn spawn_re_announce(self: &Arc<Self>) {
        let weak: Weak<Kademlia> = Arc::downgrade(self);
        let handle = self
            .host
            .scheduler()
            .schedule_repeating(self.cfg.re_announce_interval, move || {
                let kad = match weak.upgrade() {
                    Some(kad) => kad,
                    None => return,
                };
                let keys: Vec<Vec<u8>> = kad.provided_keys.lock().iter().cloned().collect();
                for key in keys {
                    let kad = kad.clone();
                    rt::spawn(async move {
                        if let Err(e) = kad.announce_provider(&key).await {
                            trace!("kad: re-announce failed: {}", e);
                        }
                    });
                }
            });
        self.handles.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::crypto::signature::KeyPair;
    use crate::p2p::host::HostConfig;

    async fn kad_host() -> (Arc<Host>, Arc<Kademlia>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = Host::new(KeyPair::generate().unwrap(), HostConfig::default());
        host.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        host.start();
        let cfg = KademliaConfig {
            request_timeout: Duration::from_secs(5),
            query_deadline: Duration::from_secs(20),
            ..KademliaConfig::default()
        };
        let kad = Kademlia::new(host.clone(), cfg);
        kad.start();
        (host, kad)
    }

    fn seed(kad: &Arc<Kademlia>, host: &Arc<Host>) {
        kad.add_peer(&host.local_info(), true);
    }

    #[test]
    fn test_put_get_value_between_two_nodes() {
        let runtime = rt::build(4).unwrap();
        runtime.block_on(async {
            let (host_a, kad_a) = kad_host().await;
            let (host_b, kad_b) = kad_host().await;
            seed(&kad_a, &host_b);
            seed(&kad_b, &host_a);

            kad_a.put_value(b"the-key", b"the-value".to_vec()).await.unwrap();
            let got = kad_b.get_value(b"the-key").await.unwrap();
            assert_eq!(got, b"the-value".to_vec());

            kad_a.stop();
            kad_b.stop();
            host_a.stop().await;
            host_b.stop().await;
        });
    }

    #[test]
    fn test_provide_and_find_providers() {
        let runtime = rt::build(4).unwrap();
        runtime.block_on(async {
            let (host_a, kad_a) = kad_host().await;
            let (host_b, kad_b) = kad_host().await;
            let (host_c, kad_c) = kad_host().await;
            // a ring of knowledge: a knows b, b knows c, c knows a
            seed(&kad_a, &host_b);
            seed(&kad_b, &host_c);
            seed(&kad_c, &host_a);

            kad_a.provide(b"content", true).await.unwrap();
            let providers = kad_b.find_providers(b"content", 4).await.unwrap();
            assert!(
                providers.iter().any(|p| p.id == host_a.peer_id()),
                "provider not found in {:?}",
                providers
            );

            kad_a.stop();
            kad_b.stop();
            kad_c.stop();
            host_a.stop().await;
            host_b.stop().await;
            host_c.stop().await;
        });
    }

    #[test]
    fn test_find_peer_in_six_node_ring() {
        let runtime = rt::build(8).unwrap();
        runtime.block_on(async {
            let mut nodes = Vec::new();
            for _ in 0..6 {
                nodes.push(kad_host().await);
            }
            // node i starts out knowing only its predecessor
            for i in 0..6 {
                let prev = (i + 5) % 6;
                let info = nodes[prev].0.local_info();
                nodes[i].1.add_peer(&info, true);
            }

            for i in 0..6 {
                let target = nodes[(i + 3) % 6].0.peer_id();
                let found = nodes[i].1.find_peer(&target).await.unwrap();
                assert_eq!(found.id, target);
            }

            // lookups taught every node most of the ring
            for (host, kad) in &nodes {
                assert!(
                    kad.routing_table_len() >= 4,
                    "node {} knows only {} peers",
                    host.peer_id(),
                    kad.routing_table_len()
                );
            }

            for (host, kad) in &nodes {
                kad.stop();
                host.stop().await;
            }
        });
    }

    #[test]
    fn test_finished_background_tasks_are_reaped() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (host, kad) = kad_host().await;
            for _ in 0..32 {
                kad.track_task(rt::spawn(async {}));
            }
            Delay::new(Duration::from_millis(50)).await;
            kad.track_task(rt::spawn(async {}));
            // only the long-lived event listener and the fresh task
            // may remain
            assert!(
                kad.tasks.lock().len() <= 2,
                "finished tasks were kept around"
            );
            kad.stop();
            host.stop().await;
        });
    }

    #[test]
    fn test_get_value_repairs_divergent_peers() {
        let runtime = rt::build(4).unwrap();
        runtime.block_on(async {
            let (host_a, kad_a) = kad_host().await;
            let (host_b, kad_b) = kad_host().await;
            seed(&kad_a, &host_b);
            seed(&kad_b, &host_a);

            // b holds a divergent value for the key
            kad_b.values.lock().put(b"k".to_vec(), b"stale".to_vec());
            // a holds the value that the default validator selects
            kad_a.values.lock().put(b"k".to_vec(), b"fresh".to_vec());

            let got = kad_a.get_value(b"k").await.unwrap();
            assert_eq!(got, b"fresh".to_vec());

            // the repair eventually overwrites b's copy
            let mut repaired = Vec::new();
            for _ in 0..100 {
                if let Some(v) = kad_b.values.lock().get(b"k") {
                    repaired = v;
                    if repaired == b"fresh".to_vec() {
                        break;
                    }
                }
                Delay::new(Duration::from_millis(20)).await;
            }
            assert_eq!(repaired, b"fresh".to_vec());

            kad_a.stop();
            kad_b.stop();
            host_a.stop().await;
            host_b.stop().await;
        });
    }
}
