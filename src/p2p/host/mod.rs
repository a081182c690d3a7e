//! The host binds a local identity to listeners and outbound dials,
//! upgrades raw connections through the secure channel and the stream
//! multiplexer, and routes accepted streams to protocol handlers.
//!
//! Dial pipeline: pick or establish a raw connection, negotiate a
//! secure channel over it, negotiate a muxer over that, register the
//! muxed connection with the connection manager and spawn its actor.
//! Inbound connections travel the same pipeline mirrored.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, trace, warn};
use multiaddr::Multiaddr;
use parking_lot::Mutex;

use crate::p2p::async_runtime as rt;
use crate::p2p::crypto::signature::{KeyPair, PublicKey};
use crate::p2p::error::*;
use crate::p2p::identify;
use crate::p2p::multiselect::{self, ProtocolId};
use crate::p2p::muxer::{self, Muxed, MuxerConfig, MuxerSelection, Substream};
use crate::p2p::network::{ConnectionManager, ManagedConnection};
use crate::p2p::observed::ObservedAddresses;
use crate::p2p::peer::{PeerId, PeerInfo};
use crate::p2p::peerstore::{AddressTtl, PeerStore};
use crate::p2p::scheduler::Scheduler;
use crate::p2p::security::{SecureConnection, SecurityAdaptor};
use crate::p2p::transport::{self, TcpTransport};

/// What a protocol handler learns about the stream it was handed.
#[derive(Clone, Debug)]
pub struct StreamContext {
    pub peer: PeerId,
    pub local_addr: Multiaddr,
    pub remote_addr: Multiaddr,
    /// Whether the local side dialed the underlying connection.
    pub initiator: bool,
}

/// An async callback invoked with every accepted stream of its
/// protocol.
pub type StreamHandler =
    Arc<dyn Fn(Substream, StreamContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Construction-time host configuration. No global injector: whoever
/// builds the host decides everything here.
#[derive(Clone)]
pub struct HostConfig {
    /// Secure channels to offer, in preference order.
    pub security: Vec<SecurityAdaptor>,
    /// Muxers to offer, in preference order.
    pub muxers: Vec<MuxerSelection>,
    pub muxer: MuxerConfig,
    pub transport: TcpTransport,
    /// Require the multistream handshake before the first proposal.
    pub strict_multistream: bool,
    /// Run the identify exchange on every new connection.
    pub enable_identify: bool,
    /// How often expired peerstore entries are collected.
    pub gc_interval: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            security: vec![SecurityAdaptor::Noise],
            muxers: vec![MuxerSelection::Yamux, MuxerSelection::Mplex],
            muxer: MuxerConfig::default(),
            transport: TcpTransport::default(),
            strict_multistream: true,
            enable_identify: true,
            gc_interval: Duration::from_secs(60),
        }
    }
}

/// A libp2p-style host: identity, listeners, dialer, router.
pub struct Host {
    keypair: KeyPair,
    peer_id: PeerId,
    cfg: HostConfig,
    peerstore: Arc<PeerStore>,
    connections: Arc<ConnectionManager>,
    observed: Arc<ObservedAddresses>,
    scheduler: Scheduler,
    router: Mutex<BTreeMap<ProtocolId, StreamHandler>>,
    listen_addrs: Mutex<Vec<Multiaddr>>,
    pending_listeners: Mutex<Vec<transport::Listener>>,
    tasks: Mutex<Vec<rt::JoinHandle<()>>>,
    gc_handle: Mutex<Option<crate::p2p::scheduler::Handle>>,
    started: AtomicBool,
}

impl Host {
    pub fn new(keypair: KeyPair, cfg: HostConfig) -> Arc<Host> {
        let peer_id = PeerId::from_public_key(&keypair.public_key());
        let peerstore = Arc::new(PeerStore::new());
        peerstore.add_local_keypair(keypair.clone());
        Arc::new(Host {
            keypair,
            peer_id,
            cfg,
            peerstore,
            connections: Arc::new(ConnectionManager::new()),
            observed: Arc::new(ObservedAddresses::new()),
            scheduler: Scheduler::new(),
            router: Mutex::new(BTreeMap::new()),
            listen_addrs: Mutex::new(Vec::new()),
            pending_listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            gc_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub(crate) fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn peerstore(&self) -> &Arc<PeerStore> {
        &self.peerstore
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn observed_addresses(&self) -> &Arc<ObservedAddresses> {
        &self.observed
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// The addresses we are reachable on: bound listeners plus
    /// confirmed externally observed addresses.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        let mut addrs = self.listen_addrs.lock().clone();
        for addr in self.observed.all_confirmed() {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        addrs
    }

    /// Our own id and reachable addresses.
    pub fn local_info(&self) -> PeerInfo {
        PeerInfo::with_addresses(self.peer_id, self.listen_addrs())
    }

    /// Registers `handler` for streams negotiated to `protocol`.
    pub fn set_protocol_handler<F>(&self, protocol: &str, handler: F)
    where
        F: Fn(Substream, StreamContext) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        self.router
            .lock()
            .insert(protocol.to_string(), Arc::new(handler));
    }

    pub fn remove_protocol_handler(&self, protocol: &str) {
        self.router.lock().remove(protocol);
    }

    /// The protocols the router currently answers for.
    pub fn registered_protocols(&self) -> Vec<ProtocolId> {
        self.router.lock().keys().cloned().collect()
    }

    fn handler_for(&self, protocol: &str) -> Option<StreamHandler> {
        self.router.lock().get(protocol).cloned()
    }

    /// Binds a listener. With port 0 the chosen port shows up in
    /// `listen_addrs` right away.
    pub async fn listen(self: &Arc<Self>, addr: &Multiaddr) -> Result<()> {
        let listener = self.cfg.transport.listen(addr).await?;
        info!("host {}: listening on {}", self.peer_id, listener.local_addr());
        self.listen_addrs.lock().push(listener.local_addr().clone());
        if self.started.load(Ordering::SeqCst) {
            self.spawn_accept_loop(listener);
        } else {
            self.pending_listeners.lock().push(listener);
        }
        Ok(())
    }

    /// Starts accept loops and background maintenance.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.cfg.enable_identify {
            identify::register(self);
        }
        for listener in self.pending_listeners.lock().drain(..) {
            self.spawn_accept_loop(listener);
        }
        let peerstore = self.peerstore.clone();
        let handle = self.scheduler.schedule_repeating(self.cfg.gc_interval, move || {
            peerstore.collect_garbage();
        });
        *self.gc_handle.lock() = Some(handle);
    }

    /// Closes every connection and stops the accept loops.
    pub async fn stop(&self) {
        if let Some(mut handle) = self.gc_handle.lock().take() {
            handle.cancel();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        for peer in self.connections.connected_peers() {
            for conn in self.connections.get_connections(&peer) {
                let _ = conn.close().await;
            }
        }
    }

    fn spawn_accept_loop(self: &Arc<Self>, listener: transport::Listener) {
        let host = self.clone();
        let task = rt::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(raw) => {
                        let host = host.clone();
                        rt::spawn(async move {
                            if let Err(e) = host.upgrade_inbound(raw).await {
                                debug!("host: inbound upgrade failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("host: accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Opens a stream to `peer` and negotiates one of `protocols`.
    pub async fn new_stream(
        self: &Arc<Self>,
        peer: &PeerId,
        protocols: &[ProtocolId],
    ) -> Result<(Substream, ProtocolId)> {
        let conn = self.connect(peer).await?;
        self.open_stream_on(&conn, protocols).await
    }

    /// Like [`Host::new_stream`], seeding the peerstore with the
    /// addresses carried by `info` first.
    pub async fn new_stream_to_info(
        self: &Arc<Self>,
        info: &PeerInfo,
        protocols: &[ProtocolId],
    ) -> Result<(Substream, ProtocolId)> {
        if !info.addresses.is_empty() {
            self.peerstore
                .upsert_addresses(&info.id, &info.addresses, AddressTtl::Transient);
        }
        self.new_stream(&info.id, protocols).await
    }

    /// Returns the best existing connection to `peer`, dialing one if
    /// none is alive.
    pub async fn connect(self: &Arc<Self>, peer: &PeerId) -> Result<ManagedConnection> {
        if let Some(conn) = self.connections.get_best_connection(peer) {
            return Ok(conn);
        }
        self.dial(peer).await
    }

    /// Opens a logical stream on `conn` and runs the protocol
    /// selector as initiator.
    pub async fn open_stream_on(
        &self,
        conn: &ManagedConnection,
        protocols: &[ProtocolId],
    ) -> Result<(Substream, ProtocolId)> {
        let mut stream = conn.control.open_stream().await?;
        match multiselect::select_outbound(&mut stream, protocols).await {
            Ok(chosen) => Ok((stream, chosen)),
            Err(e) => {
                stream.reset();
                Err(e)
            }
        }
    }

    async fn dial(self: &Arc<Self>, peer: &PeerId) -> Result<ManagedConnection> {
        if self.connections.is_banned(peer) {
            return Err(Error::wrapped(
                ErrorKind::ConnectionClosedByHost,
                "peer is temporarily banned",
            ));
        }
        let addrs = self.peerstore.get_addresses(peer);
        if addrs.is_empty() {
            return Err(Error::simple(ErrorKind::PeerNotFound));
        }
        let mut last_err = Error::simple(ErrorKind::PeerNotFound);
        // attempts are sequential, in address preference order
        for addr in addrs {
            let (addr, _) = transport::split_peer_id(&addr);
            if !self.cfg.transport.supports(&addr) {
                continue;
            }
            trace!("host {}: dialing {} at {}", self.peer_id, peer, addr);
            match self.dial_addr(peer, &addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!("host: dial {} failed: {}", addr, e);
                    let retriable = e.is_retriable_dial();
                    last_err = e;
                    if !retriable {
                        // identity mismatch: do not try this peer's
                        // other addresses either
                        break;
                    }
                }
            }
        }
        self.connections.note_dial_failure(peer);
        if last_err.kind() == ErrorKind::ProtocolError {
            self.connections.ban(peer);
        }
        Err(last_err)
    }

    async fn dial_addr(
        self: &Arc<Self>,
        peer: &PeerId,
        addr: &Multiaddr,
    ) -> Result<ManagedConnection> {
        let raw = self.cfg.transport.dial(addr).await?;
        self.upgrade_outbound(raw, *peer).await
    }

    async fn upgrade_outbound(
        self: &Arc<Self>,
        mut raw: transport::RawConnection,
        peer: PeerId,
    ) -> Result<ManagedConnection> {
        let security_ids: Vec<ProtocolId> =
            self.cfg.security.iter().map(|s| s.protocol_id()).collect();
        let chosen = multiselect::select_outbound(&mut raw, &security_ids).await?;
        let adaptor = SecurityAdaptor::from_protocol_id(&chosen)
            .ok_or_else(|| Error::simple(ErrorKind::InternalError))?;
        let secured = adaptor
            .secure_outbound(raw, &self.keypair, Some(peer))
            .await?;
        self.upgrade_muxer(secured, true).await
    }

    async fn upgrade_inbound(
        self: &Arc<Self>,
        mut raw: transport::RawConnection,
    ) -> Result<ManagedConnection> {
        let security_ids: Vec<ProtocolId> =
            self.cfg.security.iter().map(|s| s.protocol_id()).collect();
        let chosen =
            multiselect::select_inbound(&mut raw, &security_ids, self.cfg.strict_multistream)
                .await?;
        let adaptor = SecurityAdaptor::from_protocol_id(&chosen)
            .ok_or_else(|| Error::simple(ErrorKind::InternalError))?;
        let secured = adaptor.secure_inbound(raw, &self.keypair).await?;
        if self.connections.is_banned(&secured.remote_peer()) {
            return Err(Error::wrapped(
                ErrorKind::ConnectionClosedByHost,
                "banned peer dialed in",
            ));
        }
        self.upgrade_muxer(secured, false).await
    }

    async fn upgrade_muxer(
        self: &Arc<Self>,
        mut secured: SecureConnection,
        initiator: bool,
    ) -> Result<ManagedConnection> {
        let muxer_ids: Vec<ProtocolId> =
            self.cfg.muxers.iter().map(|m| m.protocol_id()).collect();
        let chosen = if initiator {
            multiselect::select_outbound(&mut secured, &muxer_ids).await?
        } else {
            multiselect::select_inbound(&mut secured, &muxer_ids, self.cfg.strict_multistream)
                .await?
        };
        let selection = MuxerSelection::from_protocol_id(&chosen)
            .ok_or_else(|| Error::simple(ErrorKind::InternalError))?;
        Ok(self.finish_connection(secured, selection, initiator))
    }

    /// Registers the muxed connection, spawns its actor and the
    /// inbound stream router, and kicks off identify.
    fn finish_connection(
        self: &Arc<Self>,
        secured: SecureConnection,
        selection: MuxerSelection,
        initiator: bool,
    ) -> ManagedConnection {
        let peer = secured.remote_peer();
        let remote_key = secured.remote_public_key().clone();
        let local_addr = secured.local_addr().clone();
        let remote_addr = secured.remote_addr().clone();

        self.peerstore.add_public_key(&peer, remote_key);
        if initiator {
            self.peerstore.upsert_addresses(
                &peer,
                &[remote_addr.clone()],
                AddressTtl::RecentlyConnected,
            );
        }

        let Muxed {
            control,
            mut inbound,
            task,
        } = muxer::upgrade(secured, selection, self.cfg.muxer.clone(), initiator);
        let conn = self.connections.add(
            peer,
            control,
            local_addr.clone(),
            remote_addr.clone(),
            initiator,
        );
        info!(
            "host {}: connection {} to {} via {:?}",
            self.peer_id, conn.id, peer, selection
        );

        // the actor; the close event fires exactly when it stops, and
        // a protocol violation earns the peer a temporary ban
        let manager = self.connections.clone();
        let conn_id = conn.id;
        rt::spawn(async move {
            if let Some(e) = task.await {
                if e.is_fatal_for_connection() {
                    debug!("host: connection {} to {} died: {}", conn_id, peer, e);
                }
                if e.kind() == ErrorKind::ProtocolError {
                    manager.ban(&peer);
                }
            }
            manager.on_connection_closed(&peer, conn_id);
        });

        // inbound stream router; holds only a weak host reference so
        // a forgotten connection cannot keep the host alive
        let weak: Weak<Host> = Arc::downgrade(self);
        let ctx = StreamContext {
            peer,
            local_addr,
            remote_addr,
            initiator,
        };
        let conn_for_streams = conn.clone();
        rt::spawn(async move {
            while let Some(stream) = inbound.next().await {
                let host = match weak.upgrade() {
                    Some(host) => host,
                    None => break,
                };
                host.route_inbound(stream, ctx.clone(), conn_for_streams.clone());
            }
        });

        if self.cfg.enable_identify {
            let host = self.clone();
            let conn_handle = conn.clone();
            rt::spawn(async move {
                if let Err(e) = identify::pull(&host, &conn_handle).await {
                    debug!("identify with {} failed: {}", conn_handle.peer, e);
                }
            });
        }
        conn
    }

    fn route_inbound(
        self: Arc<Self>,
        mut stream: Substream,
        ctx: StreamContext,
        conn: ManagedConnection,
    ) {
        rt::spawn(async move {
            let protocols = self.registered_protocols();
            match multiselect::select_inbound(&mut stream, &protocols, self.cfg.strict_multistream)
                .await
            {
                Ok(protocol) => match self.handler_for(&protocol) {
                    Some(handler) => handler(stream, ctx).await,
                    None => stream.reset(),
                },
                Err(e) => {
                    trace!("host: inbound negotiation failed: {}", e);
                    stream.reset();
                    // a selector violation poisons the connection, not
                    // just the stream
                    if e.kind() == ErrorKind::ProtocolError {
                        self.connections.ban(&ctx.peer);
                        let _ = conn.close().await;
                    }
                }
            }
        });
    }
}
