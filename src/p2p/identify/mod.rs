//! The identify protocol: peers exchange identity, listen addresses
//! and supported protocols right after connecting.
//!
//! Each side opens one `/ipfs/id/1.0.0` stream on a fresh connection;
//! the responder writes a single protobuf message and closes. The
//! puller verifies that the embedded public key matches the peer it
//! authenticated, then feeds the peerstore and the observed-address
//! accumulator.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::io::AsyncWriteExt;
use futures::FutureExt;
use log::{debug, trace};
use multiaddr::Multiaddr;
use prost::Message;

use crate::p2p::crypto::keys;
use crate::p2p::error::*;
use crate::p2p::framing;
use crate::p2p::host::{Host, StreamContext};
use crate::p2p::muxer::Substream;
use crate::p2p::network::ManagedConnection;
use crate::p2p::peer::PeerId;
use crate::p2p::peerstore::AddressTtl;
use crate::p2p::scheduler;

pub const IDENTIFY_PROTOCOL_ID: &str = "/ipfs/id/1.0.0";

const PROTOCOL_VERSION: &str = "ipfs/0.1.0";
const AGENT_VERSION: &str = concat!("hyphae/", env!("CARGO_PKG_VERSION"));

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, PartialEq, ::prost::Message)]
struct IdentifyMessage {
    #[prost(bytes = "vec", tag = "1")]
    public_key: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    listen_addrs: Vec<Vec<u8>>,
    #[prost(string, repeated, tag = "3")]
    protocols: Vec<String>,
    #[prost(bytes = "vec", tag = "4")]
    observed_addr: Vec<u8>,
    #[prost(string, tag = "5")]
    protocol_version: String,
    #[prost(string, tag = "6")]
    agent_version: String,
}

fn build_message(host: &Host, remote_addr: &Multiaddr) -> IdentifyMessage {
    IdentifyMessage {
        public_key: keys::encode_public_key(&host.public_key()),
        listen_addrs: host.listen_addrs().iter().map(|a| a.to_vec()).collect(),
        protocols: host.registered_protocols(),
        observed_addr: remote_addr.to_vec(),
        protocol_version: PROTOCOL_VERSION.to_string(),
        agent_version: AGENT_VERSION.to_string(),
    }
}

/// Installs the responder side on the host's router.
pub fn register(host: &Arc<Host>) {
    let weak: Weak<Host> = Arc::downgrade(host);
    host.set_protocol_handler(IDENTIFY_PROTOCOL_ID, move |stream, ctx| {
        let weak = weak.clone();
        async move {
            let host = match weak.upgrade() {
                Some(host) => host,
                None => return,
            };
            if let Err(e) = respond(&host, stream, &ctx).await {
                debug!("identify: responding to {} failed: {}", ctx.peer, e);
            }
        }
        .boxed()
    });
}

async fn respond(host: &Arc<Host>, mut stream: Substream, ctx: &StreamContext) -> Result<()> {
    let message = build_message(host, &ctx.remote_addr);
    framing::write_frame(&mut stream, &message.encode_to_vec()).await?;
    stream.close().await?;
    Ok(())
}

/// Pulls the remote's identify message over `conn` and folds it into
/// the host's books.
pub async fn pull(host: &Arc<Host>, conn: &ManagedConnection) -> Result<()> {
    let (mut stream, _) = host
        .open_stream_on(conn, &[IDENTIFY_PROTOCOL_ID.to_string()])
        .await?;
    let frame = scheduler::timeout(
        EXCHANGE_TIMEOUT,
        framing::read_frame(&mut stream, framing::MAX_CONTROL_FRAME),
    )
    .await??;
    let message = IdentifyMessage::decode(&frame[..]).wrapped(ErrorKind::ProtocolError)?;
    process(host, conn, message)
}

fn process(host: &Arc<Host>, conn: &ManagedConnection, message: IdentifyMessage) -> Result<()> {
    // the advertised key must be the one the secure channel saw
    let public_key = keys::decode_public_key(&message.public_key)
        .map_err(|e| e.swap_kind(ErrorKind::PeerVerifyFailed))?;
    let derived = PeerId::from_public_key(&public_key);
    if derived != conn.peer {
        return Err(Error::wrapped(
            ErrorKind::PeerVerifyFailed,
            "identify public key does not match the connection peer",
        ));
    }
    trace!(
        "identify: {} runs {} ({} protocols)",
        conn.peer,
        message.agent_version,
        message.protocols.len()
    );

    host.peerstore().add_protocols(&conn.peer, &message.protocols);

    let listen_addrs: Vec<Multiaddr> = message
        .listen_addrs
        .into_iter()
        .filter_map(|raw| Multiaddr::try_from(raw).ok())
        .collect();
    if !listen_addrs.is_empty() {
        let ttl = if host.connections().get_best_connection(&conn.peer).is_some() {
            AddressTtl::Permanent
        } else {
            AddressTtl::RecentlyConnected
        };
        host.peerstore()
            .upsert_addresses(&conn.peer, &listen_addrs, ttl);
    }

    if let Ok(observed) = Multiaddr::try_from(message.observed_addr) {
        // the remote reports how it saw us dial in; it is the
        // connection initiator exactly when we are not
        host.observed_addresses().add(
            &conn.local_addr,
            observed,
            conn.peer,
            !conn.initiator,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::async_runtime as rt;
    use crate::p2p::host::HostConfig;
    use futures_timer::Delay;

    async fn test_host() -> Arc<Host> {
        let keypair = crate::p2p::crypto::signature::KeyPair::generate().unwrap();
        let host = Host::new(keypair, HostConfig::default());
        host.listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        host.start();
        host
    }

    #[test]
    fn test_observed_address_confirmed_after_four_dialers() {
        let runtime = rt::build(4).unwrap();
        runtime.block_on(async {
            let a = test_host().await;
            let a_info = a.local_info();
            let listener = a_info.addresses[0].clone();

            let mut dialers = Vec::new();
            for _ in 0..4 {
                let b = test_host().await;
                b.peerstore().upsert_addresses(
                    &a_info.id,
                    &a_info.addresses,
                    crate::p2p::peerstore::AddressTtl::Transient,
                );
                b.connect(&a_info.id).await.unwrap();
                dialers.push(b);
            }

            // identify pulls run in the background on both sides
            let mut confirmed = Vec::new();
            for _ in 0..100 {
                confirmed = a.observed_addresses().confirmed(&listener);
                if !confirmed.is_empty() {
                    break;
                }
                Delay::new(Duration::from_millis(20)).await;
            }
            assert_eq!(confirmed, vec![listener]);

            for b in &dialers {
                b.stop().await;
            }
            a.stop().await;
        });
    }

    #[test]
    fn test_identify_rejects_foreign_key() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let a = test_host().await;
            let b = test_host().await;
            let a_info = a.local_info();
            b.peerstore().upsert_addresses(
                &a_info.id,
                &a_info.addresses,
                crate::p2p::peerstore::AddressTtl::Transient,
            );
            let conn = b.connect(&a_info.id).await.unwrap();

            // a message carrying a key that derives a different id
            let foreign = crate::p2p::crypto::signature::KeyPair::generate().unwrap();
            let message = IdentifyMessage {
                public_key: keys::encode_public_key(&foreign.public_key()),
                listen_addrs: Vec::new(),
                protocols: Vec::new(),
                observed_addr: Vec::new(),
                protocol_version: PROTOCOL_VERSION.to_string(),
                agent_version: AGENT_VERSION.to_string(),
            };
            let err = process(&b, &conn, message).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PeerVerifyFailed);

            b.stop().await;
            a.stop().await;
        });
    }
}
