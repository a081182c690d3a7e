//! The plaintext "secure" channel: an identity exchange with no
//! encryption at all.
//!
//! Both sides send one varint-framed protobuf carrying their peer id
//! and public key, then the raw connection continues unchanged. Only
//! suitable for tests and trusted wiring; it exists to keep the
//! `{Noise, TLS, Plaintext}` seam honest.

use futures::io::{AsyncRead, AsyncWrite};
use prost::Message;

use crate::p2p::crypto::keys::{self, PublicKeyRecord};
use crate::p2p::crypto::signature::{KeyPair, PublicKey};
use crate::p2p::error::*;
use crate::p2p::framing;
use crate::p2p::peer::PeerId;

#[derive(Clone, PartialEq, ::prost::Message)]
struct Exchange {
    #[prost(bytes = "vec", tag = "1")]
    id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pubkey: Option<PublicKeyRecord>,
}

/// Runs the exchange on both ends; symmetric apart from the expected
/// peer check.
pub async fn exchange<C>(
    mut io: C,
    local_key: &KeyPair,
    expected_peer: Option<PeerId>,
) -> Result<(C, PublicKey)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let local_id = PeerId::from_public_key(&local_key.public_key());
    let ours = Exchange {
        id: local_id.to_bytes(),
        pubkey: Some(PublicKeyRecord {
            key_type: keys::KeyType::Ed25519 as i32,
            data: local_key.public_key().as_ref().to_vec(),
        }),
    };
    framing::write_frame(&mut io, &ours.encode_to_vec()).await?;

    let frame = framing::read_frame(&mut io, framing::MAX_CONTROL_FRAME).await?;
    let theirs = Exchange::decode(&frame[..]).wrapped(ErrorKind::ProtocolError)?;
    let record = theirs
        .pubkey
        .ok_or_else(|| Error::wrapped(ErrorKind::PeerVerifyFailed, "exchange without a key"))?;
    let public_key = match keys::KeyType::try_from(record.key_type) {
        Ok(keys::KeyType::Ed25519) => PublicKey::from_bytes(&record.data)
            .map_err(|e| e.swap_kind(ErrorKind::PeerVerifyFailed))?,
        _ => {
            return Err(Error::wrapped(
                ErrorKind::PeerVerifyFailed,
                "unsupported key type in exchange",
            ))
        }
    };

    let derived = PeerId::from_public_key(&public_key);
    let claimed = PeerId::from_bytes(&theirs.id)?;
    if claimed != derived {
        return Err(Error::wrapped(
            ErrorKind::InvalidPeerId,
            "claimed peer id does not match the exchanged key",
        ));
    }
    if let Some(expected) = expected_peer {
        if expected != derived {
            return Err(Error::simple(ErrorKind::UnexpectedPeerId));
        }
    }
    Ok((io, public_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::async_runtime as rt;
    use crate::p2p::transport::TcpTransport;

    #[test]
    fn test_exchange_learns_identity() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let a_key = KeyPair::generate().unwrap();
            let b_key = KeyPair::generate().unwrap();
            let a_id = PeerId::from_public_key(&a_key.public_key());
            let b_id = PeerId::from_public_key(&b_key.public_key());

            let transport = TcpTransport::default();
            let listener = transport
                .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
                .await
                .unwrap();
            let addr = listener.local_addr().clone();
            let server = rt::spawn(async move {
                let conn = listener.accept().await.unwrap();
                let (_io, pk) = exchange(conn, &b_key, None).await.unwrap();
                PeerId::from_public_key(&pk)
            });
            let conn = transport.dial(&addr).await.unwrap();
            let (_io, pk) = exchange(conn, &a_key, Some(b_id)).await.unwrap();
            assert_eq!(PeerId::from_public_key(&pk), b_id);
            assert_eq!(server.await.unwrap(), a_id);
        });
    }

    #[test]
    fn test_exchange_rejects_wrong_peer() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let a_key = KeyPair::generate().unwrap();
            let b_key = KeyPair::generate().unwrap();

            let transport = TcpTransport::default();
            let listener = transport
                .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
                .await
                .unwrap();
            let addr = listener.local_addr().clone();
            rt::spawn(async move {
                let conn = listener.accept().await.unwrap();
                let _ = exchange(conn, &b_key, None).await;
            });
            let conn = transport.dial(&addr).await.unwrap();
            let err = exchange(conn, &a_key, Some(PeerId::random()))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnexpectedPeerId);
        });
    }
}
