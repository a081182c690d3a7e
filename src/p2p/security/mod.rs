//! Secure channels over raw connections.
//!
//! The handshake authenticates the remote identity key and leaves an
//! encrypted byte pipe behind. Noise XX is the production channel;
//! plaintext exists for tests and loopback wiring and only performs
//! the identity exchange.

pub mod noise;
pub mod plaintext;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncWrite};
use multiaddr::Multiaddr;

use crate::p2p::crypto::signature::{KeyPair, PublicKey};
use crate::p2p::error::*;
use crate::p2p::multiselect::ProtocolId;
use crate::p2p::peer::PeerId;
use crate::p2p::transport::RawConnection;

pub const NOISE_PROTOCOL_ID: &str = "/noise";
pub const PLAINTEXT_PROTOCOL_ID: &str = "/plaintext/2.0.0";

/// The secure channel variants a host may offer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SecurityAdaptor {
    Noise,
    Plaintext,
}

enum SecureIo {
    Noise(noise::NoiseStream<RawConnection>),
    Plaintext(RawConnection),
}

/// An authenticated, possibly encrypted connection. Wraps the raw
/// connection and adds the remote identity learned in the handshake.
pub struct SecureConnection {
    io: SecureIo,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    initiator: bool,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
}

impl SecurityAdaptor {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            SecurityAdaptor::Noise => NOISE_PROTOCOL_ID.to_string(),
            SecurityAdaptor::Plaintext => PLAINTEXT_PROTOCOL_ID.to_string(),
        }
    }

    /// Looks an adaptor up by its negotiated protocol id.
    pub fn from_protocol_id(id: &str) -> Option<SecurityAdaptor> {
        match id {
            NOISE_PROTOCOL_ID => Some(SecurityAdaptor::Noise),
            PLAINTEXT_PROTOCOL_ID => Some(SecurityAdaptor::Plaintext),
            _ => None,
        }
    }

    /// Secures an outbound connection. When `expected_peer` is known,
    /// the authenticated identity must match it.
    pub async fn secure_outbound(
        &self,
        conn: RawConnection,
        local_key: &KeyPair,
        expected_peer: Option<PeerId>,
    ) -> Result<SecureConnection> {
        let local_addr = conn.local_addr().clone();
        let remote_addr = conn.remote_addr().clone();
        let (io, remote_public_key) = match self {
            SecurityAdaptor::Noise => {
                let (stream, pk) =
                    noise::handshake_outbound(conn, local_key, expected_peer).await?;
                (SecureIo::Noise(stream), pk)
            }
            SecurityAdaptor::Plaintext => {
                let (conn, pk) =
                    plaintext::exchange(conn, local_key, expected_peer).await?;
                (SecureIo::Plaintext(conn), pk)
            }
        };
        Ok(SecureConnection {
            io,
            local_addr,
            remote_addr,
            initiator: true,
            remote_peer: PeerId::from_public_key(&remote_public_key),
            remote_public_key,
        })
    }

    /// Secures an inbound connection. The remote identity is learned,
    /// not checked against anything.
    pub async fn secure_inbound(
        &self,
        conn: RawConnection,
        local_key: &KeyPair,
    ) -> Result<SecureConnection> {
        let local_addr = conn.local_addr().clone();
        let remote_addr = conn.remote_addr().clone();
        let (io, remote_public_key) = match self {
            SecurityAdaptor::Noise => {
                let (stream, pk) = noise::handshake_inbound(conn, local_key).await?;
                (SecureIo::Noise(stream), pk)
            }
            SecurityAdaptor::Plaintext => {
                let (conn, pk) = plaintext::exchange(conn, local_key, None).await?;
                (SecureIo::Plaintext(conn), pk)
            }
        };
        Ok(SecureConnection {
            io,
            local_addr,
            remote_addr,
            initiator: false,
            remote_peer: PeerId::from_public_key(&remote_public_key),
            remote_public_key,
        })
    }
}

impl SecureConnection {
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }
}

impl AsyncRead for SecureConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.io {
            SecureIo::Noise(s) => Pin::new(s).poll_read(cx, buf),
            SecureIo::Plaintext(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecureConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.io {
            SecureIo::Noise(s) => Pin::new(s).poll_write(cx, buf),
            SecureIo::Plaintext(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.io {
            SecureIo::Noise(s) => Pin::new(s).poll_flush(cx),
            SecureIo::Plaintext(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.io {
            SecureIo::Noise(s) => Pin::new(s).poll_close(cx),
            SecureIo::Plaintext(s) => Pin::new(s).poll_close(cx),
        }
    }
}
