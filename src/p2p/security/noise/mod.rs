//! The Noise XX handshake and transport cipher.
//!
//! Pattern `Noise_XX_25519_ChaChaPoly_SHA256`, three messages:
//! `-> e`, `<- e ee s es`, `-> s se`. Each side proves ownership of
//! its libp2p identity key by signing the literal prefix
//! `noise-libp2p-static-key:` concatenated with its Noise static
//! public key, and ships key and signature in the handshake payload
//! (the responder in message two, the initiator in message three).
//! After the handshake, traffic travels in frames of a two byte
//! big-endian length followed by AEAD ciphertext.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::{debug, trace};
use prost::Message;
use snow::{Builder, HandshakeState, TransportState};

use crate::p2p::crypto::keys;
use crate::p2p::crypto::signature::{KeyPair, PublicKey, Signature};
use crate::p2p::error::*;
use crate::p2p::peer::PeerId;

const PARAMS: &str = "Noise_XX_25519_ChaChaPoly_SHA256";

const PAYLOAD_PREFIX: &[u8] = b"noise-libp2p-static-key:";

/// Largest noise frame on the wire.
pub const MAX_FRAME_LEN: usize = 65535;

const TAG_LEN: usize = 16;

/// Largest plaintext packed into one frame.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

// handshake messages are far smaller than data frames
const HANDSHAKE_BUF_LEN: usize = 1024;

/// Identity proof carried inside the handshake.
#[derive(Clone, PartialEq, ::prost::Message)]
struct HandshakePayload {
    #[prost(bytes = "vec", tag = "1")]
    identity_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    identity_sig: Vec<u8>,
}

fn new_handshake(local_key: &KeyPair, initiator: bool) -> Result<(HandshakeState, Vec<u8>)> {
    let params = PARAMS
        .parse()
        .simple_msg(ErrorKind::InternalError, "bad noise parameter string")?;
    let builder = Builder::new(params);
    let static_keys = builder
        .generate_keypair()
        .wrapped(ErrorKind::HandshakeFailed)?;

    // sign "noise-libp2p-static-key:" || static public key
    let mut to_sign = Vec::with_capacity(PAYLOAD_PREFIX.len() + static_keys.public.len());
    to_sign.extend_from_slice(PAYLOAD_PREFIX);
    to_sign.extend_from_slice(&static_keys.public);
    let payload = HandshakePayload {
        identity_key: keys::encode_public_key(&local_key.public_key()),
        identity_sig: local_key.sign(&to_sign).as_ref().to_vec(),
    }
    .encode_to_vec();

    let builder = builder.local_private_key(&static_keys.private);
    let state = if initiator {
        builder.build_initiator()
    } else {
        builder.build_responder()
    }
    .wrapped(ErrorKind::HandshakeFailed)?;
    Ok((state, payload))
}

async fn send_handshake_frame<C>(
    io: &mut C,
    state: &mut HandshakeState,
    payload: &[u8],
) -> Result<()>
where
    C: AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_BUF_LEN];
    let n = state
        .write_message(payload, &mut buf[..])
        .wrapped(ErrorKind::HandshakeFailed)?;
    let prefix = (n as u16).to_be_bytes();
    io.write_all(&prefix[..]).await?;
    io.write_all(&buf[..n]).await?;
    io.flush().await?;
    Ok(())
}

async fn recv_handshake_frame<C>(io: &mut C, state: &mut HandshakeState) -> Result<Vec<u8>>
where
    C: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 2];
    io.read_exact(&mut prefix[..]).await?;
    let len = u16::from_be_bytes(prefix) as usize;
    let mut frame = vec![0u8; len];
    io.read_exact(&mut frame[..]).await?;
    let mut buf = vec![0u8; len.max(HANDSHAKE_BUF_LEN)];
    let n = state
        .read_message(&frame, &mut buf[..])
        .wrapped(ErrorKind::HandshakeFailed)?;
    buf.truncate(n);
    Ok(buf)
}

/// Checks the remote handshake payload against the Noise static key
/// the handshake observed, returning the authenticated identity key.
fn verify_remote_payload(
    state: &HandshakeState,
    payload: &[u8],
    expected_peer: Option<&PeerId>,
) -> Result<PublicKey> {
    let payload =
        HandshakePayload::decode(payload).wrapped(ErrorKind::ProtocolError)?;
    let identity_key = keys::decode_public_key(&payload.identity_key)
        .map_err(|e| e.swap_kind(ErrorKind::PeerVerifyFailed))?;
    let remote_id = PeerId::from_public_key(&identity_key);
    if let Some(expected) = expected_peer {
        if *expected != remote_id {
            debug!(
                "noise: dialed {} but authenticated {}",
                expected, remote_id
            );
            return Err(Error::simple(ErrorKind::UnexpectedPeerId));
        }
    }
    let remote_static = state
        .get_remote_static()
        .ok_or_else(|| Error::simple(ErrorKind::InternalError))?;
    let mut to_verify = Vec::with_capacity(PAYLOAD_PREFIX.len() + remote_static.len());
    to_verify.extend_from_slice(PAYLOAD_PREFIX);
    to_verify.extend_from_slice(remote_static);
    let sig = Signature::from_bytes(&payload.identity_sig)?;
    identity_key.verify(&to_verify, &sig)?;
    Ok(identity_key)
}

/// Runs the initiator side of the XX handshake.
pub async fn handshake_outbound<C>(
    mut io: C,
    local_key: &KeyPair,
    expected_peer: Option<PeerId>,
) -> Result<(NoiseStream<C>, PublicKey)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut state, payload) = new_handshake(local_key, true)?;

    trace!("noise: outgoing connection, stage 0");
    send_handshake_frame(&mut io, &mut state, &[]).await?;

    trace!("noise: outgoing connection, stage 1");
    let remote_payload = recv_handshake_frame(&mut io, &mut state).await?;
    let remote_key = verify_remote_payload(&state, &remote_payload, expected_peer.as_ref())?;

    trace!("noise: outgoing connection, stage 2");
    send_handshake_frame(&mut io, &mut state, &payload).await?;

    let session = state
        .into_transport_mode()
        .wrapped(ErrorKind::HandshakeFailed)?;
    Ok((NoiseStream::new(io, session), remote_key))
}

/// Runs the responder side of the XX handshake.
pub async fn handshake_inbound<C>(
    mut io: C,
    local_key: &KeyPair,
) -> Result<(NoiseStream<C>, PublicKey)>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let (mut state, payload) = new_handshake(local_key, false)?;

    trace!("noise: incoming connection, stage 0");
    let first = recv_handshake_frame(&mut io, &mut state).await?;
    if !first.is_empty() {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            "unexpected payload in the first noise message",
        ));
    }

    trace!("noise: incoming connection, stage 1");
    send_handshake_frame(&mut io, &mut state, &payload).await?;

    trace!("noise: incoming connection, stage 2");
    let remote_payload = recv_handshake_frame(&mut io, &mut state).await?;
    let remote_key = verify_remote_payload(&state, &remote_payload, None)?;

    let session = state
        .into_transport_mode()
        .wrapped(ErrorKind::HandshakeFailed)?;
    Ok((NoiseStream::new(io, session), remote_key))
}

#[derive(Debug)]
enum ReadState {
    Prefix,
    Body { expected: usize },
}

/// Encrypted byte pipe left behind by a completed handshake.
///
/// Each direction owns a cipher state with its own nonce counter
/// inside the snow session; nonce exhaustion surfaces as a cipher
/// error and closes the connection, rekeying is not attempted.
#[derive(Debug)]
pub struct NoiseStream<C> {
    io: C,
    session: TransportState,
    read_state: ReadState,
    prefix: [u8; 2],
    prefix_off: usize,
    frame: Vec<u8>,
    frame_off: usize,
    decrypted: Vec<u8>,
    decrypted_off: usize,
    pending_write: Vec<u8>,
    pending_off: usize,
}

impl<C> NoiseStream<C> {
    fn new(io: C, session: TransportState) -> Self {
        Self {
            io,
            session,
            read_state: ReadState::Prefix,
            prefix: [0; 2],
            prefix_off: 0,
            frame: Vec::new(),
            frame_off: 0,
            decrypted: Vec::new(),
            decrypted_off: 0,
            pending_write: Vec::new(),
            pending_off: 0,
        }
    }
}

impl<C> NoiseStream<C>
where
    C: AsyncWrite + Unpin,
{
    /// Pushes buffered wire bytes down to the transport.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_off < self.pending_write.len() {
            let n = futures::ready!(Pin::new(&mut self.io)
                .poll_write(cx, &self.pending_write[self.pending_off..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_off += n;
        }
        self.pending_write.clear();
        self.pending_off = 0;
        Poll::Ready(Ok(()))
    }
}

impl<C> AsyncRead for NoiseStream<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            // serve decrypted bytes first
            if this.decrypted_off < this.decrypted.len() {
                let n = buf.len().min(this.decrypted.len() - this.decrypted_off);
                buf[..n].copy_from_slice(&this.decrypted[this.decrypted_off..this.decrypted_off + n]);
                this.decrypted_off += n;
                return Poll::Ready(Ok(n));
            }
            match this.read_state {
                ReadState::Prefix => {
                    while this.prefix_off < 2 {
                        let n = futures::ready!(Pin::new(&mut this.io)
                            .poll_read(cx, &mut this.prefix[this.prefix_off..2]))?;
                        if n == 0 {
                            if this.prefix_off == 0 {
                                // clean end of stream between frames
                                return Poll::Ready(Ok(0));
                            }
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.prefix_off += n;
                    }
                    let expected = u16::from_be_bytes(this.prefix) as usize;
                    this.prefix_off = 0;
                    this.frame.resize(expected, 0);
                    this.frame_off = 0;
                    this.read_state = ReadState::Body { expected };
                }
                ReadState::Body { expected } => {
                    while this.frame_off < expected {
                        let n = futures::ready!(Pin::new(&mut this.io)
                            .poll_read(cx, &mut this.frame[this.frame_off..expected]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                        }
                        this.frame_off += n;
                    }
                    this.decrypted.resize(expected, 0);
                    let n = this
                        .session
                        .read_message(&this.frame[..expected], &mut this.decrypted[..])
                        .map_err(|e| {
                            io::Error::new(io::ErrorKind::InvalidData, e.to_string())
                        })?;
                    this.decrypted.truncate(n);
                    this.decrypted_off = 0;
                    this.read_state = ReadState::Prefix;
                }
            }
        }
    }
}

impl<C> AsyncWrite for NoiseStream<C>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain(cx))?;

        let chunk = buf.len().min(MAX_PLAINTEXT_LEN);
        let mut cipher = vec![0u8; chunk + TAG_LEN];
        let n = this
            .session
            .write_message(&buf[..chunk], &mut cipher[..])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        this.pending_write.clear();
        this.pending_off = 0;
        this.pending_write
            .extend_from_slice(&(n as u16).to_be_bytes()[..]);
        this.pending_write.extend_from_slice(&cipher[..n]);

        // opportunistically push the frame out; leftovers drain on the
        // next write or flush
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(chunk))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        futures::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.io).poll_close(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::async_runtime as rt;
    use crate::p2p::transport::TcpTransport;

    async fn tcp_pair() -> (
        crate::p2p::transport::RawConnection,
        crate::p2p::transport::RawConnection,
    ) {
        let transport = TcpTransport::default();
        let listener = transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().clone();
        let accept = rt::spawn(async move { listener.accept().await.unwrap() });
        let dialer = transport.dial(&addr).await.unwrap();
        (dialer, accept.await.unwrap())
    }

    #[test]
    fn test_handshake_authenticates_both_sides() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let client_key = KeyPair::generate().unwrap();
            let server_key = KeyPair::generate().unwrap();
            let server_id = PeerId::from_public_key(&server_key.public_key());
            let client_id = PeerId::from_public_key(&client_key.public_key());

            let (client_io, server_io) = tcp_pair().await;
            let skey = server_key.clone();
            let server = rt::spawn(async move {
                let (_stream, pk) = handshake_inbound(server_io, &skey).await.unwrap();
                PeerId::from_public_key(&pk)
            });
            let (_stream, pk) =
                handshake_outbound(client_io, &client_key, Some(server_id)).await.unwrap();
            assert_eq!(PeerId::from_public_key(&pk), server_id);
            assert_eq!(server.await.unwrap(), client_id);
        });
    }

    #[test]
    fn test_unexpected_peer_id_rejected() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let client_key = KeyPair::generate().unwrap();
            let server_key = KeyPair::generate().unwrap();
            let wrong = PeerId::random();

            let (client_io, server_io) = tcp_pair().await;
            rt::spawn(async move {
                let _ = handshake_inbound(server_io, &server_key).await;
            });
            let err = handshake_outbound(client_io, &client_key, Some(wrong))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnexpectedPeerId);
        });
    }

    #[test]
    fn test_transport_roundtrip() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let client_key = KeyPair::generate().unwrap();
            let server_key = KeyPair::generate().unwrap();

            let (client_io, server_io) = tcp_pair().await;
            let skey = server_key.clone();
            let server = rt::spawn(async move {
                let (mut stream, _) = handshake_inbound(server_io, &skey).await.unwrap();
                let mut buf = vec![0u8; 70000];
                stream.read_exact(&mut buf[..]).await.unwrap();
                stream.write_all(&buf[..]).await.unwrap();
                stream.flush().await.unwrap();
            });

            let (mut stream, _) =
                handshake_outbound(client_io, &client_key, None).await.unwrap();
            // larger than one noise frame, forces fragmentation
            let payload: Vec<u8> = (0..70000u32).map(|i| (i % 251) as u8).collect();
            stream.write_all(&payload[..]).await.unwrap();
            stream.flush().await.unwrap();
            let mut echoed = vec![0u8; payload.len()];
            stream.read_exact(&mut echoed[..]).await.unwrap();
            assert_eq!(echoed, payload);
            server.await.unwrap();
        });
    }
}
