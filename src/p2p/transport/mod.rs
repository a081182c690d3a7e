//! Raw transports: connect, listen, accept.
//!
//! A raw connection carries plain bytes between two multiaddresses and
//! knows nothing about identity or framing; the upgrade pipeline in
//! `host` turns it into a secure, multiplexed connection.

pub mod tcp;

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::io::{AsyncRead, AsyncWrite};
use multiaddr::{Multiaddr, Protocol};

use crate::p2p::error::*;
use crate::p2p::peer::PeerId;
use crate::p2p::scheduler;

/// Default per-attempt connect timeout.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A raw byte pipe with its endpoint addresses.
#[derive(Debug)]
pub struct RawConnection {
    io: tcp::Socket,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    initiator: bool,
}

/// A bound TCP listener producing raw connections.
pub struct Listener {
    inner: tcp::Listener,
    local_addr: Multiaddr,
}

/// The TCP transport. Dial timeouts apply per attempt.
#[derive(Clone)]
pub struct TcpTransport {
    pub connect_timeout: Duration,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl TcpTransport {
    /// Whether this transport can act on `addr`.
    pub fn supports(&self, addr: &Multiaddr) -> bool {
        multiaddr_to_socketaddr(addr).is_ok()
    }

    /// Connects to `addr`, bounded by the configured timeout.
    pub async fn dial(&self, addr: &Multiaddr) -> Result<RawConnection> {
        let sa = multiaddr_to_socketaddr(addr)?;
        let socket =
            scheduler::timeout(self.connect_timeout, tcp::connect(sa)).await??;
        let local = socket.local_addr()?;
        Ok(RawConnection {
            io: socket,
            local_addr: socketaddr_to_multiaddr(&local),
            remote_addr: socketaddr_to_multiaddr(&sa),
            initiator: true,
        })
    }

    /// Binds a listener on `addr`. Port 0 picks an ephemeral port,
    /// reflected in the returned listener's local address.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Listener> {
        let sa = multiaddr_to_socketaddr(addr)?;
        let inner = tcp::bind(sa).await?;
        let local = inner.local_addr()?;
        Ok(Listener {
            inner,
            local_addr: socketaddr_to_multiaddr(&local),
        })
    }
}

impl Listener {
    pub async fn accept(&self) -> Result<RawConnection> {
        let (socket, remote) = self.inner.accept().await?;
        Ok(RawConnection {
            io: socket,
            local_addr: self.local_addr.clone(),
            remote_addr: socketaddr_to_multiaddr(&remote),
            initiator: false,
        })
    }

    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }
}

impl RawConnection {
    pub fn local_addr(&self) -> &Multiaddr {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.remote_addr
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }
}

impl AsyncRead for RawConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for RawConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_close(cx)
    }
}

/// Extracts `ip+tcp` endpoints out of a multiaddress, ignoring a
/// trailing `/p2p/..` component.
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Result<SocketAddr> {
    let mut ip = None;
    let mut port = None;
    for proto in addr.iter() {
        match proto {
            Protocol::Ip4(a) => ip = Some(IpAddr::V4(a)),
            Protocol::Ip6(a) => ip = Some(IpAddr::V6(a)),
            Protocol::Tcp(p) => port = Some(p),
            Protocol::P2p(_) => {}
            other => {
                return Err(Error::wrapped(
                    ErrorKind::Io,
                    format!("unsupported multiaddr component {}", other),
                ))
            }
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(Error::wrapped(ErrorKind::Io, "address is not ip/tcp")),
    }
}

/// The inverse of [`multiaddr_to_socketaddr`].
pub fn socketaddr_to_multiaddr(sa: &SocketAddr) -> Multiaddr {
    let ip = match sa.ip() {
        IpAddr::V4(a) => Protocol::Ip4(a),
        IpAddr::V6(a) => Protocol::Ip6(a),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(sa.port()))
}

/// Splits a dial address into its transport part and the peer id it
/// may carry in a `/p2p/..` suffix.
pub fn split_peer_id(addr: &Multiaddr) -> (Multiaddr, Option<PeerId>) {
    let mut out = Multiaddr::empty();
    let mut peer = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2p(mh) => peer = PeerId::from_bytes(&mh.to_bytes()).ok(),
            other => out.push(other),
        }
    }
    (out, peer)
}

/// Whether two addresses use the same transport protocol stack,
/// disregarding the concrete endpoints.
pub fn same_transport(a: &Multiaddr, b: &Multiaddr) -> bool {
    let tags = |addr: &Multiaddr| {
        addr.iter()
            .filter(|p| !matches!(p, Protocol::P2p(_)))
            .map(|p| match p {
                Protocol::Ip4(_) | Protocol::Ip6(_) => "ip",
                Protocol::Tcp(_) => "tcp",
                Protocol::Udp(_) => "udp",
                _ => "other",
            })
            .collect::<Vec<_>>()
    };
    tags(a) == tags(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::async_runtime as rt;
    use futures::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_multiaddr_socketaddr_roundtrip() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let sa = multiaddr_to_socketaddr(&addr).unwrap();
        assert_eq!(sa.to_string(), "127.0.0.1:4001");
        assert_eq!(socketaddr_to_multiaddr(&sa), addr);
    }

    #[test]
    fn test_split_peer_id() {
        let id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/10.0.0.1/tcp/9000/p2p/{}", id)
            .parse()
            .unwrap();
        let (transport, peer) = split_peer_id(&addr);
        assert_eq!(transport.to_string(), "/ip4/10.0.0.1/tcp/9000");
        assert_eq!(peer, Some(id));
    }

    #[test]
    fn test_same_transport() {
        let a: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        let b: Multiaddr = "/ip4/5.6.7.8/tcp/99".parse().unwrap();
        let c: Multiaddr = "/ip4/1.2.3.4/udp/1".parse().unwrap();
        assert!(same_transport(&a, &b));
        assert!(!same_transport(&a, &c));
    }

    #[test]
    fn test_loopback_dial_accept() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let transport = TcpTransport::default();
            let listener = transport
                .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
                .await
                .unwrap();
            let dial_addr = listener.local_addr().clone();

            let server = rt::spawn(async move {
                let mut conn = listener.accept().await.unwrap();
                let mut buf = [0u8; 5];
                conn.read_exact(&mut buf[..]).await.unwrap();
                conn.write_all(&buf[..]).await.unwrap();
                conn.flush().await.unwrap();
            });

            let mut conn = transport.dial(&dial_addr).await.unwrap();
            assert!(conn.is_initiator());
            conn.write_all(b"Hello").await.unwrap();
            conn.flush().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf[..]).await.unwrap();
            assert_eq!(&buf[..], b"Hello");
            server.await.unwrap();
        });
    }
}
