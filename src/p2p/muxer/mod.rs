//! Stream multiplexers: many logical streams over one secure
//! connection.
//!
//! Yamux is the primary muxer, mplex the alternate. Both follow the
//! same ownership discipline: a connection actor owns the socket and
//! the stream map, stream handles own nothing but a frame channel and
//! a piece of shared state, and closing the connection poisons every
//! stream. Which muxer runs on a connection is decided by
//! multistream-select during the upgrade.

pub mod mplex;
pub mod yamux;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite};
use futures::{FutureExt, StreamExt};

use crate::p2p::error::*;
use crate::p2p::multiselect::ProtocolId;

pub const YAMUX_PROTOCOL_ID: &str = "/yamux/1.0.0";
pub const MPLEX_PROTOCOL_ID: &str = "/mplex/6.7.0";

/// Initial per-stream receive window, per the yamux specification.
pub const DEFAULT_WINDOW: u32 = 256 * 1024;

/// Limits enforced by a muxed connection. Limits, not targets: the
/// excess is rejected, never queued.
#[derive(Clone, Debug)]
pub struct MuxerConfig {
    /// Reject new streams past this many live ones.
    pub maximum_streams: usize,
    /// Upper bound for per-stream receive windows (yamux) and receive
    /// buffers (mplex).
    pub maximum_window_size: u32,
    /// Close the connection after it has carried no streams for this
    /// long. `None` disables the idle reaper.
    pub no_streams_interval: Option<Duration>,
    /// Connection keep-alive ping period. `None` disables pings.
    pub keep_alive_interval: Option<Duration>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            maximum_streams: 1000,
            maximum_window_size: DEFAULT_WINDOW,
            no_streams_interval: Some(Duration::from_secs(180)),
            keep_alive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// The muxer variants a host may offer.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MuxerSelection {
    Yamux,
    Mplex,
}

impl MuxerSelection {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            MuxerSelection::Yamux => YAMUX_PROTOCOL_ID.to_string(),
            MuxerSelection::Mplex => MPLEX_PROTOCOL_ID.to_string(),
        }
    }

    pub fn from_protocol_id(id: &str) -> Option<MuxerSelection> {
        match id {
            YAMUX_PROTOCOL_ID => Some(MuxerSelection::Yamux),
            MPLEX_PROTOCOL_ID => Some(MuxerSelection::Mplex),
            _ => None,
        }
    }
}

/// A logical stream, whichever muxer carries it.
#[derive(Debug)]
pub enum Substream {
    Yamux(yamux::Stream),
    Mplex(mplex::Stream),
}

impl Substream {
    pub fn id(&self) -> u32 {
        match self {
            Substream::Yamux(s) => s.id(),
            Substream::Mplex(s) => s.id(),
        }
    }

    /// Hard-closes both directions.
    pub fn reset(&mut self) {
        match self {
            Substream::Yamux(s) => s.reset(),
            Substream::Mplex(s) => s.reset(),
        }
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Substream::Yamux(s) => Pin::new(s).poll_read(cx, buf),
            Substream::Mplex(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Substream::Yamux(s) => Pin::new(s).poll_write(cx, buf),
            Substream::Mplex(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Substream::Yamux(s) => Pin::new(s).poll_flush(cx),
            Substream::Mplex(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Substream::Yamux(s) => Pin::new(s).poll_close(cx),
            Substream::Mplex(s) => Pin::new(s).poll_close(cx),
        }
    }
}

/// Clonable handle for opening streams and closing the connection.
#[derive(Clone)]
pub enum MuxControl {
    Yamux(yamux::Control),
    Mplex(mplex::Control),
}

impl MuxControl {
    pub async fn open_stream(&self) -> Result<Substream> {
        match self {
            MuxControl::Yamux(c) => Ok(Substream::Yamux(c.open_stream().await?)),
            MuxControl::Mplex(c) => Ok(Substream::Mplex(c.open_stream().await?)),
        }
    }

    /// Closes the muxed connection. Idempotent: closing an already
    /// closed connection reports success without any effect.
    pub async fn close(&self) -> Result<()> {
        match self {
            MuxControl::Yamux(c) => c.close().await,
            MuxControl::Mplex(c) => c.close().await,
        }
    }
}

/// Inbound streams accepted by the connection actor.
pub enum InboundStreams {
    Yamux(mpsc::UnboundedReceiver<yamux::Stream>),
    Mplex(mpsc::UnboundedReceiver<mplex::Stream>),
}

impl InboundStreams {
    /// The next stream the remote opened, or `None` once the
    /// connection is gone.
    pub async fn next(&mut self) -> Option<Substream> {
        match self {
            InboundStreams::Yamux(rx) => rx.next().await.map(Substream::Yamux),
            InboundStreams::Mplex(rx) => rx.next().await.map(Substream::Mplex),
        }
    }
}

/// A muxed connection ready to be wired up: a control handle, the
/// inbound stream source and the actor future the host must spawn.
/// The actor resolves to the error that ended the connection, `None`
/// on a local close.
pub struct Muxed {
    pub control: MuxControl,
    pub inbound: InboundStreams,
    pub task: BoxFuture<'static, Option<Error>>,
}

/// Upgrades a secured byte pipe into a muxed connection.
pub fn upgrade<C>(io: C, selection: MuxerSelection, cfg: MuxerConfig, initiator: bool) -> Muxed
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match selection {
        MuxerSelection::Yamux => {
            let mode = if initiator {
                yamux::Mode::Client
            } else {
                yamux::Mode::Server
            };
            let (conn, control, inbound) = yamux::Connection::new(io, cfg, mode);
            Muxed {
                control: MuxControl::Yamux(control),
                inbound: InboundStreams::Yamux(inbound),
                task: conn.run().boxed(),
            }
        }
        MuxerSelection::Mplex => {
            let (conn, control, inbound) = mplex::Connection::new(io, cfg, initiator);
            Muxed {
                control: MuxControl::Mplex(control),
                inbound: InboundStreams::Mplex(inbound),
                task: conn.run().boxed(),
            }
        }
    }
}
