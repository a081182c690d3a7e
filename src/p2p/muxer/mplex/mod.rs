//! The mplex stream multiplexer.
//!
//! A far simpler scheme than yamux: frames are
//! `varint((stream_id << 3) | flag) ++ varint(length) ++ payload`,
//! there is no flow control, and backpressure is whatever TCP
//! provides. Streams are identified by the id their initiator chose
//! plus the direction, since both sides number independently. The
//! connection actor shape matches the yamux one.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use bytes::BytesMut;
use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;
use log::{debug, trace};
use parking_lot::Mutex;

use super::MuxerConfig;
use crate::p2p::async_runtime as rt;
use crate::p2p::error::*;
use crate::p2p::framing;

// one mplex message may carry at most this much
const MAX_MSG_LEN: usize = 1024 * 1024;

// largest chunk a single message frame carries
const MAX_CHUNK: usize = 16 * 1024;

mod flag {
    pub const NEW_STREAM: u64 = 0;
    pub const MSG_RECEIVER: u64 = 1;
    pub const MSG_INITIATOR: u64 = 2;
    pub const CLOSE_RECEIVER: u64 = 3;
    pub const CLOSE_INITIATOR: u64 = 4;
    pub const RESET_RECEIVER: u64 = 5;
    pub const RESET_INITIATOR: u64 = 6;
}

struct Frame {
    stream_id: u32,
    flag: u64,
    payload: Vec<u8>,
}

async fn read_frame<R>(io: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let header = framing::read_uvarint(io).await?;
    let flag = header & 0x07;
    let stream_id = (header >> 3) as u32;
    if flag > flag::RESET_INITIATOR {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            format!("unknown mplex flag {}", flag),
        ));
    }
    let len = framing::read_uvarint(io).await? as usize;
    if len > MAX_MSG_LEN {
        return Err(Error::wrapped(
            ErrorKind::ProtocolError,
            format!("mplex message of {} bytes exceeds cap", len),
        ));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload[..]).await?;
    Ok(Frame {
        stream_id,
        flag,
        payload,
    })
}

async fn write_frame<W>(io: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(frame.payload.len() + 16);
    {
        let mut prefix = unsigned_varint::encode::u64_buffer();
        let header = (u64::from(frame.stream_id) << 3) | frame.flag;
        buf.extend_from_slice(unsigned_varint::encode::u64(header, &mut prefix));
    }
    framing::encode_frame(&frame.payload, &mut buf);
    io.write_all(&buf[..]).await?;
    io.flush().await?;
    Ok(())
}

/// State shared between a stream handle and the actor.
#[derive(Debug)]
struct Shared {
    read_closed: bool,
    write_closed: bool,
    reset: bool,
    buffer: BytesMut,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

impl Shared {
    fn new() -> Self {
        Self {
            read_closed: false,
            write_closed: false,
            reset: false,
            buffer: BytesMut::new(),
            reader: None,
            writer: None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.reset || (self.read_closed && self.write_closed && self.buffer.is_empty())
    }

    fn wake_all(&mut self) {
        if let Some(w) = self.reader.take() {
            w.wake();
        }
        if let Some(w) = self.writer.take() {
            w.wake();
        }
    }

    fn poison(&mut self) {
        self.reset = true;
        self.wake_all();
    }
}

// direction-qualified map key; both endpoints may use the same ids
fn key(id: u32, local: bool) -> u64 {
    (u64::from(id) << 1) | u64::from(local)
}

/// A bidirectional mplex stream.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    // whether the local side opened this stream
    local: bool,
    shared: Arc<Mutex<Shared>>,
    to_conn: mpsc::UnboundedSender<Frame>,
}

impl Stream {
    fn new(
        id: u32,
        local: bool,
        shared: Arc<Mutex<Shared>>,
        to_conn: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            id,
            local,
            shared,
            to_conn,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    fn msg_flag(&self) -> u64 {
        if self.local {
            flag::MSG_INITIATOR
        } else {
            flag::MSG_RECEIVER
        }
    }

    pub fn reset(&mut self) {
        let mut shared = self.shared.lock();
        if shared.reset || (shared.read_closed && shared.write_closed) {
            return;
        }
        shared.poison();
        drop(shared);
        let _ = self.to_conn.unbounded_send(Frame {
            stream_id: self.id,
            flag: if self.local {
                flag::RESET_INITIATOR
            } else {
                flag::RESET_RECEIVER
            },
            payload: Vec::new(),
        });
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock();
        if !shared.buffer.is_empty() {
            let n = buf.len().min(shared.buffer.len());
            buf[..n].copy_from_slice(&shared.buffer.split_to(n)[..]);
            return Poll::Ready(Ok(n));
        }
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if shared.read_closed {
            return Poll::Ready(Ok(0));
        }
        shared.reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        {
            let shared = this.shared.lock();
            if shared.reset {
                return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
            }
            if shared.write_closed {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let n = buf.len().min(MAX_CHUNK);
        this.to_conn
            .unbounded_send(Frame {
                stream_id: this.id,
                flag: this.msg_flag(),
                payload: buf[..n].to_vec(),
            })
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock();
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if shared.write_closed {
            return Poll::Ready(Ok(()));
        }
        shared.write_closed = true;
        drop(shared);
        let _ = this.to_conn.unbounded_send(Frame {
            stream_id: this.id,
            flag: if this.local {
                flag::CLOSE_INITIATOR
            } else {
                flag::CLOSE_RECEIVER
            },
            payload: Vec::new(),
        });
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.reset();
    }
}

enum ControlCommand {
    OpenStream(oneshot::Sender<Result<Stream>>),
    Close(oneshot::Sender<()>),
}

/// Clonable handle into the connection actor.
#[derive(Clone)]
pub struct Control {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl Control {
    pub async fn open_stream(&self) -> Result<Stream> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .unbounded_send(ControlCommand::OpenStream(reply))
            .simple(ErrorKind::ConnectionClosedByHost)?;
        rx.await.simple(ErrorKind::ConnectionClosedByHost)?
    }

    pub async fn close(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .unbounded_send(ControlCommand::Close(reply))
            .is_err()
        {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }
}

/// An mplex connection before its actor is spawned.
pub struct Connection<C> {
    io: C,
    inner: Inner,
    ctrl_rx: mpsc::UnboundedReceiver<ControlCommand>,
    frame_rx: mpsc::UnboundedReceiver<Frame>,
}

struct Inner {
    cfg: MuxerConfig,
    streams: HashMap<u64, Arc<Mutex<Shared>>>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    inbound_tx: mpsc::UnboundedSender<Stream>,
    next_id: u32,
    idle_for: Duration,
}

impl<C> Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        io: C,
        cfg: MuxerConfig,
        _initiator: bool,
    ) -> (Self, Control, mpsc::UnboundedReceiver<Stream>) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (frame_tx, frame_rx) = mpsc::unbounded();
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let inner = Inner {
            cfg,
            streams: HashMap::new(),
            frame_tx,
            inbound_tx,
            next_id: 0,
            idle_for: Duration::ZERO,
        };
        (
            Connection {
                io,
                inner,
                ctrl_rx,
                frame_rx,
            },
            Control { tx: ctrl_tx },
            inbound_rx,
        )
    }

    /// The connection actor. Returns the error that took the
    /// connection down, or `None` for a locally requested close.
    pub async fn run(self) -> Option<Error> {
        let Connection {
            io,
            mut inner,
            mut ctrl_rx,
            mut frame_rx,
        } = self;
        let (rd, mut wr) = io.split();

        let (wire_tx, mut wire_rx) = mpsc::unbounded();
        let reader = rt::spawn(async move {
            let mut rd = rd;
            loop {
                match read_frame(&mut rd).await {
                    Ok(f) => {
                        if wire_tx.unbounded_send(Ok(f)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = wire_tx.unbounded_send(Err(e));
                        break;
                    }
                }
            }
        });

        let tick_period = Duration::from_secs(30);

        let mut reason: Option<Error> = None;
        'main: loop {
            let mut tick = Delay::new(tick_period).fuse();
            select! {
                incoming = wire_rx.next() => match incoming {
                    Some(Ok(f)) => {
                        if let Err(e) = inner.on_wire_frame(f, &mut wr).await {
                            debug!("mplex: connection failed: {}", e);
                            reason = Some(e);
                            break 'main;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("mplex: socket read failed: {}", e);
                        reason = Some(e);
                        break 'main;
                    }
                    None => {
                        reason = Some(Error::simple(ErrorKind::ConnectionClosedByPeer));
                        break 'main;
                    }
                },
                outgoing = frame_rx.next() => match outgoing {
                    Some(f) => {
                        inner.note_outgoing(&f);
                        if let Err(e) = write_frame(&mut wr, &f).await {
                            debug!("mplex: socket write failed: {}", e);
                            reason = Some(e);
                            break 'main;
                        }
                    }
                    None => break 'main,
                },
                cmd = ctrl_rx.next() => match cmd {
                    Some(ControlCommand::OpenStream(reply)) => {
                        let res = inner.open_local_stream(&mut wr).await;
                        let _ = reply.send(res);
                    }
                    Some(ControlCommand::Close(reply)) => {
                        let _ = reply.send(());
                        break 'main;
                    }
                    None => break 'main,
                },
                _ = tick => {
                    if let Some(limit) = inner.cfg.no_streams_interval {
                        if inner.streams.is_empty() {
                            inner.idle_for += tick_period;
                            if inner.idle_for >= limit {
                                trace!("mplex: no streams for {:?}, closing", inner.idle_for);
                                break 'main;
                            }
                        } else {
                            inner.idle_for = Duration::ZERO;
                        }
                    }
                }
            }
        }

        reader.abort();
        let _ = wr.close().await;
        inner.teardown();
        trace!("mplex: connection actor done");
        reason
    }
}

impl Inner {
    async fn on_wire_frame<W>(&mut self, f: Frame, wr: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match f.flag {
            flag::NEW_STREAM => {
                // the stream name in the payload is ignored
                let k = key(f.stream_id, false);
                if self.streams.contains_key(&k) {
                    return Err(Error::wrapped(
                        ErrorKind::ProtocolError,
                        "duplicate NEW_STREAM id",
                    ));
                }
                if self.streams.len() >= self.cfg.maximum_streams {
                    trace!("mplex: rejecting inbound stream {}, at capacity", f.stream_id);
                    write_frame(
                        wr,
                        &Frame {
                            stream_id: f.stream_id,
                            flag: flag::RESET_RECEIVER,
                            payload: Vec::new(),
                        },
                    )
                    .await?;
                    return Ok(());
                }
                let shared = Arc::new(Mutex::new(Shared::new()));
                let handle =
                    Stream::new(f.stream_id, false, shared.clone(), self.frame_tx.clone());
                self.streams.insert(k, shared.clone());
                if self.inbound_tx.unbounded_send(handle).is_err() {
                    shared.lock().poison();
                    self.streams.remove(&k);
                }
                Ok(())
            }
            flag::MSG_INITIATOR | flag::MSG_RECEIVER => {
                // a message from the remote initiator lands on a stream
                // the remote opened, and vice versa
                let k = key(f.stream_id, f.flag == flag::MSG_RECEIVER);
                let shared = match self.streams.get(&k) {
                    Some(shared) => shared.clone(),
                    None => return Ok(()),
                };
                let over_cap = {
                    let mut s = shared.lock();
                    if s.buffer.len() + f.payload.len() > self.cfg.maximum_window_size as usize {
                        true
                    } else {
                        s.buffer.extend_from_slice(&f.payload);
                        if let Some(w) = s.reader.take() {
                            w.wake();
                        }
                        false
                    }
                };
                if over_cap {
                    trace!("mplex: stream {} overran its buffer, resetting", f.stream_id);
                    shared.lock().poison();
                    self.streams.remove(&k);
                    write_frame(
                        wr,
                        &Frame {
                            stream_id: f.stream_id,
                            flag: if f.flag == flag::MSG_RECEIVER {
                                flag::RESET_INITIATOR
                            } else {
                                flag::RESET_RECEIVER
                            },
                            payload: Vec::new(),
                        },
                    )
                    .await?;
                }
                Ok(())
            }
            flag::CLOSE_INITIATOR | flag::CLOSE_RECEIVER => {
                let k = key(f.stream_id, f.flag == flag::CLOSE_RECEIVER);
                if let Some(shared) = self.streams.get(&k) {
                    let mut s = shared.lock();
                    s.read_closed = true;
                    if let Some(w) = s.reader.take() {
                        w.wake();
                    }
                    let terminal = s.is_terminal();
                    drop(s);
                    if terminal {
                        self.streams.remove(&k);
                    }
                }
                Ok(())
            }
            flag::RESET_INITIATOR | flag::RESET_RECEIVER => {
                let k = key(f.stream_id, f.flag == flag::RESET_RECEIVER);
                if let Some(shared) = self.streams.remove(&k) {
                    shared.lock().poison();
                }
                Ok(())
            }
            other => Err(Error::wrapped(
                ErrorKind::ProtocolError,
                format!("unknown mplex flag {}", other),
            )),
        }
    }

    async fn open_local_stream<W>(&mut self, wr: &mut W) -> Result<Stream>
    where
        W: AsyncWrite + Unpin,
    {
        if self.streams.len() >= self.cfg.maximum_streams {
            return Err(Error::simple(ErrorKind::TooManyStreams));
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        let shared = Arc::new(Mutex::new(Shared::new()));
        self.streams.insert(key(id, true), shared.clone());
        write_frame(
            wr,
            &Frame {
                stream_id: id,
                flag: flag::NEW_STREAM,
                payload: Vec::new(),
            },
        )
        .await?;
        Ok(Stream::new(id, true, shared, self.frame_tx.clone()))
    }

    fn note_outgoing(&mut self, f: &Frame) {
        match f.flag {
            flag::RESET_INITIATOR | flag::RESET_RECEIVER => {
                let k = key(f.stream_id, f.flag == flag::RESET_INITIATOR);
                if let Some(shared) = self.streams.remove(&k) {
                    shared.lock().poison();
                }
            }
            flag::CLOSE_INITIATOR | flag::CLOSE_RECEIVER => {
                let k = key(f.stream_id, f.flag == flag::CLOSE_INITIATOR);
                let terminal = self
                    .streams
                    .get(&k)
                    .map(|shared| shared.lock().is_terminal())
                    .unwrap_or(false);
                if terminal {
                    self.streams.remove(&k);
                }
            }
            _ => {}
        }
    }

    fn teardown(&mut self) {
        for (_, shared) in self.streams.drain() {
            shared.lock().poison();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::muxer::{upgrade, MuxerSelection, Muxed};
    use crate::p2p::transport::TcpTransport;

    async fn muxed_pair() -> (
        crate::p2p::muxer::MuxControl,
        crate::p2p::muxer::InboundStreams,
        crate::p2p::muxer::MuxControl,
        crate::p2p::muxer::InboundStreams,
    ) {
        let transport = TcpTransport::default();
        let listener = transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().clone();
        let accept = rt::spawn(async move { listener.accept().await.unwrap() });
        let client_io = transport.dial(&addr).await.unwrap();
        let server_io = accept.await.unwrap();

        let Muxed {
            control: client_ctrl,
            inbound: client_in,
            task: client_task,
        } = upgrade(client_io, MuxerSelection::Mplex, MuxerConfig::default(), true);
        let Muxed {
            control: server_ctrl,
            inbound: server_in,
            task: server_task,
        } = upgrade(server_io, MuxerSelection::Mplex, MuxerConfig::default(), false);
        rt::spawn(client_task);
        rt::spawn(server_task);
        (client_ctrl, client_in, server_ctrl, server_in)
    }

    #[test]
    fn test_stream_roundtrip() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (client, _ci, _server, mut server_in) = muxed_pair().await;

            let echo = rt::spawn(async move {
                let mut stream = server_in.next().await.unwrap();
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await.unwrap();
                stream.write_all(&buf).await.unwrap();
                stream.close().await.unwrap();
            });

            let mut stream = client.open_stream().await.unwrap();
            stream.write_all(b"Hello").await.unwrap();
            stream.close().await.unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            assert_eq!(&buf, b"Hello");
            echo.await.unwrap();
        });
    }

    #[test]
    fn test_both_sides_may_use_the_same_ids() {
        let runtime = rt::build(2).unwrap();
        runtime.block_on(async {
            let (client, mut client_in, server, mut server_in) = muxed_pair().await;

            // both sides open their stream 0 simultaneously
            let mut a = client.open_stream().await.unwrap();
            let mut b = server.open_stream().await.unwrap();
            assert_eq!(a.id(), 0);
            assert_eq!(b.id(), 0);

            a.write_all(b"from-client").await.unwrap();
            b.write_all(b"from-server").await.unwrap();

            let mut sa = server_in.next().await.unwrap();
            let mut sb = client_in.next().await.unwrap();
            let mut buf = [0u8; 11];
            sa.read_exact(&mut buf[..]).await.unwrap();
            assert_eq!(&buf[..], b"from-client");
            sb.read_exact(&mut buf[..]).await.unwrap();
            assert_eq!(&buf[..], b"from-server");
        });
    }
}
