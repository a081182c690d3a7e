//! The yamux stream multiplexer.
//!
//! One task per connection owns the socket and the stream map; stream
//! handles talk to it exclusively through channels. This one-way
//! ownership is what guarantees teardown: when the actor stops, every
//! stream is poisoned and woken, timers die with the actor, and no
//! strong reference cycle can keep the connection alive.

mod frame;
mod stream;

pub use frame::{flags, go_away, Frame, FrameType, HEADER_LEN};
pub use stream::Stream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures::{select, FutureExt, StreamExt};
use futures_timer::Delay;
use log::{debug, trace};
use parking_lot::Mutex;

use super::{MuxerConfig, DEFAULT_WINDOW};
use crate::p2p::async_runtime as rt;
use crate::p2p::error::*;
use stream::Shared;

/// Which side of the connection we are; decides stream id parity.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Dialed the connection; opens odd stream ids starting at 1.
    Client,
    /// Accepted the connection; opens even stream ids starting at 2.
    Server,
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

    /// Sends GO_AWAY and stops the actor. Already closed connections
    /// report success.
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

/// A yamux connection before its actor is spawned.
pub struct Connection<C> {
    io: C,
    inner: Inner,
    ctrl_rx: mpsc::UnboundedReceiver<ControlCommand>,
    frame_rx: mpsc::UnboundedReceiver<Frame>,
}

struct Inner {
    cfg: MuxerConfig,
    mode: Mode,
    streams: HashMap<u32, Arc<Mutex<Shared>>>,
    frame_tx: mpsc::UnboundedSender<Frame>,
    inbound_tx: mpsc::UnboundedSender<Stream>,
    next_id: u32,
    initial_window: u32,
    ping_counter: u32,
    idle_for: Duration,
}

impl<C> Connection<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Builds the connection state, returning the actor alongside the
    /// control handle and the inbound stream source.
    pub fn new(
        io: C,
        cfg: MuxerConfig,
        mode: Mode,
    ) -> (Self, Control, mpsc::UnboundedReceiver<Stream>) {
        let (ctrl_tx, ctrl_rx) = mpsc::unbounded();
        let (frame_tx, frame_rx) = mpsc::unbounded();
        let (inbound_tx, inbound_rx) = mpsc::unbounded();
        let initial_window = DEFAULT_WINDOW.min(cfg.maximum_window_size);
        let inner = Inner {
            cfg,
            mode,
            streams: HashMap::new(),
            frame_tx,
            inbound_tx,
            next_id: match mode {
                Mode::Client => 1,
                Mode::Server => 2,
            },
            initial_window,
            ping_counter: 0,
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

    /// The connection actor. Runs until the socket fails, the peer
    /// says GO_AWAY, or the control handle closes us.
    ///
    /// Returns the error that took the connection down, or `None` for
    /// a locally requested close. The host uses the kind to decide
    /// whether the peer earned a ban.
    pub async fn run(self) -> Option<Error> {
        let Connection {
            io,
            mut inner,
            mut ctrl_rx,
            mut frame_rx,
        } = self;
        let (rd, mut wr) = io.split();

        // socket reads happen on a helper task so the actor can select
        // over frames, stream writes and control commands at once
        let (wire_tx, mut wire_rx) = mpsc::unbounded();
        let reader = rt::spawn(async move {
            let mut rd = rd;
            loop {
                match frame::read_frame(&mut rd).await {
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

        let tick_period = inner
            .cfg
            .keep_alive_interval
            .unwrap_or(Duration::from_secs(30));

        let mut reason: Option<Error> = None;
        'main: loop {
            let mut tick = Delay::new(tick_period).fuse();
            select! {
                incoming = wire_rx.next() => match incoming {
                    Some(Ok(f)) => {
                        if let Err(e) = inner.on_wire_frame(f, &mut wr).await {
                            debug!("yamux: connection failed: {}", e);
                            reason = Some(e);
                            break 'main;
                        }
                    }
                    Some(Err(e)) => {
                        debug!("yamux: socket read failed: {}", e);
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
                        if let Err(e) = frame::write_frame(&mut wr, &f).await {
                            debug!("yamux: socket write failed: {}", e);
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
                        let _ = frame::write_frame(&mut wr, &Frame::go_away(go_away::NORMAL)).await;
                        let _ = reply.send(());
                        break 'main;
                    }
                    None => break 'main,
                },
                _ = tick => {
                    if inner.on_tick(&mut wr, tick_period).await.is_err() {
                        break 'main;
                    }
                }
            }
        }

        reader.abort();
        let _ = wr.close().await;
        inner.teardown();
        trace!("yamux: connection actor done");
        reason
    }
}

impl Inner {
    async fn on_wire_frame<W>(&mut self, f: Frame, wr: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        match f.ty {
            FrameType::Ping => {
                if f.has_flag(flags::SYN) {
                    frame::write_frame(wr, &Frame::ping(flags::ACK, f.length)).await?;
                }
                Ok(())
            }
            FrameType::GoAway => {
                trace!("yamux: peer went away, code {}", f.length);
                Err(Error::simple(ErrorKind::ConnectionClosedByPeer))
            }
            FrameType::Data | FrameType::WindowUpdate => self.on_stream_frame(f, wr).await,
        }
    }

    async fn on_stream_frame<W>(&mut self, f: Frame, wr: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let id = f.stream_id;
        if id == 0 {
            frame::write_frame(wr, &Frame::go_away(go_away::PROTOCOL_ERROR)).await?;
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                "data on the reserved stream id 0",
            ));
        }
        if f.has_flag(flags::RST) {
            if let Some(shared) = self.streams.remove(&id) {
                shared.lock().poison();
            }
            return Ok(());
        }
        if f.has_flag(flags::SYN) && !self.streams.contains_key(&id) {
            self.on_inbound_syn(id, wr).await?;
            if !self.streams.contains_key(&id) {
                // rejected with RST, drop the rest of the frame
                return Ok(());
            }
        }
        let shared = match self.streams.get(&id) {
            Some(shared) => shared.clone(),
            // frames for unknown streams are stale leftovers of a
            // reset we already processed
            None => return Ok(()),
        };
        match f.ty {
            FrameType::Data => {
                let window = shared.lock().window;
                if f.payload.len() > window as usize {
                    frame::write_frame(wr, &Frame::go_away(go_away::PROTOCOL_ERROR)).await?;
                    return Err(Error::wrapped(
                        ErrorKind::ProtocolError,
                        "peer overran the receive window",
                    ));
                }
                let mut s = shared.lock();
                s.window -= f.payload.len() as u32;
                s.buffer.extend_from_slice(&f.payload);
                s.wake_reader();
            }
            FrameType::WindowUpdate => {
                let mut s = shared.lock();
                s.credit = s.credit.saturating_add(f.length);
                s.wake_writer();
            }
            _ => {}
        }
        if f.has_flag(flags::FIN) {
            let mut s = shared.lock();
            s.read_closed = true;
            s.wake_reader();
        }
        if shared.lock().is_terminal() {
            self.streams.remove(&id);
        }
        Ok(())
    }

    async fn on_inbound_syn<W>(&mut self, id: u32, wr: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let own_parity = match self.mode {
            Mode::Client => 1,
            Mode::Server => 0,
        };
        if id % 2 == own_parity {
            frame::write_frame(wr, &Frame::go_away(go_away::PROTOCOL_ERROR)).await?;
            return Err(Error::wrapped(
                ErrorKind::ProtocolError,
                "peer opened a stream with our id parity",
            ));
        }
        if self.streams.len() >= self.cfg.maximum_streams {
            trace!("yamux: rejecting inbound stream {}, at capacity", id);
            frame::write_frame(wr, &Frame::window_update(id, flags::RST, 0)).await?;
            return Ok(());
        }
        let shared = Arc::new(Mutex::new(Shared::new(
            self.initial_window,
            self.initial_window,
        )));
        let handle = Stream::new(
            id,
            shared.clone(),
            self.frame_tx.clone(),
            self.initial_window,
        );
        self.streams.insert(id, shared.clone());
        frame::write_frame(wr, &Frame::window_update(id, flags::ACK, 0)).await?;
        if self.inbound_tx.unbounded_send(handle).is_err() {
            // nobody routes inbound streams anymore
            shared.lock().poison();
            self.streams.remove(&id);
            frame::write_frame(wr, &Frame::window_update(id, flags::RST, 0)).await?;
        }
        Ok(())
    }

    async fn open_local_stream<W>(&mut self, wr: &mut W) -> Result<Stream>
    where
        W: AsyncWrite + Unpin,
    {
        if self.streams.len() >= self.cfg.maximum_streams {
            return Err(Error::simple(ErrorKind::TooManyStreams));
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(2);
        let shared = Arc::new(Mutex::new(Shared::new(
            self.initial_window,
            self.initial_window,
        )));
        self.streams.insert(id, shared.clone());
        frame::write_frame(wr, &Frame::window_update(id, flags::SYN, 0)).await?;
        Ok(Stream::new(
            id,
            shared,
            self.frame_tx.clone(),
            self.initial_window,
        ))
    }

    /// Bookkeeping for frames the streams queued themselves.
    fn note_outgoing(&mut self, f: &Frame) {
        if f.has_flag(flags::RST) {
            if let Some(shared) = self.streams.remove(&f.stream_id) {
                shared.lock().poison();
            }
        } else if f.has_flag(flags::FIN) {
            let terminal = self
                .streams
                .get(&f.stream_id)
                .map(|shared| shared.lock().is_terminal())
                .unwrap_or(false);
            if terminal {
                self.streams.remove(&f.stream_id);
            }
        }
    }

    async fn on_tick<W>(&mut self, wr: &mut W, period: Duration) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.cfg.keep_alive_interval.is_some() {
            self.ping_counter = self.ping_counter.wrapping_add(1);
            frame::write_frame(wr, &Frame::ping(flags::SYN, self.ping_counter)).await?;
        }
        if let Some(limit) = self.cfg.no_streams_interval {
            if self.streams.is_empty() {
                self.idle_for += period;
                if self.idle_for >= limit {
                    trace!("yamux: no streams for {:?}, going away", self.idle_for);
                    let _ = frame::write_frame(wr, &Frame::go_away(go_away::NORMAL)).await;
                    return Err(Error::simple(ErrorKind::ConnectionClosedByHost));
                }
            } else {
                self.idle_for = Duration::ZERO;
            }
        }
        Ok(())
    }

    /// Poisons every stream; runs exactly once, when the actor stops.
    fn teardown(&mut self) {
        for (_, shared) in self.streams.drain() {
            shared.lock().poison();
        }
    }
}
