//! Logical streams carried by a yamux connection.
//!
//! A stream never touches the socket. Reads are served out of a buffer
//! the connection actor fills; writes turn into frames pushed into the
//! actor's write queue, gated by the send credit the peer granted.
//! The handle holds no reference back to the connection other than the
//! frame channel, so dropping the connection can never be prevented by
//! a surviving stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use futures::channel::mpsc;
use futures::io::{AsyncRead, AsyncWrite};
use parking_lot::Mutex;

use super::frame::{flags, Frame};

// largest chunk a single DATA frame carries
const MAX_CHUNK: usize = 16 * 1024;

/// State shared between a stream handle and the connection actor.
/// Locked only for short, suspension-free sections.
#[derive(Debug)]
pub(crate) struct Shared {
    /// FIN received, no more incoming bytes after the buffer drains.
    pub read_closed: bool,
    /// FIN sent, the local side stopped writing.
    pub write_closed: bool,
    /// RST seen in either direction.
    pub reset: bool,
    /// Received, undelivered bytes.
    pub buffer: BytesMut,
    /// Bytes the peer may still send us before a window update.
    pub window: u32,
    /// Bytes consumed by the application since the last update.
    pub consumed: u32,
    /// Bytes we may still send before the peer updates us.
    pub credit: u32,
    pub reader: Option<Waker>,
    pub writer: Option<Waker>,
}

impl Shared {
    pub fn new(window: u32, credit: u32) -> Self {
        Self {
            read_closed: false,
            write_closed: false,
            reset: false,
            buffer: BytesMut::new(),
            window,
            consumed: 0,
            credit,
            reader: None,
            writer: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.reset || (self.read_closed && self.write_closed && self.buffer.is_empty())
    }

    pub fn wake_reader(&mut self) {
        if let Some(waker) = self.reader.take() {
            waker.wake();
        }
    }

    pub fn wake_writer(&mut self) {
        if let Some(waker) = self.writer.take() {
            waker.wake();
        }
    }

    /// Marks the stream dead and wakes any parked task.
    pub fn poison(&mut self) {
        self.reset = true;
        self.wake_reader();
        self.wake_writer();
    }
}

/// A bidirectional logical stream with independent half-close.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    shared: Arc<Mutex<Shared>>,
    to_conn: mpsc::UnboundedSender<Frame>,
    // threshold at which consumed bytes are given back to the sender
    update_threshold: u32,
}

impl Stream {
    pub(crate) fn new(
        id: u32,
        shared: Arc<Mutex<Shared>>,
        to_conn: mpsc::UnboundedSender<Frame>,
        initial_window: u32,
    ) -> Self {
        Self {
            id,
            shared,
            to_conn,
            update_threshold: (initial_window / 2).max(1),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Hard-closes both directions with RST.
    pub fn reset(&mut self) {
        let mut shared = self.shared.lock();
        if shared.reset || (shared.read_closed && shared.write_closed) {
            return;
        }
        shared.poison();
        drop(shared);
        let _ = self
            .to_conn
            .unbounded_send(Frame::window_update(self.id, flags::RST, 0));
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
            shared.consumed = shared.consumed.saturating_add(n as u32);
            // hand consumed bytes back once they are worth a frame
            if shared.consumed >= this.update_threshold && !shared.read_closed {
                let delta = shared.consumed;
                shared.consumed = 0;
                shared.window = shared.window.saturating_add(delta);
                drop(shared);
                let _ = this
                    .to_conn
                    .unbounded_send(Frame::window_update(this.id, 0, delta));
            }
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
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut shared = this.shared.lock();
        if shared.reset {
            return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()));
        }
        if shared.write_closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if shared.credit == 0 {
            // blocked on window; the waker fires on the next update
            shared.writer = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = buf.len().min(shared.credit as usize).min(MAX_CHUNK);
        shared.credit -= n as u32;
        drop(shared);
        this.to_conn
            .unbounded_send(Frame::data(this.id, 0, buf[..n].to_vec()))
            .map_err(|_| io::Error::from(io::ErrorKind::ConnectionAborted))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are flushed by the connection actor as they are queued
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
        let _ = this
            .to_conn
            .unbounded_send(Frame::data(this.id, flags::FIN, Vec::new()));
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.reset();
    }
}
