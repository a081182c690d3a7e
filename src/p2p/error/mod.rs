//! Error related business logic of `hyphae`.
//!
//! One `Error` type is threaded through every layer of the stack, from
//! the raw transport up to the Kademlia query engine, so that callers
//! always match on the same `ErrorKind` taxonomy.

use std::error;
use std::fmt;
use std::io;
use std::result;

/// Extension of the standard library's `Result` type,
/// used to wrap its error in a `hyphae::p2p::error::Error`.
pub trait ResultWrappedExt {
    type T;

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
    fn wrapped(self, kind: ErrorKind) -> Result<Self::T>;
}

/// Extension of the standard library's `Result` type.
///
/// Different from `ResultWrappedExt`, this trait is
/// used in cases where we want to drop the underlying
/// error type in the `Result`. Having this possibility
/// might be useful when the error type in the `Result`
/// doesn't implement `Send`.
pub trait ResultSimpleExt {
    type T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T>;
    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T>;
}

impl<T, E> ResultWrappedExt for result::Result<T, E>
where
    E: Into<Box<dyn error::Error + Send + Sync>>,
{
    type T = T;

    fn wrapped(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, e))
    }

    fn wrapped_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|e| Error::wrapped(kind, format!("{}: {}", msg, e.into())))
    }
}

impl<T, E> ResultSimpleExt for result::Result<T, E> {
    type T = T;

    fn simple(self, kind: ErrorKind) -> Result<Self::T> {
        self.map_err(|_| Error::simple(kind))
    }

    fn simple_msg(self, kind: ErrorKind, msg: &str) -> Result<Self::T> {
        self.map_err(|_| Error::wrapped(kind, msg))
    }
}

/// Wrapper result type for `std::result::Result`.
pub type Result<T> = result::Result<T, Error>;

/// The error kinds observable across the stack.
///
/// Kinds are split between wire visible failures, resource failures
/// and `InternalError`, which flags a broken invariant of our own
/// making, so tests can tell the two classes apart.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorKind {
    /// The remote endpoint closed the connection.
    ConnectionClosedByPeer,
    /// The local host closed the connection.
    ConnectionClosedByHost,
    /// The peer violated framing, handshake or state machine rules.
    ProtocolError,
    /// A single stream received RST.
    StreamReset,
    /// Read or write on a closed stream.
    StreamClosed,
    /// The per-connection stream limit was hit.
    TooManyStreams,
    /// Multistream ran out of protocol proposals.
    NegotiationFailed,
    /// The secure channel could not be established.
    HandshakeFailed,
    /// The remote identity failed verification.
    PeerVerifyFailed,
    /// A handshake payload signature did not check out.
    SignatureMismatch,
    /// The authenticated peer id is not the one we dialed.
    UnexpectedPeerId,
    /// A peer id could not be derived or parsed.
    InvalidPeerId,
    /// A key could not be parsed or used.
    InvalidKey,
    /// No addresses are known for the peer.
    PeerNotFound,
    /// A lookup drained the search space without a result.
    NotFound,
    /// The operation did not finish in time.
    Timeout,
    /// A buffer, window or store capacity was breached.
    ResourceLimit,
    /// Failure in the operating system's I/O layer.
    Io,
    /// A broken invariant on our side. Never wire visible.
    InternalError,
}

/// The error type used throughout this crate.
pub struct Error {
    inner: ErrorInner,
}

#[derive(Debug)]
enum ErrorInner {
    Simple(ErrorKind),
    Wrapped(ErrorKind, Box<dyn error::Error + Send + Sync>),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.inner, f)
    }
}

impl Error {
    /// Returns an error not wrapping another
    /// error implementation, with kind `ErrorKind`.
    pub fn simple(kind: ErrorKind) -> Self {
        let inner = ErrorInner::Simple(kind);
        Error { inner }
    }

    /// Wraps an arbitrary error in an `Error`,
    /// with kind of type `ErrorKind`.
    pub fn wrapped<E>(kind: ErrorKind, e: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let inner = ErrorInner::Wrapped(kind, e.into());
        Error { inner }
    }

    /// Returns a copy of the `ErrorKind` of this `Error`.
    pub fn kind(&self) -> ErrorKind {
        match &self.inner {
            ErrorInner::Simple(k) => *k,
            ErrorInner::Wrapped(k, _) => *k,
        }
    }

    /// Swaps the `ErrorKind` of this `Error`.
    pub fn swap_kind(self, k: ErrorKind) -> Self {
        let inner = match self.inner {
            ErrorInner::Simple(_) => ErrorInner::Simple(k),
            ErrorInner::Wrapped(_, e) => ErrorInner::Wrapped(k, e),
        };
        Error { inner }
    }

    /// Whether this error takes the whole connection down, as opposed
    /// to a single stream or a single operation.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ConnectionClosedByPeer
                | ErrorKind::ConnectionClosedByHost
                | ErrorKind::ProtocolError
                | ErrorKind::HandshakeFailed
                | ErrorKind::PeerVerifyFailed
                | ErrorKind::SignatureMismatch
                | ErrorKind::UnexpectedPeerId
                | ErrorKind::Io
        )
    }

    /// Whether the dialer may retry the same address after seeing
    /// this error. Identity mismatches are never retried.
    pub fn is_retriable_dial(&self) -> bool {
        !matches!(
            self.kind(),
            ErrorKind::PeerVerifyFailed
                | ErrorKind::SignatureMismatch
                | ErrorKind::UnexpectedPeerId
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            ErrorInner::Simple(k) => write!(fmt, "{:?}", k),
            ErrorInner::Wrapped(k, e) => write!(fmt, "{:?}: {}", k, e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosedByPeer,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Io,
        };
        Error::wrapped(kind, e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e.kind() {
            ErrorKind::ConnectionClosedByPeer => io::ErrorKind::ConnectionReset,
            ErrorKind::ConnectionClosedByHost => io::ErrorKind::ConnectionAborted,
            ErrorKind::StreamReset => io::ErrorKind::ConnectionReset,
            ErrorKind::StreamClosed => io::ErrorKind::BrokenPipe,
            ErrorKind::Timeout => io::ErrorKind::TimedOut,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, e.to_string())
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        let e = Error::simple(ErrorKind::NegotiationFailed);
        assert_eq!(e.kind(), ErrorKind::NegotiationFailed);
        let e = e.swap_kind(ErrorKind::Timeout);
        assert_eq!(e.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_io_error_classification() {
        let e: Error = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(e.kind(), ErrorKind::ConnectionClosedByPeer);
        assert!(e.is_fatal_for_connection());

        let e: Error = io::Error::new(io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(e.kind(), ErrorKind::Timeout);
        assert!(e.is_retriable_dial());
    }

    #[test]
    fn test_identity_errors_not_retriable() {
        for kind in [
            ErrorKind::PeerVerifyFailed,
            ErrorKind::SignatureMismatch,
            ErrorKind::UnexpectedPeerId,
        ] {
            assert!(!Error::simple(kind).is_retriable_dial());
        }
    }
}
