//! TCP socket backends.

#[cfg(feature = "socket_tokio_tcp")]
mod tokio_tcp;

#[cfg(feature = "socket_tokio_tcp")]
pub use tokio_tcp::{bind, connect, Listener, Socket};

#[cfg(not(feature = "socket_tokio_tcp"))]
compile_error!("Feature socket_tokio_tcp must be enabled for this crate.");
