//! Abstractions over the async runtime driving the stack.
//!
//! Unlike a global runtime singleton, the facade only forwards to the
//! runtime the caller is already executing on. Spawned tasks are the
//! unit of concurrency everywhere in this crate; none of them may hold
//! a lock across a suspension point.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
pub use self::tokio::{build, spawn, yield_now, JoinHandle, Runtime};

#[cfg(not(feature = "async_runtime_tokio"))]
compile_error!("Feature async_runtime_tokio must be enabled for this crate.");
