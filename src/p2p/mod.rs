//! This module contains the implementation details of `hyphae`.
//!
//! The stack is layered the way the wire is: a raw transport carries a
//! secure channel, which carries a stream multiplexer, which exposes
//! logical streams to application protocols such as Kademlia and
//! Identify. Each layer lives in its own submodule.

pub mod async_runtime;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod host;
pub mod identify;
pub mod kad;
pub mod multiselect;
pub mod muxer;
pub mod network;
pub mod observed;
pub mod peer;
pub mod peerstore;
pub mod scheduler;
pub mod security;
pub mod transport;
