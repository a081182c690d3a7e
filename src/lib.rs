//! `hyphae` is a peer-to-peer networking stack.
//!
//! Processes establish authenticated, multiplexed, encrypted streams
//! with each other over TCP, negotiate application protocols in-band,
//! and discover peers and content in a Kademlia distributed hash
//! table.
//!
//! The entry point is [`p2p::host::Host`]; discovery lives in
//! [`p2p::kad::Kademlia`].

pub mod p2p;

pub use crate::p2p::error::{Error, ErrorKind, Result};
pub use crate::p2p::host::{Host, HostConfig};
pub use crate::p2p::kad::{Kademlia, KademliaConfig};
pub use crate::p2p::peer::{PeerId, PeerInfo};
