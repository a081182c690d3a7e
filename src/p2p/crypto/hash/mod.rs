//! Hashing primitives.

#[cfg(feature = "crypto_hash_ring_sha2")]
mod ring_sha2;

#[cfg(feature = "crypto_hash_ring_sha2")]
pub use ring_sha2::{sha256, Digest};

#[cfg(not(feature = "crypto_hash_ring_sha2"))]
compile_error!("Feature crypto_hash_ring_sha2 must be enabled for this crate.");
