//! Signing and verification of handshake payloads and records.

#[cfg(feature = "crypto_signature_ring_ed25519")]
mod ring_ed25519;

#[cfg(feature = "crypto_signature_ring_ed25519")]
pub use ring_ed25519::{KeyPair, PublicKey, Signature};

#[cfg(not(feature = "crypto_signature_ring_ed25519"))]
compile_error!("Feature crypto_signature_ring_ed25519 must be enabled for this crate.");
