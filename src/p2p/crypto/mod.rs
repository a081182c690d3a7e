//! Cryptographic primitives used by the stack.
//!
//! Concrete providers are selected with feature flags, one module per
//! backend. The rest of the crate only sees the re-exported types.

pub mod hash;
pub mod keys;
pub mod signature;
