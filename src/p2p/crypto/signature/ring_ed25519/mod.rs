use std::fmt;
use std::sync::Arc;

use ring::rand::{SecureRandom, SystemRandom};
use ring::signature::{
    self,
    Ed25519KeyPair,
    KeyPair as RingKeyPair,
    ED25519,
};

use crate::p2p::error::*;

/// An Ed25519 key pair. The private half never leaves the process.
#[derive(Clone)]
pub struct KeyPair {
    inner: Arc<Ed25519KeyPair>,
    seed: [u8; 32],
}

/// An Ed25519 public key.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PublicKey {
    raw: [u8; 32],
}

/// A detached Ed25519 signature.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Signature([u8; Signature::LENGTH]);

impl KeyPair {
    /// Generates a fresh random key pair.
    pub fn generate() -> Result<Self> {
        let mut seed = [0; 32];
        SystemRandom::new()
            .fill(&mut seed[..])
            .simple_msg(ErrorKind::InvalidKey, "entropy source failed")?;
        Self::from_bytes(&seed[..])
    }

    /// Reconstructs a key pair from a 32 byte Ed25519 seed.
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < 32 {
            return Err("Ed25519 seed has an invalid length").wrapped(ErrorKind::InvalidKey);
        }
        let mut seed = [0; 32];
        seed.copy_from_slice(&raw_bytes[..32]);
        let inner = Ed25519KeyPair::from_seed_unchecked(&seed[..])
            .simple_msg(ErrorKind::InvalidKey, "invalid Ed25519 seed")?;
        Ok(Self {
            inner: Arc::new(inner),
            seed,
        })
    }

    /// The seed this key pair was built from.
    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    /// Signs `message` with the private half.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.inner.sign(message);
        // ring signatures are always Signature::LENGTH bytes
        Signature::from_bytes(sig.as_ref()).expect("ed25519 signature length")
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> PublicKey {
        let mut raw = [0; 32];
        raw.copy_from_slice(self.inner.public_key().as_ref());
        PublicKey { raw }
    }
}

impl PublicKey {
    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() != 32 {
            return Err("Ed25519 public key has an invalid length")
                .wrapped(ErrorKind::InvalidKey);
        }
        let mut raw = [0; 32];
        raw.copy_from_slice(raw_bytes);
        Ok(Self { raw })
    }

    /// Verifies `signature` over `message`.
    pub fn verify(&self, message: &[u8], sig: &Signature) -> Result<()> {
        signature::UnparsedPublicKey::new(&ED25519, &self.raw[..])
            .verify(message, sig.as_ref())
            .simple(ErrorKind::SignatureMismatch)
    }
}

impl From<&KeyPair> for PublicKey {
    fn from(kp: &KeyPair) -> PublicKey {
        kp.public_key()
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.raw
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({:02x}{:02x}..)", self.raw[0], self.raw[1])
    }
}

impl Signature {
    pub const LENGTH: usize = 64;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Signature has an invalid length").wrapped(ErrorKind::SignatureMismatch);
        }
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = KeyPair::generate().unwrap();
        let sig = kp.sign(b"payload");
        kp.public_key().verify(b"payload", &sig).unwrap();
        assert!(kp.public_key().verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn test_seed_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let restored = KeyPair::from_bytes(&kp.seed()[..]).unwrap();
        assert_eq!(kp.public_key(), restored.public_key());
    }

    #[test]
    fn test_wrong_key_rejects() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let sig = a.sign(b"payload");
        assert!(b.public_key().verify(b"payload", &sig).is_err());
    }
}
