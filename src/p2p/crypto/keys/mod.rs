//! Self-describing key records, as they travel on the wire.
//!
//! A public key serializes to a protobuf record `{type_tag, key_bytes}`
//! so that peers can describe keys of any algorithm; peer ids are
//! derived from this serialized form. Only Ed25519 keys are generated
//! and signed with locally, the other tags exist for interop.

use prost::Message;

use crate::p2p::crypto::signature::{KeyPair, PublicKey};
use crate::p2p::error::*;

/// Wire tags of the known key algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum KeyType {
    Rsa = 0,
    Ed25519 = 1,
    Secp256k1 = 2,
    Ecdsa = 3,
}

/// The serialized form of a public key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PublicKeyRecord {
    #[prost(enumeration = "KeyType", tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// The serialized form of a private key. Only ever read from local
/// storage, never sent anywhere.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PrivateKeyRecord {
    #[prost(enumeration = "KeyType", tag = "1")]
    pub key_type: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
}

/// Serializes an Ed25519 public key into its wire record.
pub fn encode_public_key(pk: &PublicKey) -> Vec<u8> {
    let record = PublicKeyRecord {
        key_type: KeyType::Ed25519 as i32,
        data: pk.as_ref().to_vec(),
    };
    record.encode_to_vec()
}

/// Parses a wire record back into a public key.
pub fn decode_public_key(bytes: &[u8]) -> Result<PublicKey> {
    let record = PublicKeyRecord::decode(bytes).wrapped(ErrorKind::InvalidKey)?;
    match KeyType::try_from(record.key_type) {
        Ok(KeyType::Ed25519) => PublicKey::from_bytes(&record.data),
        Ok(other) => Err(Error::wrapped(
            ErrorKind::InvalidKey,
            format!("unsupported key type {:?}", other),
        )),
        Err(_) => Err(Error::wrapped(ErrorKind::InvalidKey, "unknown key type tag")),
    }
}

/// Loads the identity key pair from a file, accepting the formats of
/// [`load_identity`].
pub fn load_identity_file(path: &std::path::Path) -> Result<KeyPair> {
    let bytes = std::fs::read(path)?;
    load_identity(&bytes)
}

/// Reconstructs an identity key pair from bytes loaded off disk.
///
/// Accepts either a raw 32 byte Ed25519 seed or a protobuf
/// `PrivateKeyRecord` wrapping one.
pub fn load_identity(bytes: &[u8]) -> Result<KeyPair> {
    if bytes.len() == 32 {
        return KeyPair::from_bytes(bytes);
    }
    let record = PrivateKeyRecord::decode(bytes).wrapped(ErrorKind::InvalidKey)?;
    match KeyType::try_from(record.key_type) {
        Ok(KeyType::Ed25519) => KeyPair::from_bytes(&record.data),
        _ => Err(Error::wrapped(
            ErrorKind::InvalidKey,
            "identity file does not hold an Ed25519 key",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let wire = encode_public_key(&kp.public_key());
        let back = decode_public_key(&wire).unwrap();
        assert_eq!(back, kp.public_key());
    }

    #[test]
    fn test_load_identity_raw_seed() {
        let kp = KeyPair::generate().unwrap();
        let loaded = load_identity(&kp.seed()[..]).unwrap();
        assert_eq!(loaded.public_key(), kp.public_key());
    }

    #[test]
    fn test_load_identity_record() {
        let kp = KeyPair::generate().unwrap();
        let record = PrivateKeyRecord {
            key_type: KeyType::Ed25519 as i32,
            data: kp.seed().to_vec(),
        };
        let loaded = load_identity(&record.encode_to_vec()).unwrap();
        assert_eq!(loaded.public_key(), kp.public_key());
    }

    #[test]
    fn test_reject_foreign_key_types() {
        let record = PublicKeyRecord {
            key_type: KeyType::Rsa as i32,
            data: vec![0; 270],
        };
        assert!(decode_public_key(&record.encode_to_vec()).is_err());
    }
}
