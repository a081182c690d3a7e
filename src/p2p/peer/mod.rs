//! Peer identity types.
//!
//! A peer id is the multihash of the peer's serialized public key:
//! identity-hashed when the record is short enough to embed whole,
//! SHA-256 otherwise. Ids render in two encodings, legacy base58 and
//! multibase base32 with a `b` prefix.

use std::fmt;
use std::str::FromStr;

use multiaddr::Multiaddr;
use multihash::Multihash;
use rand::RngCore;

use crate::p2p::crypto::hash::sha256;
use crate::p2p::crypto::keys;
use crate::p2p::crypto::signature::PublicKey;
use crate::p2p::error::*;

const MH_IDENTITY: u64 = 0x00;
const MH_SHA2_256: u64 = 0x12;

// serialized keys at most this long are embedded verbatim
const MAX_INLINE_KEY_LEN: usize = 42;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// Canonical multihash of a peer's serialized public key.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId {
    mh: Multihash<64>,
}

impl PeerId {
    /// Derives the id of the peer owning `pk`.
    pub fn from_public_key(pk: &PublicKey) -> PeerId {
        let record = keys::encode_public_key(pk);
        let mh = if record.len() <= MAX_INLINE_KEY_LEN {
            Multihash::wrap(MH_IDENTITY, &record)
        } else {
            Multihash::wrap(MH_SHA2_256, sha256(&record).as_ref())
        };
        // both digests fit the 64 byte multihash limit
        PeerId {
            mh: mh.expect("peer id digest within multihash bounds"),
        }
    }

    /// Parses an id from its binary multihash form.
    pub fn from_bytes(bytes: &[u8]) -> Result<PeerId> {
        let mh = Multihash::from_bytes(bytes).wrapped(ErrorKind::InvalidPeerId)?;
        if mh.code() != MH_IDENTITY && mh.code() != MH_SHA2_256 {
            return Err("peer id uses an unknown multihash code")
                .wrapped(ErrorKind::InvalidPeerId);
        }
        Ok(PeerId { mh })
    }

    /// Parses an id from its legacy base58 rendering.
    pub fn from_base58(s: &str) -> Result<PeerId> {
        let bytes = bs58::decode(s)
            .into_vec()
            .wrapped(ErrorKind::InvalidPeerId)?;
        Self::from_bytes(&bytes)
    }

    /// A random id, used by the Kademlia random walk and in tests.
    pub fn random() -> PeerId {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw[..]);
        PeerId {
            mh: Multihash::wrap(MH_SHA2_256, &raw[..]).expect("32 bytes fit"),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.mh.to_bytes()
    }

    pub fn as_multihash(&self) -> &Multihash<64> {
        &self.mh
    }

    /// Legacy base58 rendering with no multibase prefix.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.mh.to_bytes()).into_string()
    }

    /// Multibase base32 rendering, lowercase, `b` prefix, no padding.
    pub fn to_base32(&self) -> String {
        let bytes = self.mh.to_bytes();
        let mut out = String::with_capacity(1 + bytes.len() * 8 / 5 + 1);
        out.push('b');
        let mut acc: u32 = 0;
        let mut bits = 0;
        for byte in bytes {
            acc = (acc << 8) | u32::from(byte);
            bits += 8;
            while bits >= 5 {
                bits -= 5;
                out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
            }
        }
        if bits > 0 {
            out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
        }
        out
    }
}

impl From<Multihash<64>> for PeerId {
    fn from(mh: Multihash<64>) -> PeerId {
        PeerId { mh }
    }
}

impl From<PeerId> for Multihash<64> {
    fn from(id: PeerId) -> Multihash<64> {
        id.mh
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<PeerId> {
        PeerId::from_base58(s)
    }
}

/// A peer id together with its known addresses, in preference order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addresses: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(id: PeerId) -> Self {
        Self {
            id,
            addresses: Vec::new(),
        }
    }

    pub fn with_addresses(id: PeerId, addresses: Vec<Multiaddr>) -> Self {
        let mut info = Self::new(id);
        for addr in addresses {
            info.add_address(addr);
        }
        info
    }

    /// Appends an address, keeping the list unique and ordered by
    /// first insertion.
    pub fn add_address(&mut self, addr: Multiaddr) {
        if !self.addresses.contains(&addr) {
            self.addresses.push(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::crypto::signature::KeyPair;

    #[test]
    fn test_ed25519_ids_are_inline() {
        let kp = KeyPair::generate().unwrap();
        let id = PeerId::from_public_key(&kp.public_key());
        // 36 byte key record embeds under the identity code
        assert_eq!(id.as_multihash().code(), MH_IDENTITY);
        let len = id.to_bytes().len();
        assert!((32..=38).contains(&len), "unexpected id length {}", len);
    }

    #[test]
    fn test_base58_roundtrip() {
        let kp = KeyPair::generate().unwrap();
        let id = PeerId::from_public_key(&kp.public_key());
        let parsed = PeerId::from_base58(&id.to_base58()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_base32_prefix_and_alphabet() {
        let id = PeerId::random();
        let s = id.to_base32();
        assert!(s.starts_with('b'));
        assert!(s[1..]
            .bytes()
            .all(|b| BASE32_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let kp = KeyPair::generate().unwrap();
        let a = PeerId::from_public_key(&kp.public_key());
        let b = PeerId::from_public_key(&kp.public_key());
        assert_eq!(a, b);
    }

    #[test]
    fn test_peer_info_dedups_addresses() {
        let mut info = PeerInfo::new(PeerId::random());
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        info.add_address(addr.clone());
        info.add_address(addr);
        assert_eq!(info.addresses.len(), 1);
    }
}
