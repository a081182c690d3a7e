use std::fmt;

use ring::digest::{self, SHA256, SHA256_OUTPUT_LEN};

use crate::p2p::error::*;

/// A SHA-256 output. Doubles as the coordinate type of the Kademlia
/// key space, where outputs are compared by XOR distance.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct Digest([u8; Digest::LENGTH]);

/// Hashes `data` with SHA-256.
pub fn sha256(data: &[u8]) -> Digest {
    let d = digest::digest(&SHA256, data);
    Digest::from_bytes_unchecked(d.as_ref())
}

impl Digest {
    pub const LENGTH: usize = SHA256_OUTPUT_LEN;

    pub fn from_bytes(raw_bytes: &[u8]) -> Result<Self> {
        if raw_bytes.len() < Self::LENGTH {
            return Err("Digest has an invalid length").wrapped(ErrorKind::InvalidKey);
        }
        Ok(Self::from_bytes_unchecked(raw_bytes))
    }

    fn from_bytes_unchecked(raw_bytes: &[u8]) -> Self {
        let mut inner = [0; Self::LENGTH];
        inner.copy_from_slice(&raw_bytes[..Self::LENGTH]);
        Self(inner)
    }

    /// The bitwise XOR of two digests, the Kademlia distance metric.
    pub fn xor(&self, other: &Digest) -> Digest {
        let mut out = [0; Self::LENGTH];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.0[i] ^ other.0[i];
        }
        Digest(out)
    }

    /// Position of the most significant set bit, or `None` for the
    /// zero digest. Bit 255 is the first bit of the first byte.
    pub fn highest_bit(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let in_byte = 7 - byte.leading_zeros() as usize;
                return Some((Self::LENGTH - 1 - i) * 8 + in_byte);
            }
        }
        None
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_vector() {
        // SHA-256("abc")
        let d = sha256(b"abc");
        assert_eq!(
            d.as_ref()[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }

    #[test]
    fn test_xor_identity() {
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_eq!(a.xor(&a).highest_bit(), None);
        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn test_highest_bit() {
        let mut raw = [0u8; Digest::LENGTH];
        raw[0] = 0x80;
        assert_eq!(Digest::from_bytes(&raw).unwrap().highest_bit(), Some(255));
        raw[0] = 0;
        raw[Digest::LENGTH - 1] = 1;
        assert_eq!(Digest::from_bytes(&raw).unwrap().highest_bit(), Some(0));
    }
}
