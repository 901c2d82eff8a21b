//! Chunk identity: 128-bit MD5 digests.
//!
//! Equality of digests defines chunk identity across the whole library;
//! collisions are treated as identity and are not handled.  The digest is
//! always taken over the *unencoded* chunk bytes, so compression never
//! changes a chunk's key.

use md5::{Digest, Md5};
use std::fmt;

/// A 128-bit content digest with stable ordering and hashing.
///
/// Wire form is the 16-byte little-endian representation of the `u128`;
/// see the `Descriptor1Chunk` and `FileChunk` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Md5Digest(pub u128);

impl Md5Digest {
    pub const SIZE: usize = 16;

    pub fn to_le_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 16]) -> Self {
        Md5Digest(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for Md5Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0.to_be_bytes()))
    }
}

/// Digest capability.  Stateless and deterministic; injected into the
/// library so tests can substitute a canned implementation.
pub trait Digester: Send + Sync {
    fn digest(&self, data: &[u8]) -> Md5Digest;
}

/// The production digester, backed by the `md-5` crate.
pub struct Md5Generator;

impl Digester for Md5Generator {
    fn digest(&self, data: &[u8]) -> Md5Digest {
        let sum: [u8; 16] = Md5::digest(data).into();
        // MD5 output is big-endian by convention; keep the numeric value
        // consistent with the hex string a user would compute.
        Md5Digest(u128::from_be_bytes(sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // md5("abc") = 900150983cd24fb0d6963f7d28e17f72
        let d = Md5Generator.digest(b"abc");
        assert_eq!(d.to_string(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn digest_depends_only_on_input() {
        let a = Md5Generator.digest(b"abcdefg1234567");
        let b = Md5Generator.digest(b"abcdefg1234567");
        let c = Md5Generator.digest(b"abcdefg1234568");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wire_round_trip() {
        let d = Md5Generator.digest(b"wire");
        assert_eq!(Md5Digest::from_le_bytes(d.to_le_bytes()), d);
    }
}
