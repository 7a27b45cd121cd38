//! CRC32 checksums over streamed payload chunks.

use crc32fast::Hasher;
use std::fmt;

/// A CRC32 digest, stored big-endian on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Checksum(u32);

impl Checksum {
    /// Size of the encoded digest in bytes.
    pub const SIZE: usize = 4;

    /// Computes the checksum of a sequence of chunks as if they were one buffer.
    pub fn of_chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = ChecksumHasher::new();
        for chunk in chunks {
            hasher.update(chunk.as_ref());
        }
        hasher.finalize()
    }

    /// Computes the checksum of a single buffer.
    pub fn of(data: &[u8]) -> Self {
        Self(crc32fast::hash(data))
    }

    /// Wraps a raw CRC32 value.
    pub fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// Decodes a big-endian digest.
    pub fn from_be_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    /// Returns the raw CRC32 value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Encodes the digest big-endian.
    pub fn to_be_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Checksum({:08x})", self.0)
    }
}

/// Rolling CRC32 for payloads that arrive in pieces.
#[derive(Clone, Default)]
pub struct ChecksumHasher {
    inner: Hasher,
}

impl ChecksumHasher {
    /// Creates an empty hasher.
    pub fn new() -> Self {
        Self {
            inner: Hasher::new(),
        }
    }

    /// Feeds the next chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
    }

    /// Consumes the hasher and returns the digest.
    pub fn finalize(self) -> Checksum {
        Checksum(self.inner.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_digest() {
        let checksum = Checksum::of(b"hello world");
        assert_eq!(checksum.value(), 0x0d4a_1185);
        assert_eq!(checksum.to_be_bytes(), [0x0d, 0x4a, 0x11, 0x85]);
    }

    #[test]
    fn test_chunks_match_single_buffer() {
        let whole = Checksum::of(b"hello world");
        let chunked = Checksum::of_chunks([&b"hel"[..], b"lo", b" ", b"world"]);
        assert_eq!(whole, chunked);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(Checksum::of(b"").value(), 0);
        assert_eq!(Checksum::of_chunks(Vec::<Vec<u8>>::new()).value(), 0);
    }

    #[test]
    fn test_be_roundtrip() {
        let checksum = Checksum::from_u32(0xdead_beef);
        assert_eq!(Checksum::from_be_bytes(checksum.to_be_bytes()), checksum);
    }
}
