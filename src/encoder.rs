//! Chunk payload encoding — raw pass-through or zlib.
//!
//! The encoder never decides the on-disk encoding by itself: the library
//! compares the encoded output against the raw input and stores whichever
//! is smaller, recording the choice in the chunk header.  `decode` is
//! handed the expected unencoded size from the chunk metadata and fails
//! hard if the stream disagrees.

use flate2::read::{ZlibDecoder, ZlibEncoder as ZlibReadEncoder};
use flate2::Compression;
use std::io::Read;

use crate::error::{Error, Result};

/// Compression capability.  Injected into the library; a test double can
/// return canned output to exercise the raw-vs-encoded decision.
pub trait Encoder: Send + Sync {
    /// Compress `src`.  The caller substitutes raw encoding when the
    /// result is not smaller than the input.
    fn encode(&self, src: &[u8]) -> Result<Vec<u8>>;

    /// Decompress `src` into exactly `expected_size` bytes.
    ///
    /// Fails with `CorruptBackup` if the stream is malformed or the
    /// decoded length differs from `expected_size`.
    fn decode(&self, src: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// zlib at default compression, via `flate2`.
pub struct ZlibEncoder;

impl Encoder for ZlibEncoder {
    fn encode(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(src.len() / 2);
        let mut enc = ZlibReadEncoder::new(src, Compression::default());
        enc.read_to_end(&mut out)
            .map_err(|e| Error::GenericError(format!("zlib deflate failed: {e}")))?;
        Ok(out)
    }

    fn decode(&self, src: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected_size);
        let mut dec = ZlibDecoder::new(src);
        dec.read_to_end(&mut out)
            .map_err(|e| Error::CorruptBackup(format!("Error reading compressed data: {e}")))?;
        if out.len() != expected_size {
            return Err(Error::CorruptBackup(format!(
                "Decompressed size was {}, expected {}",
                out.len(),
                expected_size
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decode_rejects_wrong_size() {
        let enc = ZlibEncoder;
        let compressed = enc.encode(b"fourteen bytes").unwrap();
        let err = enc.decode(&compressed, 99).unwrap_err();
        assert!(matches!(err, Error::CorruptBackup(_)));
    }

    #[test]
    fn decode_rejects_garbage() {
        let err = ZlibEncoder.decode(b"\xff\xfe\xfd\xfc", 4).unwrap_err();
        assert!(matches!(err, Error::CorruptBackup(_)));
    }

    #[test]
    fn repetitive_data_shrinks() {
        let data = vec![b'a'; 64 * 1024];
        let compressed = ZlibEncoder.encode(&data).unwrap();
        assert!(compressed.len() < data.len());
    }

    proptest! {
        #[test]
        fn round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let enc = ZlibEncoder;
            let compressed = enc.encode(&data).unwrap();
            let restored = enc.decode(&compressed, data.len()).unwrap();
            prop_assert_eq!(restored, data);
        }
    }
}
