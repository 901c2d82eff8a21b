//! Digest-keyed chunk index.
//!
//! Kept in two places: per-volume (so a closing volume can emit its own
//! descriptor 1) and as the library-wide union used for deduplication.
//! Iteration preserves insertion order — descriptor 1 enumerates chunks
//! in the order they were added to the volume.

use std::collections::HashMap;

use crate::hash::Md5Digest;
use crate::records::Descriptor1Chunk;

#[derive(Debug, Default)]
pub struct ChunkMap {
    /// Entries in insertion order.
    entries: Vec<Descriptor1Chunk>,
    /// Digest → index into `entries`.
    index: HashMap<Md5Digest, usize>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_chunk(&self, md5sum: Md5Digest) -> bool {
        self.index.contains_key(&md5sum)
    }

    pub fn get_chunk(&self, md5sum: Md5Digest) -> Option<&Descriptor1Chunk> {
        self.index.get(&md5sum).map(|&i| &self.entries[i])
    }

    /// Add a chunk.  A re-added digest replaces the stored location but
    /// keeps its original position in the enumeration order.
    pub fn add(&mut self, chunk: Descriptor1Chunk) {
        match self.index.get(&chunk.md5sum) {
            Some(&i) => self.entries[i] = chunk,
            None => {
                self.index.insert(chunk.md5sum, self.entries.len());
                self.entries.push(chunk);
            }
        }
    }

    /// Merge `source` into this map.  On collision the incoming entry
    /// wins; in practice colliding entries describe identical chunks.
    pub fn merge(&mut self, source: &ChunkMap) {
        for chunk in &source.entries {
            self.add(*chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes these entries will occupy in descriptor 1.  Used by the
    /// volume's size estimate so bin-packing accounts for the trailer.
    pub fn disk_size(&self) -> u64 {
        (self.entries.len() * Descriptor1Chunk::SIZE) as u64
    }

    /// Iterate in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Descriptor1Chunk> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(digest: u128, offset: u64, volume: u64) -> Descriptor1Chunk {
        Descriptor1Chunk { md5sum: Md5Digest(digest), offset, volume_number: volume }
    }

    #[test]
    fn add_get_has() {
        let mut map = ChunkMap::new();
        assert!(!map.has_chunk(Md5Digest(7)));
        map.add(entry(7, 8, 0));
        assert!(map.has_chunk(Md5Digest(7)));
        assert_eq!(map.get_chunk(Md5Digest(7)).unwrap().offset, 8);
    }

    #[test]
    fn merge_last_writer_wins() {
        let mut a = ChunkMap::new();
        a.add(entry(7, 8, 0));
        let mut b = ChunkMap::new();
        b.add(entry(7, 100, 2));
        b.add(entry(9, 50, 2));
        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.get_chunk(Md5Digest(7)).unwrap().volume_number, 2);
    }

    #[test]
    fn iteration_preserves_insertion_order() {
        let mut map = ChunkMap::new();
        for (i, digest) in [9u128, 3, 7, 5].into_iter().enumerate() {
            map.add(entry(digest, i as u64 * 40, 0));
        }
        let order: Vec<u128> = map.iter().map(|c| c.md5sum.0).collect();
        assert_eq!(order, vec![9, 3, 7, 5]);
    }

    #[test]
    fn disk_size_counts_records() {
        let mut map = ChunkMap::new();
        map.add(entry(1, 0, 0));
        map.add(entry(2, 40, 0));
        assert_eq!(map.disk_size(), 2 * Descriptor1Chunk::SIZE as u64);
    }
}
