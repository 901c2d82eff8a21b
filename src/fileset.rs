//! Snapshot under construction (and after load): a set of file entries
//! plus the metadata that lands in descriptor 2.
//!
//! Ownership is strictly downward: a `FileSet` owns its `FileEntry`s,
//! each entry owns its chunk list.  On commit the set is consumed into
//! descriptor 2 on disk.

use crate::records::{BackupFile, BackupType, FileChunk, FileType};

/// A single file in a snapshot: stored path, metadata, and the ordered
/// chunk references that reconstitute its contents.
#[derive(Debug, Clone)]
pub struct FileEntry {
    filename: String,
    metadata: BackupFile,
    symlink_target: Option<String>,
    chunks: Vec<FileChunk>,
}

impl FileEntry {
    /// Create an entry from stat metadata.  `file_size` restarts at zero
    /// and accumulates as chunks are added, so the stored size always
    /// equals the sum of the chunk sizes.
    pub fn new(filename: impl Into<String>, mut metadata: BackupFile,
               symlink_target: Option<String>) -> Self {
        metadata.file_size = 0;
        metadata.num_chunks = 0;
        Self {
            filename: filename.into(),
            metadata,
            symlink_target,
            chunks: Vec::new(),
        }
    }

    pub fn add_chunk(&mut self, chunk: FileChunk) {
        self.metadata.num_chunks += 1;
        self.metadata.file_size += chunk.unencoded_size;
        self.chunks.push(chunk);
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn metadata(&self) -> &BackupFile {
        &self.metadata
    }

    pub fn symlink_target(&self) -> Option<&str> {
        self.symlink_target.as_deref()
    }

    pub fn chunks(&self) -> &[FileChunk] {
        &self.chunks
    }

    pub fn file_type(&self) -> FileType {
        FileType::from_u32(self.metadata.file_type).unwrap_or(FileType::Invalid)
    }

    pub fn file_size(&self) -> u64 {
        self.metadata.file_size
    }
}

/// Value-typed handle to a snapshot's descriptor 2: `(volume, offset)`.
/// A `(0, 0)` pair terminates a chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupRef {
    pub volume: u64,
    pub offset: u64,
}

impl BackupRef {
    pub fn is_null(&self) -> bool {
        self.offset == 0
    }
}

/// All the files in one backup increment, with the snapshot metadata
/// needed to write descriptor 2.
#[derive(Debug, Clone)]
pub struct FileSet {
    files: Vec<FileEntry>,
    description: String,
    backup_type: BackupType,
    /// Seconds since the epoch, stamped when the backup was created.
    pub date: u64,
    pub label_id: u64,
    pub label_name: String,
    /// The temporally prior snapshot anywhere in the library.
    pub previous_backup: BackupRef,
    /// The baseline snapshot of this label.
    pub parent_backup: BackupRef,
    /// Logical bytes of all files in this snapshot.
    pub unencoded_size: u64,
    /// Post-encoding bytes, before deduplication.
    pub encoded_size: u64,
    /// Bytes of newly written chunk data; the real growth of the library.
    pub deduplicated_size: u64,
}

impl FileSet {
    pub fn new(description: impl Into<String>, backup_type: BackupType) -> Self {
        Self {
            files: Vec::new(),
            description: description.into(),
            backup_type,
            date: 0,
            label_id: 0,
            label_name: String::new(),
            previous_backup: BackupRef::default(),
            parent_backup: BackupRef::default(),
            unencoded_size: 0,
            encoded_size: 0,
            deduplicated_size: 0,
        }
    }

    /// Add a file entry, returning its index for later chunk appends.
    pub fn add_file(&mut self, entry: FileEntry) -> usize {
        self.files.push(entry);
        self.files.len() - 1
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn file_mut(&mut self, index: usize) -> &mut FileEntry {
        &mut self.files[index]
    }

    pub fn num_files(&self) -> u64 {
        self.files.len() as u64
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn backup_type(&self) -> BackupType {
        self.backup_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::Md5Digest;

    #[test]
    fn file_size_is_sum_of_chunks() {
        let mut meta = BackupFile::default();
        meta.file_type = FileType::Regular as u32;
        meta.file_size = 999; // stat size is discarded; chunks are the truth
        let mut entry = FileEntry::new("/a", meta, None);
        assert_eq!(entry.file_size(), 0);

        for i in 0..3 {
            entry.add_chunk(FileChunk {
                md5sum: Md5Digest(42),
                volume_num: 0,
                volume_offset: 8,
                chunk_offset: i * 14,
                unencoded_size: 14,
            });
        }
        assert_eq!(entry.file_size(), 42);
        assert_eq!(entry.metadata().num_chunks, 3);
    }

    #[test]
    fn null_ref_terminates() {
        assert!(BackupRef::default().is_null());
        assert!(!BackupRef { volume: 0, offset: 96 }.is_null());
    }
}
