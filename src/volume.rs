//! A single `.bkp` backup volume: chunk blobs plus end-of-file
//! descriptors.
//!
//! # Reading
//! `init()` validates the magic, reads the fixed [`DescriptorHeader`]
//! from EOF, then descriptor 1 (chunk index + label registry).  If the
//! header says a descriptor 2 is present, its offset is the position
//! immediately after descriptor 1's records, and is cached for snapshot
//! loads.  Every structural check failure is `CorruptBackup`; an absent
//! file is `NoSuchFile`.
//!
//! # Writing
//! `create()` writes only the magic; chunks are appended at EOF and no
//! descriptor is written until `close()`/`close_with_fileset()`/
//! `cancel()`.  A volume dropped while modified has lost its trailer and
//! will need header re-parsing to recover its chunks.
//!
//! # Cancellation
//! `cancel()` still writes descriptor 1, so an aborted backup's chunks
//! stay enumerable for dedup; the header's `cancelled` flag tells readers
//! there is no snapshot here.

use log::{debug, info, warn};

use crate::chunk_map::ChunkMap;
use crate::error::{Error, Result};
use crate::file::{FileIo, Mode};
use crate::fileset::{BackupRef, FileEntry, FileSet};
use crate::hash::Md5Digest;
use crate::labels::LabelMap;
use crate::records::{
    BackupFile, BackupType, ChunkHeader, Descriptor1, Descriptor1Chunk, Descriptor1Label,
    Descriptor2, DescriptorHeader, EncodingType, FileChunk, FileType, MAGIC,
};

/// Options staged at volume creation.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumeOptions {
    pub volume_number: u64,
    pub max_volume_size_mb: u64,
    pub enable_compression: bool,
}

/// One self-describing backup file.  Concrete variants: the on-disk
/// [`DiskVolume`] and test doubles; the library owns volumes through
/// [`VolumeFactory`] so nothing here is global.
pub trait Volume {
    /// Open an existing volume and parse its descriptors.
    fn init(&mut self) -> Result<()>;
    /// Create a fresh volume: write the magic and stage the header.
    fn create(&mut self, options: VolumeOptions) -> Result<()>;

    fn filename(&self) -> &str;
    fn volume_number(&self) -> u64;
    fn is_cancelled(&self) -> bool;
    fn has_descriptor2(&self) -> bool;
    /// Offset of the newest snapshot's descriptor 2 in this volume.
    fn last_backup_offset(&self) -> u64;

    fn has_chunk(&self, md5sum: Md5Digest) -> bool;
    /// Merge this volume's chunk index into `out`.
    fn get_chunks(&self, out: &mut ChunkMap);
    /// Merge this volume's label registry into `out`.
    fn get_labels(&self, out: &mut LabelMap);
    /// Replace the label registry to be serialized at close.
    fn set_labels(&mut self, labels: LabelMap);

    /// Append a chunk at EOF; returns the chunk header's offset.
    fn write_chunk(
        &mut self,
        md5sum: Md5Digest,
        data: &[u8],
        unencoded_size: u64,
        encoding: EncodingType,
    ) -> Result<u64>;
    /// Read a chunk's payload and its encoding.
    fn read_chunk(&mut self, chunk: &FileChunk) -> Result<(Vec<u8>, EncodingType)>;

    /// Close the volume without a snapshot (the backup continues in a
    /// later volume).
    fn close(&mut self) -> Result<()>;
    /// Close the volume, committing `fileset` as a snapshot.
    fn close_with_fileset(&mut self, fileset: &FileSet) -> Result<()>;
    /// Close the volume flagged as cancelled: descriptor 1 but no
    /// snapshot.
    fn cancel(&mut self) -> Result<()>;

    /// Load snapshots backward from the newest in this volume, following
    /// `previous_backup` refs.  Returns the sets read here plus the ref
    /// to continue from when the chain leaves this volume.  Stops after
    /// the first full backup unless `load_all`.
    fn load_filesets(&mut self, load_all: bool) -> Result<(Vec<FileSet>, Option<BackupRef>)>;
    /// Same, but starting from an explicit descriptor 2 offset.
    fn load_filesets_from(
        &mut self,
        offset: u64,
        load_all: bool,
    ) -> Result<(Vec<FileSet>, Option<BackupRef>)>;
    /// Load the single snapshot whose descriptor 2 is at `offset`.
    fn load_fileset_at(&mut self, offset: u64) -> Result<FileSet>;

    /// Current on-disk length plus a lower-bound estimate of descriptor 1
    /// (excluding any descriptor 2).  Drives bin-packing and roll-over.
    fn estimated_size(&mut self) -> Result<u64>;
    /// Current on-disk length alone.
    fn disk_size(&mut self) -> Result<u64>;
}

/// Factory seam: the library materializes volumes by filename.
pub trait VolumeFactory {
    fn create(&self, filename: &str) -> Box<dyn Volume>;
}

// ── DiskVolume ───────────────────────────────────────────────────────────────

pub struct DiskVolume {
    file: Box<dyn FileIo>,
    chunks: ChunkMap,
    labels: LabelMap,
    descriptor_header: DescriptorHeader,
    /// Offset of the newest descriptor 2, when present.
    descriptor2_offset: u64,
    modified: bool,
}

impl DiskVolume {
    pub fn new(file: Box<dyn FileIo>) -> Self {
        Self {
            file,
            chunks: ChunkMap::new(),
            labels: LabelMap::new(),
            descriptor_header: DescriptorHeader::default(),
            descriptor2_offset: 0,
            modified: false,
        }
    }

    fn check_magic(&mut self) -> Result<()> {
        self.file.seek(0)?;
        let mut magic = [0u8; MAGIC.len()];
        let read = self.file.read(&mut magic)?;
        if read < magic.len() || &magic != MAGIC {
            return Err(Error::CorruptBackup(format!(
                "Not a recognized backup volume: {}",
                self.file.filename()
            )));
        }
        Ok(())
    }

    fn read_record(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_string(&mut self, size: u64) -> Result<String> {
        // A counted string can never extend past EOF; a length that does
        // is a corrupt descriptor, not an allocation request.
        let remaining = self.file.size()?.saturating_sub(self.file.tell()?);
        if size > remaining {
            return Err(Error::CorruptBackup(format!(
                "Stored string of {size} bytes exceeds the {remaining} left in the volume"
            )));
        }
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| Error::CorruptBackup("Stored name is not valid UTF-8".to_string()))
    }

    /// Read the fixed tail and descriptor 1, populating the chunk and
    /// label maps.  Leaves the read position just past descriptor 1's
    /// records — the descriptor 2 offset, if one is present.
    fn check_descriptors(&mut self) -> Result<()> {
        let file_size = self.file.size()?;
        let min_size = (MAGIC.len() + DescriptorHeader::SIZE) as u64;
        if file_size < min_size {
            return Err(Error::CorruptBackup(format!(
                "Volume is only {file_size} bytes: {}",
                self.file.filename()
            )));
        }

        self.file.seek(-(DescriptorHeader::SIZE as i64))?;
        let buf = self.read_record(DescriptorHeader::SIZE)?;
        let header = DescriptorHeader::parse(&buf)?;
        if header.descriptor_1_offset >= file_size {
            return Err(Error::CorruptBackup(format!(
                "Descriptor 1 offset {:#x} is past EOF",
                header.descriptor_1_offset
            )));
        }

        self.file.seek(header.descriptor_1_offset as i64)?;
        let buf = self.read_record(Descriptor1::SIZE)?;
        let descriptor1 = Descriptor1::parse(&buf)?;

        for _ in 0..descriptor1.total_chunks {
            let buf = self.read_record(Descriptor1Chunk::SIZE)?;
            self.chunks.add(Descriptor1Chunk::parse(&buf)?);
        }
        for _ in 0..descriptor1.total_labels {
            let buf = self.read_record(Descriptor1Label::SIZE)?;
            let record = Descriptor1Label::parse(&buf)?;
            let name = self.read_string(record.name_size)?;
            self.labels.set_last_backup(
                record.id,
                &name,
                record.last_backup_volume,
                record.last_backup_offset,
            );
        }

        if header.descriptor_2_present {
            // Descriptor 2 sits right where descriptor 1's records end.
            self.descriptor2_offset = self.file.tell()?;
        }
        self.descriptor_header = header;
        Ok(())
    }

    fn write_descriptor1(&mut self) -> Result<()> {
        self.file.seek_eof()?;
        self.descriptor_header.descriptor_1_offset = self.file.tell()?;
        debug!(
            "writing descriptor 1 at {:#x} ({} chunks, {} labels)",
            self.descriptor_header.descriptor_1_offset,
            self.chunks.len(),
            self.labels.len()
        );

        let descriptor1 = Descriptor1 {
            total_chunks: self.chunks.len() as u64,
            total_labels: self.labels.len() as u64,
        };
        self.file.write(&descriptor1.encode())?;
        for chunk in self.chunks.iter() {
            self.file.write(&chunk.encode())?;
        }
        for label in self.labels.iter() {
            let record = Descriptor1Label {
                id: label.id,
                last_backup_offset: label.last_backup_offset,
                last_backup_volume: label.last_backup_volume,
                name_size: label.name.len() as u64,
            };
            self.file.write(&record.encode())?;
            self.file.write(label.name.as_bytes())?;
        }
        Ok(())
    }

    /// Total on-disk size of descriptor 1 with the current chunk and
    /// label maps.  Descriptor 2 lands immediately after it, so this is
    /// what lets the label registry point at a descriptor 2 that is not
    /// written yet.
    fn descriptor1_disk_size(&self) -> u64 {
        Descriptor1::SIZE as u64
            + self.chunks.disk_size()
            + self
                .labels
                .iter()
                .map(|l| (Descriptor1Label::SIZE + l.name.len()) as u64)
                .sum::<u64>()
    }

    fn write_descriptor2(&mut self, fileset: &FileSet) -> Result<()> {
        self.file.seek_eof()?;
        let offset = self.file.tell()?;
        debug!(
            "writing descriptor 2 at {offset:#x} ({} files)",
            fileset.num_files()
        );

        let descriptor2 = Descriptor2 {
            previous_backup_offset: fileset.previous_backup.offset,
            previous_backup_volume: fileset.previous_backup.volume,
            parent_backup_offset: fileset.parent_backup.offset,
            parent_backup_volume: fileset.parent_backup.volume,
            backup_date: fileset.date,
            backup_type: fileset.backup_type() as u32,
            unencoded_size: fileset.unencoded_size,
            encoded_size: fileset.encoded_size,
            deduplicated_size: fileset.deduplicated_size,
            num_files: fileset.num_files(),
            label_id: fileset.label_id,
            description_size: fileset.description().len() as u64,
        };
        self.file.write(&descriptor2.encode())?;
        self.file.write(fileset.description().as_bytes())?;

        for entry in fileset.files() {
            let mut metadata = entry.metadata().clone();
            metadata.filename_size = entry.filename().len() as u64;
            metadata.symlink_target_size =
                entry.symlink_target().map(|t| t.len() as u64).unwrap_or(0);
            self.file.write(&metadata.encode())?;
            self.file.write(entry.filename().as_bytes())?;
            if let Some(target) = entry.symlink_target() {
                self.file.write(target.as_bytes())?;
            }
            for chunk in entry.chunks() {
                self.file.write(&chunk.encode())?;
            }
        }

        self.descriptor2_offset = offset;
        self.descriptor_header.descriptor_2_present = true;
        Ok(())
    }

    fn write_descriptor_header(&mut self) -> Result<()> {
        self.file.seek_eof()?;
        let encoded = self.descriptor_header.encode();
        self.file.write(&encoded)?;
        Ok(())
    }

    fn read_file_entry(&mut self) -> Result<FileEntry> {
        let buf = self.read_record(BackupFile::SIZE)?;
        let metadata = BackupFile::parse(&buf)?;
        let filename = self.read_string(metadata.filename_size)?;

        let file_type = FileType::from_u32(metadata.file_type).ok_or_else(|| {
            Error::CorruptBackup(format!("Unknown file type {}", metadata.file_type))
        })?;
        let symlink_target = if file_type == FileType::Symlink {
            Some(self.read_string(metadata.symlink_target_size)?)
        } else {
            None
        };

        let recorded_size = metadata.file_size;
        let num_chunks = metadata.num_chunks;
        let mut entry = FileEntry::new(filename, metadata, symlink_target);
        for _ in 0..num_chunks {
            let buf = self.read_record(FileChunk::SIZE)?;
            entry.add_chunk(FileChunk::parse(&buf)?);
        }
        // The recorded size must re-accumulate exactly from the chunks.
        if entry.file_size() != recorded_size {
            return Err(Error::CorruptBackup(format!(
                "File {} claims {recorded_size} bytes but its chunks sum to {}",
                entry.filename(),
                entry.file_size()
            )));
        }
        Ok(entry)
    }
}

impl Volume for DiskVolume {
    fn init(&mut self) -> Result<()> {
        self.file.open(Mode::Read)?;
        if let Err(e) = self.check_magic().and_then(|_| self.check_descriptors()) {
            self.file.close()?;
            return Err(e);
        }

        // Re-open for append so a bin-packed backup can continue here.
        self.file.close()?;
        self.file.open(Mode::Append)?;
        info!(
            "opened volume {} (number {}, {} chunks{})",
            self.file.filename(),
            self.descriptor_header.volume_number,
            self.chunks.len(),
            if self.descriptor_header.cancelled { ", cancelled" } else { "" }
        );
        Ok(())
    }

    fn create(&mut self, options: VolumeOptions) -> Result<()> {
        self.file.open(Mode::Append)?;
        if let Err(e) = self.file.write(MAGIC) {
            self.file.close().ok();
            self.file.unlink().ok();
            return Err(e);
        }

        self.descriptor_header.descriptor_1_offset = 0;
        self.descriptor_header.descriptor_2_present = false;
        self.descriptor_header.volume_number = options.volume_number;
        self.modified = true;
        info!("created volume {}", self.file.filename());
        Ok(())
    }

    fn filename(&self) -> &str {
        self.file.filename()
    }

    fn volume_number(&self) -> u64 {
        self.descriptor_header.volume_number
    }

    fn is_cancelled(&self) -> bool {
        self.descriptor_header.cancelled
    }

    fn has_descriptor2(&self) -> bool {
        self.descriptor_header.descriptor_2_present
    }

    fn last_backup_offset(&self) -> u64 {
        self.descriptor2_offset
    }

    fn has_chunk(&self, md5sum: Md5Digest) -> bool {
        self.chunks.has_chunk(md5sum)
    }

    fn get_chunks(&self, out: &mut ChunkMap) {
        out.merge(&self.chunks);
    }

    fn get_labels(&self, out: &mut LabelMap) {
        out.merge(&self.labels);
    }

    fn set_labels(&mut self, labels: LabelMap) {
        self.labels = labels;
    }

    fn write_chunk(
        &mut self,
        md5sum: Md5Digest,
        data: &[u8],
        unencoded_size: u64,
        encoding: EncodingType,
    ) -> Result<u64> {
        self.file.seek_eof()?;
        let offset = self.file.tell()?;

        let header = ChunkHeader {
            md5sum,
            unencoded_size,
            encoded_size: data.len() as u64,
            encoding_type: encoding,
        };
        self.file.write(&header.encode())?;
        self.file.write(data)?;

        self.chunks.add(Descriptor1Chunk {
            md5sum,
            offset,
            volume_number: self.volume_number(),
        });
        self.modified = true;
        Ok(offset)
    }

    fn read_chunk(&mut self, chunk: &FileChunk) -> Result<(Vec<u8>, EncodingType)> {
        let offset = match self.chunks.get_chunk(chunk.md5sum) {
            Some(entry) => entry.offset,
            // Fall back on the redundant offset carried by the file
            // chunk itself; descriptor 1 may not have been recoverable.
            None => chunk.volume_offset,
        };

        self.file.seek(offset as i64)?;
        let buf = self.read_record(ChunkHeader::SIZE)?;
        let header = ChunkHeader::parse(&buf)?;
        if header.md5sum != chunk.md5sum {
            return Err(Error::CorruptBackup(format!(
                "Chunk at {offset:#x} has digest {}, expected {}",
                header.md5sum, chunk.md5sum
            )));
        }

        let mut payload = vec![0u8; header.encoded_size as usize];
        self.file.read_exact(&mut payload)?;
        Ok((payload, header.encoding_type))
    }

    fn close(&mut self) -> Result<()> {
        if self.modified {
            self.write_descriptor1()?;
            // No fileset: the backup continues in a later volume, so any
            // prior snapshot in this file is reachable only through the
            // label registry, never the tail header.
            self.descriptor_header.descriptor_2_present = false;
            self.write_descriptor_header()?;
        }
        self.file.close()?;
        self.modified = false;
        Ok(())
    }

    fn close_with_fileset(&mut self, fileset: &FileSet) -> Result<()> {
        // Descriptor 1 carries the label registry, which must point at
        // the descriptor 2 written right after it.  Descriptor 1's size
        // is fully determined, so the descriptor 2 offset is computed
        // up front and the label advanced before either is written.
        self.file.seek_eof()?;
        let descriptor1_offset = self.file.tell()?;
        let volume_number = self.volume_number();
        self.labels
            .set_last_backup(fileset.label_id, &fileset.label_name, volume_number, 0);
        let descriptor2_offset = descriptor1_offset + self.descriptor1_disk_size();
        self.labels.set_last_backup(
            fileset.label_id,
            &fileset.label_name,
            volume_number,
            descriptor2_offset,
        );

        self.write_descriptor1()?;
        self.write_descriptor2(fileset)?;
        if self.descriptor2_offset != descriptor2_offset {
            return Err(Error::Unknown(format!(
                "Descriptor 2 landed at {:#x}, label registry says {descriptor2_offset:#x}",
                self.descriptor2_offset
            )));
        }
        self.write_descriptor_header()?;
        self.file.close()?;
        self.modified = false;
        Ok(())
    }

    fn cancel(&mut self) -> Result<()> {
        warn!("cancelling volume {}", self.file.filename());
        self.write_descriptor1()?;
        self.descriptor_header.descriptor_2_present = false;
        self.descriptor_header.cancelled = true;
        self.write_descriptor_header()?;
        self.file.close()?;
        self.modified = false;
        Ok(())
    }

    fn load_filesets(&mut self, load_all: bool) -> Result<(Vec<FileSet>, Option<BackupRef>)> {
        if !self.has_descriptor2() {
            if self.is_cancelled() {
                // Cancelled volumes hold chunks but no snapshots.
                return Ok((Vec::new(), None));
            }
            return Err(Error::NotLastVolume(self.file.filename().to_string()));
        }
        let offset = self.descriptor2_offset;
        self.load_filesets_from(offset, load_all)
    }

    fn load_filesets_from(
        &mut self,
        offset: u64,
        load_all: bool,
    ) -> Result<(Vec<FileSet>, Option<BackupRef>)> {
        let mut filesets = Vec::new();
        let mut current = BackupRef { volume: self.volume_number(), offset };

        while !current.is_null() {
            if current.volume != self.volume_number() {
                // The chain continues in another volume.
                return Ok((filesets, Some(current)));
            }
            let fileset = self.load_fileset_at(current.offset)?;
            let previous = fileset.previous_backup;
            let is_full = fileset.backup_type() == BackupType::Full;
            filesets.push(fileset);
            if is_full && !load_all {
                break;
            }
            current = previous;
        }
        Ok((filesets, None))
    }

    fn load_fileset_at(&mut self, offset: u64) -> Result<FileSet> {
        self.file.seek(offset as i64)?;
        let buf = self.read_record(Descriptor2::SIZE)?;
        let descriptor2 = Descriptor2::parse(&buf)?;
        let description = self.read_string(descriptor2.description_size)?;
        let backup_type = BackupType::from_u32(descriptor2.backup_type).ok_or_else(|| {
            Error::CorruptBackup(format!("Unknown backup type {}", descriptor2.backup_type))
        })?;
        debug!("found backup \"{description}\" at {offset:#x}");

        let mut fileset = FileSet::new(description, backup_type);
        fileset.date = descriptor2.backup_date;
        fileset.label_id = descriptor2.label_id;
        if let Some(label) = self.labels.get(descriptor2.label_id) {
            fileset.label_name = label.name.clone();
        }
        fileset.previous_backup = BackupRef {
            volume: descriptor2.previous_backup_volume,
            offset: descriptor2.previous_backup_offset,
        };
        fileset.parent_backup = BackupRef {
            volume: descriptor2.parent_backup_volume,
            offset: descriptor2.parent_backup_offset,
        };
        fileset.unencoded_size = descriptor2.unencoded_size;
        fileset.encoded_size = descriptor2.encoded_size;
        fileset.deduplicated_size = descriptor2.deduplicated_size;

        for _ in 0..descriptor2.num_files {
            let entry = self.read_file_entry()?;
            fileset.add_file(entry);
        }
        Ok(fileset)
    }

    fn estimated_size(&mut self) -> Result<u64> {
        Ok(self.disk_size()? + self.chunks.disk_size() + Descriptor1::SIZE as u64)
    }

    fn disk_size(&mut self) -> Result<u64> {
        self.file.size()
    }
}

impl Drop for DiskVolume {
    fn drop(&mut self) {
        if self.modified {
            warn!(
                "volume {} dropped without closing; expect data loss",
                self.file.filename()
            );
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Produces [`DiskVolume`]s over [`crate::file::OsFile`]s.
pub struct DiskVolumeFactory;

impl VolumeFactory for DiskVolumeFactory {
    fn create(&self, filename: &str) -> Box<dyn Volume> {
        Box::new(DiskVolume::new(Box::new(crate::file::OsFile::new(filename))))
    }
}
