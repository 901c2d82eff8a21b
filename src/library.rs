//! Cross-volume coordinator: the library.
//!
//! A library is every volume sharing one basename plus the state that
//! spans them — the union chunk index used for deduplication, the label
//! registry, and the snapshot chains.  The library owns its volumes
//! through a factory, keeps a single-slot cache of the most recently
//! opened one, and reaches out to a media-change callback when a volume
//! file is missing.
//!
//! Exactly one backup may be under construction per library handle, and
//! all mutating calls come from one owner at a time.

use log::{debug, info, warn};

use crate::chunk_map::ChunkMap;
use crate::encoder::Encoder;
use crate::error::{Error, Result};
use crate::file::{filename_from_volume, find_basename_and_last_volume};
use crate::fileset::{BackupRef, FileEntry, FileSet};
use crate::hash::Digester;
use crate::labels::{Label, LabelMap, DEFAULT_LABEL_NAME, LABEL_ID_ALLOCATE, LABEL_ID_DEFAULT};
use crate::records::{BackupFile, BackupType, Descriptor1Chunk, EncodingType, FileChunk};
use crate::volume::{Volume, VolumeFactory, VolumeOptions};

/// Bin-packing headroom in MB: a volume is only reopened for append when
/// at least this much room remains below the size cap, so the closing
/// descriptors always have somewhere to land.
pub const MAX_SIZE_THRESHOLD_MB: u64 = 1;

const MB: u64 = 1024 * 1024;

/// Called when a volume file is missing: receives the filename the
/// library wanted and returns a user-chosen replacement path, or `None`
/// to give up.  Must not re-enter the library.
pub type VolumeChangeCallback = Box<dyn Fn(&str) -> Option<String>>;

/// Per-backup configuration.
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub description: String,
    pub backup_type: BackupType,
    pub enable_compression: bool,
    /// 0 disables splitting: backups grow one volume without bound.
    pub max_volume_size_mb: u64,
    /// `LABEL_ID_ALLOCATE` (0) allocates a fresh id when `label_name`
    /// names a new label, else falls back to the default label.
    pub label_id: u64,
    pub label_name: String,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            description: String::new(),
            backup_type: BackupType::Invalid,
            enable_compression: false,
            max_volume_size_mb: 0,
            label_id: LABEL_ID_ALLOCATE,
            label_name: String::new(),
        }
    }
}

pub struct BackupLibrary {
    basename: String,
    last_volume: u64,
    num_volumes: u64,
    digester: Box<dyn Digester>,
    encoder: Box<dyn Encoder>,
    factory: Box<dyn VolumeFactory>,
    volume_change_callback: Option<VolumeChangeCallback>,
    /// Union of chunk entries across every volume seen.
    chunks: ChunkMap,
    labels: LabelMap,
    options: BackupOptions,
    /// The snapshot under construction, between `create_backup` and
    /// `close_backup`/`cancel_backup`.
    file_set: Option<FileSet>,
    current_volume: Option<Box<dyn Volume>>,
    /// Read cache, one slot.
    cached_volume: Option<Box<dyn Volume>>,
}

impl BackupLibrary {
    /// `path` may name any volume of the series, or one that does not
    /// exist yet.  Call [`init`](Self::init) before anything else.
    pub fn new(
        path: impl Into<String>,
        digester: Box<dyn Digester>,
        encoder: Box<dyn Encoder>,
        factory: Box<dyn VolumeFactory>,
    ) -> Self {
        Self {
            basename: path.into(),
            last_volume: 0,
            num_volumes: 0,
            digester,
            encoder,
            factory,
            volume_change_callback: None,
            chunks: ChunkMap::new(),
            labels: LabelMap::new(),
            options: BackupOptions::default(),
            file_set: None,
            current_volume: None,
            cached_volume: None,
        }
    }

    pub fn set_volume_change_callback(&mut self, callback: VolumeChangeCallback) {
        self.volume_change_callback = Some(callback);
    }

    /// Discover the volume series and load the label registry from the
    /// highest non-cancelled volume.  Succeeds on a path that does not
    /// exist yet: the library is then ready to create volume 0.
    pub fn init(&mut self) -> Result<()> {
        let (basename, last_volume, num_volumes) =
            find_basename_and_last_volume(&self.basename)?;
        info!("library {basename}: {num_volumes} volume(s), last {last_volume}");
        self.basename = basename;
        self.last_volume = last_volume;
        self.num_volumes = num_volumes;

        if self.num_volumes > 0 {
            self.load_labels()?;
        }
        Ok(())
    }

    /// Rebuild the active registry from the highest volume that is not
    /// cancelled; all-cancelled (or missing) series yield an empty one.
    fn load_labels(&mut self) -> Result<()> {
        for volume_num in (0..=self.last_volume).rev() {
            match self.get_volume(volume_num, false) {
                Ok(volume) => {
                    if volume.is_cancelled() {
                        continue;
                    }
                    let mut labels = LabelMap::new();
                    volume.get_labels(&mut labels);
                    self.labels = labels;
                    return Ok(());
                }
                Err(Error::NoSuchFile(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn last_volume(&self) -> u64 {
        self.last_volume
    }

    pub fn get_labels(&self) -> Vec<Label> {
        self.labels.iter().cloned().collect()
    }

    /// Location of the most recent snapshot anywhere in the library.
    /// Snapshots commit at strictly increasing `(volume, offset)`
    /// positions, so the lexicographic maximum over the registry is the
    /// temporal maximum.
    fn newest_snapshot_ref(&self) -> BackupRef {
        let mut newest = BackupRef::default();
        for label in self.labels.iter() {
            let candidate = BackupRef {
                volume: label.last_backup_volume,
                offset: label.last_backup_offset,
            };
            if candidate.is_null() {
                continue;
            }
            if newest.is_null()
                || (candidate.volume, candidate.offset) > (newest.volume, newest.offset)
            {
                newest = candidate;
            }
        }
        newest
    }

    // ── Volume access ────────────────────────────────────────────────────────

    /// Open (or create) the numbered volume, going through the one-slot
    /// cache.  A missing volume consults the media-change callback
    /// before giving up.
    fn get_volume(
        &mut self,
        volume_num: u64,
        create_if_not_exist: bool,
    ) -> Result<&mut Box<dyn Volume>> {
        let cached_matches = self
            .cached_volume
            .as_ref()
            .map(|v| v.volume_number() == volume_num)
            .unwrap_or(false);

        if !cached_matches {
            let filename = filename_from_volume(&self.basename, volume_num);
            debug!("loading backup volume {filename}");
            let mut volume = self.factory.create(&filename);
            match volume.init() {
                Ok(()) => {}
                Err(Error::NoSuchFile(_)) if create_if_not_exist => {
                    volume.create(VolumeOptions {
                        volume_number: volume_num,
                        max_volume_size_mb: self.options.max_volume_size_mb,
                        enable_compression: self.options.enable_compression,
                    })?;
                }
                Err(Error::NoSuchFile(_)) => {
                    volume = self.change_volume(&filename, volume_num)?;
                }
                Err(e) => return Err(e),
            }
            self.cached_volume = Some(volume);
        }

        self.cached_volume
            .as_mut()
            .ok_or_else(|| Error::Unknown("Volume cache went empty".to_string()))
    }

    /// Like `get_volume` but transfers ownership out of the cache for
    /// use as the write volume.
    fn take_volume(&mut self, volume_num: u64, create: bool) -> Result<Box<dyn Volume>> {
        self.get_volume(volume_num, create)?;
        self.cached_volume
            .take()
            .ok_or_else(|| Error::Unknown("Volume cache went empty".to_string()))
    }

    /// Ask the media-change callback for a replacement path until it
    /// produces a volume with the right number or gives up.
    fn change_volume(&self, original: &str, volume_num: u64) -> Result<Box<dyn Volume>> {
        let callback = self
            .volume_change_callback
            .as_ref()
            .ok_or_else(|| Error::NoSuchFile(original.to_string()))?;

        let mut wanted = original.to_string();
        loop {
            let replacement = callback(&wanted)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| Error::NoSuchFile(original.to_string()))?;
            let mut volume = self.factory.create(&replacement);
            match volume.init() {
                Ok(()) => {
                    if volume.volume_number() == volume_num {
                        return Ok(volume);
                    }
                    warn!(
                        "{replacement} is volume {}, wanted {volume_num}",
                        volume.volume_number()
                    );
                    wanted = replacement;
                }
                Err(Error::NoSuchFile(_)) => wanted = replacement,
                Err(e) => return Err(e),
            }
        }
    }

    // ── Chunk-data union ─────────────────────────────────────────────────────

    /// Walk volumes highest to lowest merging their chunk indices into
    /// the union.  Required before the first `add_chunk` of a backup;
    /// restore-only workflows never call it.  Missing volumes are
    /// skipped, as are volumes whose descriptors cannot be recovered
    /// (an interrupted backup with no trailer) — their chunks simply
    /// will not deduplicate.
    pub fn load_all_chunk_data(&mut self) -> Result<()> {
        for volume_num in (0..=self.last_volume).rev() {
            match self.get_volume(volume_num, false) {
                Ok(volume) => {
                    let mut per_volume = ChunkMap::new();
                    volume.get_chunks(&mut per_volume);
                    self.chunks.merge(&per_volume);
                }
                Err(Error::NoSuchFile(f)) => {
                    debug!("volume {volume_num} missing during chunk scan: {f}");
                }
                Err(Error::CorruptBackup(f)) => {
                    warn!("volume {volume_num} unreadable during chunk scan: {f}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ── Backup creation ──────────────────────────────────────────────────────

    /// Begin a new backup: resolve the label, populate the dedup union,
    /// pick or create the write volume, and stamp the snapshot's chain
    /// references.
    pub fn create_backup(&mut self, options: BackupOptions) -> Result<()> {
        if self.file_set.is_some() {
            return Err(Error::GenericError(
                "A backup is already in progress".to_string(),
            ));
        }

        let (label_id, label_name) = self.resolve_label(&options);
        let mut file_set = FileSet::new(options.description.clone(), options.backup_type);
        file_set.date = chrono::Utc::now().timestamp() as u64;
        file_set.label_id = label_id;
        file_set.label_name = label_name;
        self.options = options;

        if self.chunks.is_empty() {
            info!("loading chunk data");
            match self.load_all_chunk_data() {
                Ok(()) | Err(Error::NoSuchFile(_)) => {}
                Err(e) => return Err(e),
            }
        }

        // Chain references: previous = newest snapshot library-wide,
        // parent = the label's newest snapshot.
        file_set.previous_backup = self.newest_snapshot_ref();
        file_set.parent_backup = self
            .labels
            .get(file_set.label_id)
            .map(|l| BackupRef { volume: l.last_backup_volume, offset: l.last_backup_offset })
            .unwrap_or_default();

        self.open_write_volume()?;
        self.file_set = Some(file_set);
        Ok(())
    }

    fn resolve_label(&self, options: &BackupOptions) -> (u64, String) {
        if options.label_id != LABEL_ID_ALLOCATE {
            let name = if options.label_name.is_empty() {
                self.labels
                    .get(options.label_id)
                    .map(|l| l.name.clone())
                    .unwrap_or_else(|| DEFAULT_LABEL_NAME.to_string())
            } else {
                options.label_name.clone()
            };
            return (options.label_id, name);
        }
        if options.label_name.is_empty() || options.label_name == DEFAULT_LABEL_NAME {
            return (LABEL_ID_DEFAULT, DEFAULT_LABEL_NAME.to_string());
        }
        // A named label with id 0: allocate a fresh id now.
        (self.labels.allocate_id(), options.label_name.clone())
    }

    /// Pick the volume new chunks go to.  An empty series starts volume
    /// 0; otherwise the highest volume is reopened for append while it
    /// has `MAX_SIZE_THRESHOLD_MB` of headroom (bin-packing), else the
    /// next volume number is allocated.
    fn open_write_volume(&mut self) -> Result<()> {
        if self.num_volumes == 0 {
            info!("new library, creating volume 0");
            let volume = self.take_volume(0, true)?;
            self.num_volumes = 1;
            self.current_volume = Some(volume);
            return Ok(());
        }

        let max_size_mb = self.options.max_volume_size_mb;
        let mut volume = self.take_volume(self.last_volume, false)?;
        if !volume.is_cancelled() {
            let has_room = max_size_mb == 0
                || volume.disk_size()? + MAX_SIZE_THRESHOLD_MB * MB <= max_size_mb * MB;
            if has_room {
                debug!("bin-packing onto volume {}", volume.volume_number());
                self.current_volume = Some(volume);
                return Ok(());
            }
        }
        volume.close()?;

        self.last_volume += 1;
        debug!("allocating volume {}", self.last_volume);
        let volume = self.take_volume(self.last_volume, true)?;
        self.num_volumes += 1;
        self.current_volume = Some(volume);
        Ok(())
    }

    /// Add a file to the backup under construction, returning a handle
    /// for chunk appends.
    pub fn create_file(
        &mut self,
        filename: impl Into<String>,
        metadata: BackupFile,
        symlink_target: Option<String>,
    ) -> Result<usize> {
        let file_set = self
            .file_set
            .as_mut()
            .ok_or_else(|| Error::GenericError("No backup in progress".to_string()))?;
        Ok(file_set.add_file(FileEntry::new(filename, metadata, symlink_target)))
    }

    /// Add one chunk of file data at `chunk_offset` within its source
    /// file.  Deduplicates against the union index, compresses when
    /// enabled and profitable, and rolls over to a new volume when the
    /// current one is full.
    pub fn add_chunk(&mut self, data: &[u8], chunk_offset: u64, file: usize) -> Result<()> {
        let md5sum = self.digester.digest(data);

        let current_volume_num = match &self.current_volume {
            Some(volume) => volume.volume_number(),
            None => return Err(Error::GenericError("No backup in progress".to_string())),
        };

        let mut chunk = FileChunk {
            md5sum,
            volume_num: current_volume_num,
            volume_offset: 0,
            chunk_offset,
            unencoded_size: data.len() as u64,
        };

        if let Some(existing) = self.chunks.get_chunk(md5sum).copied() {
            // Dedup hit: reference the existing copy, write nothing.
            chunk.volume_num = existing.volume_number;
            chunk.volume_offset = existing.offset;
            let file_set = self
                .file_set
                .as_mut()
                .ok_or_else(|| Error::GenericError("No backup in progress".to_string()))?;
            file_set.unencoded_size += data.len() as u64;
            file_set.encoded_size += data.len() as u64;
            file_set.file_mut(file).add_chunk(chunk);
            return Ok(());
        }

        // New chunk: compress if enabled and the result is smaller.
        let (payload, encoding) = if self.options.enable_compression {
            let encoded = self.encoder.encode(data)?;
            if encoded.len() < data.len() {
                debug!("compressed {} to {}", data.len(), encoded.len());
                (encoded, EncodingType::Zlib)
            } else {
                (data.to_vec(), EncodingType::Raw)
            }
        } else {
            (data.to_vec(), EncodingType::Raw)
        };

        let offset = match self.current_volume.as_mut() {
            Some(volume) => volume.write_chunk(md5sum, &payload, data.len() as u64, encoding)?,
            None => return Err(Error::GenericError("No backup in progress".to_string())),
        };
        chunk.volume_offset = offset;
        self.chunks.add(Descriptor1Chunk {
            md5sum,
            offset,
            volume_number: current_volume_num,
        });

        let file_set = self
            .file_set
            .as_mut()
            .ok_or_else(|| Error::GenericError("No backup in progress".to_string()))?;
        file_set.unencoded_size += data.len() as u64;
        file_set.encoded_size += payload.len() as u64;
        file_set.deduplicated_size += payload.len() as u64;
        file_set.file_mut(file).add_chunk(chunk);

        self.roll_over_if_full()
    }

    /// Close the write volume (without a snapshot) and open the next one
    /// once the size estimate reaches the cap.
    fn roll_over_if_full(&mut self) -> Result<()> {
        let max_size_mb = self.options.max_volume_size_mb;
        if max_size_mb == 0 {
            return Ok(());
        }
        let full = match self.current_volume.as_mut() {
            Some(volume) => volume.estimated_size()? >= max_size_mb * MB,
            None => false,
        };
        if !full {
            return Ok(());
        }

        if let Some(mut volume) = self.current_volume.take() {
            info!("volume {} is full, rolling over", volume.volume_number());
            volume.set_labels(self.labels.clone());
            volume.close()?;
            let mut closed_chunks = ChunkMap::new();
            volume.get_chunks(&mut closed_chunks);
            self.chunks.merge(&closed_chunks);
        }

        self.last_volume += 1;
        let next = self.take_volume(self.last_volume, true)?;
        self.num_volumes += 1;
        self.current_volume = Some(next);
        Ok(())
    }

    /// Commit the backup under construction: descriptor 2 + header land
    /// on the write volume and the label registry advances.
    pub fn close_backup(&mut self) -> Result<()> {
        let file_set = self
            .file_set
            .take()
            .ok_or_else(|| Error::GenericError("No backup in progress".to_string()))?;
        let mut volume = self
            .current_volume
            .take()
            .ok_or_else(|| Error::GenericError("No write volume open".to_string()))?;

        volume.set_labels(self.labels.clone());
        volume.close_with_fileset(&file_set)?;

        self.labels.set_last_backup(
            file_set.label_id,
            &file_set.label_name,
            volume.volume_number(),
            volume.last_backup_offset(),
        );
        let mut closed_chunks = ChunkMap::new();
        volume.get_chunks(&mut closed_chunks);
        self.chunks.merge(&closed_chunks);
        info!(
            "backup \"{}\" committed to volume {}",
            file_set.description(),
            volume.volume_number()
        );
        Ok(())
    }

    /// Abort the backup under construction.  The write volume closes
    /// flagged cancelled: no snapshot, but its chunks stay available to
    /// future backups.
    pub fn cancel_backup(&mut self) -> Result<()> {
        self.file_set = None;
        if let Some(mut volume) = self.current_volume.take() {
            volume.set_labels(self.labels.clone());
            volume.cancel()?;
            let mut closed_chunks = ChunkMap::new();
            volume.get_chunks(&mut closed_chunks);
            self.chunks.merge(&closed_chunks);
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Read one chunk back: locate its volume, undo the encoding, and
    /// verify the digest end to end.
    pub fn read_chunk(&mut self, chunk: &FileChunk) -> Result<Vec<u8>> {
        let volume = self.get_volume(chunk.volume_num, false)?;
        let (payload, encoding) = volume.read_chunk(chunk)?;

        let data = match encoding {
            EncodingType::Zlib => self
                .encoder
                .decode(&payload, chunk.unencoded_size as usize)?,
            EncodingType::Raw => payload,
        };

        let md5sum = self.digester.digest(&data);
        if md5sum != chunk.md5sum {
            return Err(Error::CorruptBackup("Chunk MD5 mismatch".to_string()));
        }
        Ok(data)
    }

    /// Load snapshots newest → oldest across the whole library (every
    /// label), following `previous_backup` refs.  Stops at the most
    /// recent full backup unless `load_all`.
    pub fn load_filesets(&mut self, load_all: bool) -> Result<Vec<FileSet>> {
        let newest = self.newest_snapshot_ref();
        if newest.is_null() {
            return Ok(Vec::new());
        }

        let mut filesets = Vec::new();
        let mut next = Some(newest);
        while let Some(current) = next {
            let volume = self.get_volume(current.volume, false)?;
            let (mut sets, continuation) =
                volume.load_filesets_from(current.offset, load_all)?;
            debug!("{} fileset(s) from volume {}", sets.len(), current.volume);
            filesets.append(&mut sets);
            next = continuation;
        }
        self.fill_label_names(&mut filesets);
        Ok(filesets)
    }

    /// Load one label's snapshots newest → oldest, following
    /// `parent_backup` refs so other labels never appear.  Stops at the
    /// label's most recent full backup unless `load_all`.
    pub fn load_snapshots(&mut self, label_id: u64, load_all: bool) -> Result<Vec<FileSet>> {
        let mut next = self
            .labels
            .get(label_id)
            .map(|l| BackupRef { volume: l.last_backup_volume, offset: l.last_backup_offset })
            .unwrap_or_default();

        let mut filesets = Vec::new();
        while !next.is_null() {
            let volume = self.get_volume(next.volume, false)?;
            let fileset = volume.load_fileset_at(next.offset)?;
            if fileset.label_id != label_id {
                return Err(Error::CorruptBackup(format!(
                    "Snapshot at volume {} offset {:#x} belongs to label {}, expected {label_id}",
                    next.volume, next.offset, fileset.label_id
                )));
            }
            next = fileset.parent_backup;
            let stop = fileset.backup_type() == BackupType::Full && !load_all;
            filesets.push(fileset);
            if stop {
                break;
            }
        }
        self.fill_label_names(&mut filesets);
        Ok(filesets)
    }

    fn fill_label_names(&self, filesets: &mut [FileSet]) {
        for fileset in filesets {
            if fileset.label_name.is_empty() {
                if let Some(label) = self.labels.get(fileset.label_id) {
                    fileset.label_name = label.name.clone();
                }
            }
        }
    }

    /// Order `(chunk, file)` pairs by `(volume, offset)` so a restore or
    /// verify makes at most one forward sweep per volume.  The returned
    /// index refers into `files`.
    pub fn optimize_chunks_for_restore(files: &[&FileEntry]) -> Vec<(FileChunk, usize)> {
        let mut plan: Vec<(FileChunk, usize)> = Vec::new();
        for (index, entry) in files.iter().enumerate() {
            for chunk in entry.chunks() {
                plan.push((*chunk, index));
            }
        }
        plan.sort_by_key(|(chunk, _)| (chunk.volume_num, chunk.volume_offset));
        plan
    }
}

impl Drop for BackupLibrary {
    fn drop(&mut self) {
        if self.current_volume.is_some() {
            warn!("library dropped mid-backup; cancelling volume");
            if let Err(e) = self.cancel_backup() {
                warn!("cancel on drop failed: {e}");
            }
        }
    }
}
