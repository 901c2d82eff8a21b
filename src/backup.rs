//! Backup engine: walks a selected file set, chunks it, and feeds the
//! library.
//!
//! The three backup types share one output path and differ only in the
//! file list they submit:
//! - **Full** — the selected paths, directories traversed.
//! - **Incremental** — selected paths compared against the union of all
//!   snapshots back to the label's most recent full backup.
//! - **Differential** — compared against the most recent full backup
//!   alone.
//!
//! A file makes an incremental/differential list iff it is new or its
//! modification time or size changed.  Deleted files are not tracked;
//! older snapshots still hold them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::encoder::ZlibEncoder;
use crate::error::{Error, Result};
use crate::file::{FileIo, Mode, OsFile};
use crate::hash::Md5Generator;
use crate::library::{BackupLibrary, BackupOptions, VolumeChangeCallback};
use crate::labels::{Label, LABEL_ID_ALLOCATE, LABEL_ID_DEFAULT};
use crate::records::{BackupFile, BackupType, FileType};
use crate::volume::DiskVolumeFactory;

/// Read window for chunking source files: 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Progress is reported after at least this many new bytes: 1 MiB.
const PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// `(completed_bytes, total_bytes)` callback, invoked every
/// [`PROGRESS_INTERVAL`] of completed work.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

// ── Shadow-copy seam ─────────────────────────────────────────────────────────

/// Snapshot-the-filesystem capability.  The default implementation does
/// nothing; a platform integration can map source paths into a
/// consistent point-in-time view.
pub trait ShadowCopy {
    fn create_shadow_copies(&mut self, _paths: &[String]) -> Result<()> {
        Ok(())
    }
    fn convert_filename(&self, filename: &str) -> String {
        filename.to_string()
    }
}

/// The no-op shadow copy used everywhere a platform one is not injected.
pub struct NoopShadowCopy;

impl ShadowCopy for NoopShadowCopy {}

// ── Driver ───────────────────────────────────────────────────────────────────

pub struct BackupDriver {
    paths: Vec<String>,
    /// Path of (any volume of) the destination library.
    destination: String,
    options: BackupOptions,
    vss: Box<dyn ShadowCopy>,
    cancel: Arc<AtomicBool>,
    volume_change_callback: Option<VolumeChangeCallback>,
}

impl BackupDriver {
    pub fn new(paths: Vec<String>, destination: impl Into<String>, options: BackupOptions) -> Self {
        Self {
            paths,
            destination: destination.into(),
            options,
            vss: Box::new(NoopShadowCopy),
            cancel: Arc::new(AtomicBool::new(false)),
            volume_change_callback: None,
        }
    }

    pub fn with_shadow_copy(mut self, vss: Box<dyn ShadowCopy>) -> Self {
        self.vss = vss;
        self
    }

    pub fn set_volume_change_callback(&mut self, callback: VolumeChangeCallback) {
        self.volume_change_callback = Some(callback);
    }

    /// Shared flag polled at chunk boundaries; set it from another
    /// thread to stop the backup.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Enumerate the labels of the library at `path`, without touching
    /// its chunk data.
    pub fn get_labels(path: &str) -> Result<Vec<Label>> {
        let mut library = open_library(path)?;
        library.init()?;
        Ok(library.get_labels())
    }

    /// Run the backup to completion (or cancellation).  Returns true if
    /// the snapshot was committed, false if cancelled.
    pub fn perform_backup(&mut self, progress: Option<&mut ProgressFn>) -> Result<bool> {
        info!("performing {} backup", self.options.backup_type.name());
        let mut library = open_library(&self.destination)?;
        library.init()?;
        if let Some(callback) = self.volume_change_callback.take() {
            library.set_volume_change_callback(callback);
        }

        let (filelist, total_size) = match self.options.backup_type {
            BackupType::Full => self.load_full_filelist()?,
            BackupType::Incremental => self.load_incremental_filelist(&mut library, false)?,
            BackupType::Differential => self.load_incremental_filelist(&mut library, true)?,
            BackupType::Invalid => {
                return Err(Error::GenericError("Invalid backup type".to_string()))
            }
        };
        info!("backing up {} file(s), {total_size} bytes", filelist.len());

        self.vss.create_shadow_copies(&filelist)?;

        library.create_backup(self.options.clone())?;
        let committed = self.store_files(&mut library, &filelist, total_size, progress)?;
        if committed {
            library.close_backup()?;
        }
        Ok(committed)
    }

    /// Read every file in `filelist` through the library in
    /// [`CHUNK_SIZE`] windows.  Returns false if cancelled (the library
    /// is left cancelled too).
    fn store_files(
        &mut self,
        library: &mut BackupLibrary,
        filelist: &[String],
        total_size: u64,
        mut progress: Option<&mut ProgressFn>,
    ) -> Result<bool> {
        let mut completed: u64 = 0;
        let mut since_last_update: u64 = 0;

        for filename in filelist {
            debug!("processing {filename}");
            let source_name = self.vss.convert_filename(filename);
            let mut source = OsFile::new(source_name.as_str());

            let mut metadata = BackupFile::default();
            let symlink_target = match source.fill_metadata(&mut metadata) {
                Ok(target) => target,
                Err(e) => {
                    warn!("skipping {filename}: {e}");
                    continue;
                }
            };
            let file = library.create_file(filename.clone(), metadata.clone(), symlink_target)?;

            // Directories and symlinks carry no chunks.
            if FileType::from_u32(metadata.file_type) != Some(FileType::Regular) {
                continue;
            }

            source.open(Mode::Read)?;
            let mut offset: u64 = 0;
            let mut window = vec![0u8; CHUNK_SIZE];
            loop {
                if self.cancel.load(Ordering::Relaxed) {
                    info!("backup cancelled");
                    source.close()?;
                    library.cancel_backup()?;
                    return Ok(false);
                }

                let read = source.read(&mut window)?;
                if read > 0 {
                    library.add_chunk(&window[..read], offset, file)?;
                    offset += read as u64;
                    completed += read as u64;
                    since_last_update += read as u64;
                    if since_last_update > PROGRESS_INTERVAL {
                        since_last_update = 0;
                        if let Some(f) = progress.as_deref_mut() {
                            f(completed, total_size);
                        }
                    }
                }
                if read < window.len() {
                    break;
                }
            }
            source.close()?;
        }

        if let Some(f) = progress.as_deref_mut() {
            f(completed, total_size);
        }
        Ok(true)
    }

    /// Full backups store the selection verbatim, traversing
    /// directories.
    fn load_full_filelist(&self) -> Result<(Vec<String>, u64)> {
        let mut filelist = Vec::new();
        let mut total_size = 0u64;
        for path in &self.paths {
            for entry in WalkDir::new(path).follow_links(false) {
                let entry = entry
                    .map_err(|e| Error::GenericError(format!("walking {path}: {e}")))?;
                let name = entry.path().to_string_lossy().into_owned();
                if entry.file_type().is_file() {
                    total_size += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
                filelist.push(name);
            }
        }
        Ok((filelist, total_size))
    }

    /// Incremental and differential backups compare the selection
    /// against earlier snapshots of the same label and keep only new or
    /// changed files.
    fn load_incremental_filelist(
        &self,
        library: &mut BackupLibrary,
        differential: bool,
    ) -> Result<(Vec<String>, u64)> {
        let label_id = if self.options.label_id == LABEL_ID_ALLOCATE {
            LABEL_ID_DEFAULT
        } else {
            self.options.label_id
        };

        // Snapshots back to (and including) the label's latest full
        // backup, newest first.
        let filesets = library.load_snapshots(label_id, false)?;

        // First-seen wins, so the newest copy of each file is the one
        // compared against.  A differential backup only consults the
        // full backup at the bottom of the chain.
        let mut combined: HashMap<&str, (u64, u64)> = HashMap::new();
        let compare_sets: Box<dyn Iterator<Item = &crate::fileset::FileSet> + '_> =
            if differential {
                Box::new(filesets.last().into_iter())
            } else {
                Box::new(filesets.iter())
            };
        for fileset in compare_sets {
            for entry in fileset.files() {
                combined
                    .entry(entry.filename())
                    .or_insert((entry.metadata().modify_date, entry.file_size()));
            }
        }

        let (all_files, _) = self.load_full_filelist()?;
        let mut filelist = Vec::new();
        let mut total_size = 0u64;
        for filename in all_files {
            let file = OsFile::new(filename.as_str());
            let mut metadata = BackupFile::default();
            if file.fill_metadata(&mut metadata).is_err() {
                continue;
            }

            let changed = match combined.get(filename.as_str()) {
                None => true,
                Some(&(modify_date, file_size)) => {
                    metadata.modify_date != modify_date || metadata.file_size != file_size
                }
            };
            if changed {
                if FileType::from_u32(metadata.file_type) == Some(FileType::Regular) {
                    total_size += metadata.file_size;
                }
                filelist.push(filename);
            }
        }
        Ok((filelist, total_size))
    }
}

/// Assemble a library over the production digester, encoder, and volume
/// factory.
fn open_library(path: &str) -> Result<BackupLibrary> {
    Ok(BackupLibrary::new(
        path,
        Box::new(Md5Generator),
        Box::new(ZlibEncoder),
        Box::new(DiskVolumeFactory),
    ))
}
