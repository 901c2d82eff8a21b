//! Restore and verify engines.
//!
//! Both resolve the file list the same way: walk the selected snapshot's
//! chain newest → oldest down to the most recent full backup, keeping the
//! first (newest) copy of each filename.  The chunk plan is then sorted
//! by `(volume, offset)` so each volume is swept forward at most once,
//! with media changes between volumes rather than inside them.
//!
//! Restore is not transactional: cancellation or per-file errors leave
//! whatever was already written in place and move on.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{info, warn};

use crate::backup::ProgressFn;
use crate::encoder::ZlibEncoder;
use crate::error::{Error, Result};
use crate::file::{FileIo, Mode, OsFile};
use crate::fileset::FileEntry;
use crate::hash::Md5Generator;
use crate::library::{BackupLibrary, VolumeChangeCallback};
use crate::records::{BackupType, FileType};
use crate::volume::DiskVolumeFactory;

/// Progress is reported after at least this many new bytes: 1 MiB.
const PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// What `VerifyDriver` found.
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub files_checked: usize,
    pub bytes_compared: u64,
    /// Stored paths whose on-disk counterpart is missing, unreadable, or
    /// different.
    pub different_files: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.different_files.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} file(s) checked, {} byte(s) compared, {} different",
            self.files_checked,
            self.bytes_compared,
            self.different_files.len()
        )
    }
}

/// Shared plumbing for the two engines.
struct Resolver {
    library: BackupLibrary,
}

impl Resolver {
    fn open(source: &str, callback: Option<VolumeChangeCallback>) -> Result<Self> {
        let mut library = BackupLibrary::new(
            source,
            Box::new(Md5Generator),
            Box::new(ZlibEncoder),
            Box::new(DiskVolumeFactory),
        );
        library.init()?;
        if let Some(callback) = callback {
            library.set_volume_change_callback(callback);
        }
        Ok(Self { library })
    }

    /// Resolve the effective file list for `snapshot_index` within the
    /// label's history (0 = newest).  First-seen wins per filename, and
    /// the walk stops once the first full backup has contributed.
    /// An empty `selected` set means everything.
    fn resolve_files(
        &mut self,
        label_id: u64,
        snapshot_index: usize,
        selected: &BTreeSet<String>,
    ) -> Result<Vec<FileEntry>> {
        let filesets = self.library.load_snapshots(label_id, true)?;
        if snapshot_index >= filesets.len() {
            return Err(Error::GenericError(format!(
                "Snapshot {snapshot_index} does not exist; label has {}",
                filesets.len()
            )));
        }

        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut files = Vec::new();
        for fileset in &filesets[snapshot_index..] {
            for entry in fileset.files() {
                if !selected.is_empty() && !selected.contains(entry.filename()) {
                    continue;
                }
                if seen.insert(entry.filename().to_string()) {
                    files.push(entry.clone());
                }
            }
            if fileset.backup_type() == BackupType::Full {
                break;
            }
        }
        Ok(files)
    }
}

/// Map a stored (possibly absolute) path under the output prefix.
fn destination_path(prefix: &str, stored: &str) -> PathBuf {
    let mut dest = PathBuf::from(prefix);
    for component in Path::new(stored).components() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {}
            Component::Normal(part) => dest.push(part),
        }
    }
    dest
}

// ── Restore ──────────────────────────────────────────────────────────────────

pub struct RestoreDriver {
    source: String,
    destination: String,
    label_id: u64,
    snapshot_index: usize,
    restore_paths: BTreeSet<String>,
    cancel: Arc<AtomicBool>,
    volume_change_callback: Option<VolumeChangeCallback>,
}

impl RestoreDriver {
    pub fn new(
        source: impl Into<String>,
        destination: impl Into<String>,
        label_id: u64,
        snapshot_index: usize,
        restore_paths: BTreeSet<String>,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            label_id,
            snapshot_index,
            restore_paths,
            cancel: Arc::new(AtomicBool::new(false)),
            volume_change_callback: None,
        }
    }

    pub fn set_volume_change_callback(&mut self, callback: VolumeChangeCallback) {
        self.volume_change_callback = Some(callback);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Restore the selected snapshot into the destination directory.
    pub fn perform_restore(&mut self, mut progress: Option<&mut ProgressFn>) -> Result<()> {
        let mut resolver =
            Resolver::open(&self.source, self.volume_change_callback.take())?;
        let files =
            resolver.resolve_files(self.label_id, self.snapshot_index, &self.restore_paths)?;
        let library = &mut resolver.library;
        info!("restoring {} file(s)", files.len());

        // Directories, symlinks, and empty files first; they are not in
        // the chunk plan.
        for entry in &files {
            let dest = destination_path(&self.destination, entry.filename());
            let mut file = OsFile::new(dest.to_string_lossy());
            match entry.file_type() {
                FileType::Directory => file.create_directories(false)?,
                FileType::Symlink => {
                    file.create_directories(true)?;
                    if let Some(target) = entry.symlink_target() {
                        if let Err(e) = file.create_symlink(target) {
                            warn!("could not restore symlink {}: {e}", entry.filename());
                        }
                    }
                }
                FileType::Regular if entry.chunks().is_empty() => {
                    file.create_directories(true)?;
                    file.open(Mode::ReadWrite)?;
                    file.close()?;
                    file.restore_attributes(entry)?;
                }
                _ => {}
            }
        }

        let refs: Vec<&FileEntry> = files.iter().collect();
        let plan = BackupLibrary::optimize_chunks_for_restore(&refs);
        let restore_size: u64 = plan.iter().map(|(c, _)| c.unencoded_size).sum();

        let mut completed: u64 = 0;
        let mut since_last_update: u64 = 0;
        let mut open_file: Option<(usize, OsFile)> = None;

        for (chunk, file_index) in plan {
            if self.cancel.load(Ordering::Relaxed) {
                info!("restore cancelled");
                break;
            }
            let entry = &files[file_index];

            // Keep the output open across consecutive chunks of the
            // same file; restore attributes as each file completes.
            let reuse = matches!(&open_file, Some((index, _)) if *index == file_index);
            if !reuse {
                if let Some((index, mut done)) = open_file.take() {
                    done.close()?;
                    done.restore_attributes(&files[index])?;
                }
                let dest = destination_path(&self.destination, entry.filename());
                let mut file = OsFile::new(dest.to_string_lossy());
                file.create_directories(true)?;
                file.open(Mode::ReadWrite)?;
                open_file = Some((file_index, file));
            }

            let data = library.read_chunk(&chunk)?;
            if let Some((_, file)) = open_file.as_mut() {
                if !data.is_empty() {
                    file.seek(chunk.chunk_offset as i64)?;
                    file.write(&data)?;
                }
            }

            completed += chunk.unencoded_size;
            since_last_update += chunk.unencoded_size;
            if since_last_update > PROGRESS_INTERVAL {
                since_last_update = 0;
                if let Some(f) = progress.as_deref_mut() {
                    f(completed, restore_size);
                }
            }
        }

        if let Some((index, mut done)) = open_file.take() {
            done.close()?;
            done.restore_attributes(&files[index])?;
        }
        if let Some(f) = progress.as_deref_mut() {
            f(completed, restore_size);
        }
        Ok(())
    }
}

// ── Verify ───────────────────────────────────────────────────────────────────

pub struct VerifyDriver {
    source: String,
    compare_prefix: String,
    label_id: u64,
    snapshot_index: usize,
    verify_paths: BTreeSet<String>,
    cancel: Arc<AtomicBool>,
    volume_change_callback: Option<VolumeChangeCallback>,
}

impl VerifyDriver {
    pub fn new(
        source: impl Into<String>,
        compare_prefix: impl Into<String>,
        label_id: u64,
        snapshot_index: usize,
        verify_paths: BTreeSet<String>,
    ) -> Self {
        Self {
            source: source.into(),
            compare_prefix: compare_prefix.into(),
            label_id,
            snapshot_index,
            verify_paths,
            cancel: Arc::new(AtomicBool::new(false)),
            volume_change_callback: None,
        }
    }

    pub fn set_volume_change_callback(&mut self, callback: VolumeChangeCallback) {
        self.volume_change_callback = Some(callback);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Compare the selected snapshot against the filesystem under the
    /// compare prefix.  Per-file problems mark the file different and
    /// skip its remaining chunks; they never abort the run.
    pub fn perform_verify(&mut self, mut progress: Option<&mut ProgressFn>) -> Result<VerifyReport> {
        let mut resolver =
            Resolver::open(&self.source, self.volume_change_callback.take())?;
        let files =
            resolver.resolve_files(self.label_id, self.snapshot_index, &self.verify_paths)?;
        let library = &mut resolver.library;
        info!("verifying {} file(s)", files.len());

        let mut report = VerifyReport {
            files_checked: files.len(),
            ..VerifyReport::default()
        };
        let mut different: BTreeSet<usize> = BTreeSet::new();

        // Directories and symlinks first: existence and type.
        for (index, entry) in files.iter().enumerate() {
            let dest = destination_path(&self.compare_prefix, entry.filename());
            let file = OsFile::new(dest.to_string_lossy());
            match entry.file_type() {
                FileType::Directory => {
                    if !file.is_directory() {
                        warn!("directory in backup is not a directory: {}", dest.display());
                        different.insert(index);
                    }
                }
                FileType::Symlink => {
                    if !file.is_symlink() {
                        warn!("symlink in backup is not a symlink: {}", dest.display());
                        different.insert(index);
                    }
                }
                _ => {
                    if !file.exists() {
                        warn!("file in backup missing on filesystem: {}", dest.display());
                        different.insert(index);
                    }
                }
            }
        }

        let refs: Vec<&FileEntry> = files.iter().collect();
        let plan = BackupLibrary::optimize_chunks_for_restore(&refs);
        let verify_size: u64 = plan.iter().map(|(c, _)| c.unencoded_size).sum();

        let mut completed: u64 = 0;
        let mut since_last_update: u64 = 0;
        let mut open_file: Option<(usize, OsFile)> = None;

        for (chunk, file_index) in plan {
            if self.cancel.load(Ordering::Relaxed) {
                info!("verify cancelled");
                break;
            }
            completed += chunk.unencoded_size;
            since_last_update += chunk.unencoded_size;
            if since_last_update > PROGRESS_INTERVAL {
                since_last_update = 0;
                if let Some(f) = progress.as_deref_mut() {
                    f(completed, verify_size);
                }
            }

            // Already known different: skip the file's remaining chunks.
            if different.contains(&file_index) {
                continue;
            }
            let entry = &files[file_index];

            let reuse = matches!(&open_file, Some((index, _)) if *index == file_index);
            if !reuse {
                if let Some((_, mut done)) = open_file.take() {
                    done.close()?;
                }
                let dest = destination_path(&self.compare_prefix, entry.filename());
                let mut file = OsFile::new(dest.to_string_lossy());
                match file.open(Mode::Read) {
                    Ok(()) => open_file = Some((file_index, file)),
                    Err(e) => {
                        warn!("cannot open {} for verify: {e}", entry.filename());
                        different.insert(file_index);
                        continue;
                    }
                }
            }

            let data = library.read_chunk(&chunk)?;
            report.bytes_compared += data.len() as u64;

            if let Some((_, file)) = open_file.as_mut() {
                let mut disk_data = vec![0u8; data.len()];
                let matches = file
                    .seek(chunk.chunk_offset as i64)
                    .and_then(|_| file.read_exact(&mut disk_data))
                    .map(|_| disk_data == data)
                    .unwrap_or(false);
                if !matches {
                    info!("file different: {}", entry.filename());
                    different.insert(file_index);
                }
            }
        }

        if let Some((_, mut done)) = open_file.take() {
            done.close()?;
        }
        if let Some(f) = progress.as_deref_mut() {
            f(completed, verify_size);
        }

        report.different_files = different
            .into_iter()
            .map(|index| files[index].filename().to_string())
            .collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_path_strips_roots() {
        assert_eq!(
            destination_path("/restore/out", "/a/b/c.txt"),
            PathBuf::from("/restore/out/a/b/c.txt")
        );
        assert_eq!(
            destination_path("out", "relative/d.txt"),
            PathBuf::from("out/relative/d.txt")
        );
    }
}
