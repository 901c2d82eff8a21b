//! Filesystem access for volumes, source files, and restore targets.
//!
//! # Write buffering
//! `OsFile` buffers appended writes up to [`FLUSH_SIZE`] so a backup does
//! not make a million tiny writes to (possibly network-mounted) media.
//! The buffer is flushed on `close`, before any read that follows a
//! write, and before `tell`/`seek`/`seek_eof`/`size` — so every byte
//! offset captured for a descriptor points at data already on disk.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::error::{Error, Result};
use crate::fileset::FileEntry;
use crate::records::{BackupFile, FileType};

/// Flush threshold for buffered appends: 10 MiB.
pub const FLUSH_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Append,
    ReadWrite,
}

/// File capability used by the volume layer and the engines.
///
/// Implementations may buffer writes, but must honor the flush
/// discipline described in the module docs.
pub trait FileIo {
    fn filename(&self) -> &str;
    fn exists(&self) -> bool;
    fn is_directory(&self) -> bool;
    fn is_regular_file(&self) -> bool;
    fn is_symlink(&self) -> bool;

    fn open(&mut self, mode: Mode) -> Result<()>;
    fn close(&mut self) -> Result<()>;
    fn unlink(&mut self) -> Result<()>;

    /// Current byte position, after flushing any buffered writes.
    fn tell(&mut self) -> Result<u64>;
    /// Absolute seek; a negative offset seeks from the end of the file.
    fn seek(&mut self, offset: i64) -> Result<()>;
    fn seek_eof(&mut self) -> Result<()>;

    /// Read up to `buf.len()` bytes, returning the count.  Fewer bytes
    /// than requested means end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    /// Read exactly `buf.len()` bytes or fail with `ShortRead`.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, data: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;

    /// On-disk size, including any buffered but unflushed writes.
    fn size(&mut self) -> Result<u64>;

    /// Create the directories leading to this path.  With `strip_leaf`
    /// the final component is taken to be a filename and skipped.
    fn create_directories(&self, strip_leaf: bool) -> Result<()>;
    fn create_symlink(&self, target: &str) -> Result<()>;

    /// Stat this path into `metadata`, returning the symlink target when
    /// the path is a symlink.
    fn fill_metadata(&self, metadata: &mut BackupFile) -> Result<Option<String>>;
    /// Restore mode bits and modification time from a backed-up entry.
    fn restore_attributes(&self, entry: &FileEntry) -> Result<()>;
}

// ── OsFile ───────────────────────────────────────────────────────────────────

pub struct OsFile {
    filename: String,
    file: Option<File>,
    mode: Mode,
    /// Pending appended bytes (Append mode only).
    buffer: Vec<u8>,
}

impl OsFile {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            file: None,
            mode: Mode::Read,
            buffer: Vec::new(),
        }
    }

    fn handle(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| Error::GenericError("File not opened".to_string()))
    }

    /// Push buffered appends to the OS.  Appends always land at EOF.
    fn flush_buffer(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        let file = self.handle()?;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&buffer)?;
        Ok(())
    }
}

impl FileIo for OsFile {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn exists(&self) -> bool {
        Path::new(&self.filename).symlink_metadata().is_ok()
    }

    fn is_directory(&self) -> bool {
        Path::new(&self.filename).is_dir()
    }

    fn is_regular_file(&self) -> bool {
        Path::new(&self.filename).is_file()
    }

    fn is_symlink(&self) -> bool {
        Path::new(&self.filename)
            .symlink_metadata()
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn open(&mut self, mode: Mode) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::GenericError(format!(
                "File already open: {}", self.filename
            )));
        }
        if mode == Mode::Read && !Path::new(&self.filename).exists() {
            return Err(Error::NoSuchFile(self.filename.clone()));
        }
        let file = match mode {
            Mode::Read => OpenOptions::new().read(true).open(&self.filename),
            Mode::Append => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.filename),
            Mode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.filename),
        }?;
        self.file = Some(file);
        self.mode = mode;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush_buffer()?;
        match self.file.take() {
            Some(file) => {
                file.sync_all().ok();
                Ok(())
            }
            None => Err(Error::GenericError("File not opened".to_string())),
        }
    }

    fn unlink(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Err(Error::GenericError("Cannot unlink an open file".to_string()));
        }
        fs::remove_file(&self.filename)?;
        Ok(())
    }

    fn tell(&mut self) -> Result<u64> {
        self.flush_buffer()?;
        Ok(self.handle()?.stream_position()?)
    }

    fn seek(&mut self, offset: i64) -> Result<()> {
        self.flush_buffer()?;
        let file = self.handle()?;
        if offset < 0 {
            file.seek(SeekFrom::End(offset))?;
        } else {
            file.seek(SeekFrom::Start(offset as u64))?;
        }
        Ok(())
    }

    fn seek_eof(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.handle()?.seek(SeekFrom::End(0))?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.flush_buffer()?;
        let file = self.handle()?;
        let mut total = 0;
        while total < buf.len() {
            let n = file.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let n = self.read(buf)?;
        if n < buf.len() {
            return Err(Error::ShortRead(format!(
                "Asked for {} bytes of {}, got {n}", buf.len(), self.filename
            )));
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.mode {
            Mode::Append => {
                self.buffer.extend_from_slice(data);
                if self.buffer.len() >= FLUSH_SIZE {
                    self.flush_buffer()?;
                }
                Ok(())
            }
            Mode::ReadWrite => {
                self.handle()?.write_all(data)?;
                Ok(())
            }
            Mode::Read => Err(Error::GenericError(format!(
                "File opened read-only: {}", self.filename
            ))),
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        self.handle()?.flush()?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        self.flush_buffer()?;
        Ok(self.handle()?.metadata()?.len())
    }

    fn create_directories(&self, strip_leaf: bool) -> Result<()> {
        let path = Path::new(&self.filename);
        let dir = if strip_leaf {
            match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => return Ok(()),
            }
        } else {
            path
        };
        fs::create_dir_all(dir)?;
        Ok(())
    }

    fn create_symlink(&self, target: &str) -> Result<()> {
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(target, &self.filename)?;
            Ok(())
        }
        #[cfg(not(unix))]
        {
            let _ = target;
            Err(Error::GenericError(
                "Symlink restore is not supported on this platform".to_string(),
            ))
        }
    }

    fn fill_metadata(&self, metadata: &mut BackupFile) -> Result<Option<String>> {
        let path = Path::new(&self.filename);
        let stat = path
            .symlink_metadata()
            .map_err(|_| Error::NoSuchFile(self.filename.clone()))?;

        let file_type = if stat.file_type().is_symlink() {
            FileType::Symlink
        } else if stat.is_dir() {
            FileType::Directory
        } else {
            FileType::Regular
        };
        metadata.file_type = file_type as u32;
        metadata.file_size = if file_type == FileType::Regular { stat.len() } else { 0 };
        metadata.modify_date = stat
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        metadata.create_date = stat
            .created()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(metadata.modify_date);
        metadata.attributes = platform_attributes(&stat);

        if file_type == FileType::Symlink {
            let target = fs::read_link(path)?;
            let target = target.to_string_lossy().into_owned();
            metadata.symlink_target_size = target.len() as u64;
            return Ok(Some(target));
        }
        Ok(None)
    }

    fn restore_attributes(&self, entry: &FileEntry) -> Result<()> {
        let meta = entry.metadata();

        #[cfg(unix)]
        if entry.file_type() != FileType::Symlink && meta.attributes != 0 {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(meta.attributes as u32);
            if let Err(e) = fs::set_permissions(&self.filename, perms) {
                warn!("could not restore permissions on {}: {e}", self.filename);
            }
        }

        if meta.modify_date != 0 && entry.file_type() != FileType::Symlink {
            let mtime = filetime::FileTime::from_unix_time(meta.modify_date as i64, 0);
            if let Err(e) = filetime::set_file_mtime(&self.filename, mtime) {
                warn!("could not restore mtime on {}: {e}", self.filename);
            }
        }
        Ok(())
    }
}

impl Drop for OsFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.close() {
                warn!("error closing {} on drop: {e}", self.filename);
            }
        }
    }
}

#[cfg(unix)]
fn platform_attributes(stat: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    stat.mode() as u64
}

#[cfg(not(unix))]
fn platform_attributes(_stat: &fs::Metadata) -> u64 {
    0
}

// ── Volume-series discovery ──────────────────────────────────────────────────

/// Compose the on-disk name of volume `volume` in a series.
pub fn filename_from_volume(basename: &str, volume: u64) -> String {
    format!("{basename}.{volume}.bkp")
}

/// Split `basename.N.bkp` into `(basename, N)`.  Returns `None` when the
/// path is not of that form.
fn volume_number_from_filename(path: &Path) -> Option<(PathBuf, u64)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".bkp")?;
    let (base, number) = stem.rsplit_once('.')?;
    let number: u64 = number.parse().ok()?;
    if base.is_empty() {
        return None;
    }
    Some((path.with_file_name(base), number))
}

/// Derive the series basename from `path` and scan its siblings for the
/// largest volume number present.
///
/// `path` may name any volume of the series, or a not-yet-existing
/// `basename.0.bkp`: the basename is still derived and
/// `(last_volume, num_volumes)` come back as found (0 volumes for a new
/// library).  A path that is not of the `basename.N.bkp` form is treated
/// as a bare basename.
pub fn find_basename_and_last_volume(path: &str) -> Result<(String, u64, u64)> {
    let path_buf = PathBuf::from(path);
    let basename = match volume_number_from_filename(&path_buf) {
        Some((base, _)) => base,
        None => path_buf.clone(),
    };

    let dir = match basename.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut last_volume = 0u64;
    let mut num_volumes = 0u64;
    if let Ok(entries) = fs::read_dir(&dir) {
        for entry in entries.flatten() {
            if let Some((base, number)) = volume_number_from_filename(&entry.path()) {
                if base == basename {
                    num_volumes += 1;
                    last_volume = last_volume.max(number);
                }
            }
        }
    }

    let basename = basename.to_string_lossy().into_owned();
    Ok((basename, last_volume, num_volumes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_filename_round_trip() {
        let name = filename_from_volume("/tmp/series/backup", 12);
        assert_eq!(name, "/tmp/series/backup.12.bkp");
        let (base, vol) = volume_number_from_filename(Path::new(&name)).unwrap();
        assert_eq!(base, Path::new("/tmp/series/backup"));
        assert_eq!(vol, 12);
    }

    #[test]
    fn non_volume_names_rejected() {
        assert!(volume_number_from_filename(Path::new("/tmp/backup.bkp")).is_none());
        assert!(volume_number_from_filename(Path::new("/tmp/backup.x.bkp")).is_none());
        assert!(volume_number_from_filename(Path::new("/tmp/backup.3")).is_none());
    }

    #[test]
    fn discovery_on_missing_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.0.bkp");
        let (base, last, count) =
            find_basename_and_last_volume(path.to_str().unwrap()).unwrap();
        assert_eq!(base, dir.path().join("set").to_string_lossy());
        assert_eq!((last, count), (0, 0));
    }

    #[test]
    fn discovery_finds_highest_sibling() {
        let dir = tempfile::tempdir().unwrap();
        for n in [0u64, 1, 3] {
            fs::write(dir.path().join(format!("set.{n}.bkp")), b"x").unwrap();
        }
        fs::write(dir.path().join("other.5.bkp"), b"x").unwrap();
        let path = dir.path().join("set.0.bkp");
        let (_, last, count) =
            find_basename_and_last_volume(path.to_str().unwrap()).unwrap();
        assert_eq!((last, count), (3, 3));
    }

    #[test]
    fn buffered_writes_flush_before_tell() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buf.bin");
        let mut file = OsFile::new(path.to_string_lossy());
        file.open(Mode::Append).unwrap();
        file.write(b"0123456789").unwrap();
        // tell() must flush so the reported offset covers the write.
        assert_eq!(file.tell().unwrap(), 10);
        assert_eq!(fs::metadata(&path).unwrap().len(), 10);
        file.close().unwrap();
    }

    #[test]
    fn short_read_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bin");
        fs::write(&path, b"abc").unwrap();
        let mut file = OsFile::new(path.to_string_lossy());
        file.open(Mode::Read).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        file.seek(0).unwrap();
        assert!(matches!(file.read_exact(&mut buf), Err(Error::ShortRead(_))));
        file.close().unwrap();
    }
}
