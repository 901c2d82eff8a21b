//! # bkp — chunked, deduplicating, disc-spanning backup engine
//!
//! Format guarantees (frozen for `BKP_0000`):
//! - All numeric fields are little-endian and packed; never negotiated
//! - Chunks are content-addressed by the MD5 of their unencoded bytes;
//!   equal digests are identical chunks across the whole library
//! - Every on-disk record leads with a 4-byte header-type tag that must
//!   match on read; a mismatch aborts with `CorruptBackup`
//! - A volume is self-describing: chunk index and label registry ride in
//!   its descriptor 1, found through the fixed header at EOF
//! - A snapshot (descriptor 2) lives in the last volume it touched and
//!   chains to earlier snapshots by `(volume, offset)` value references
//! - Cancelled volumes hold no snapshot but keep their chunks available
//!   for deduplication
//! - Chunk payloads are stored raw or zlib-compressed, whichever is
//!   smaller; decode is verified against both size and digest

pub mod error;
pub mod hash;
pub mod encoder;
pub mod records;
pub mod chunk_map;
pub mod labels;
pub mod fileset;
pub mod file;
pub mod volume;
pub mod library;
pub mod backup;
pub mod restore;
pub mod plan;

// Flat re-exports for the most common types.
pub use backup::{BackupDriver, NoopShadowCopy, ShadowCopy, CHUNK_SIZE};
pub use chunk_map::ChunkMap;
pub use encoder::{Encoder, ZlibEncoder};
pub use error::{Error, Result};
pub use file::{find_basename_and_last_volume, FileIo, Mode, OsFile};
pub use fileset::{BackupRef, FileEntry, FileSet};
pub use hash::{Digester, Md5Digest, Md5Generator};
pub use labels::{Label, LabelMap, DEFAULT_LABEL_NAME, LABEL_ID_ALLOCATE, LABEL_ID_DEFAULT};
pub use library::{BackupLibrary, BackupOptions, MAX_SIZE_THRESHOLD_MB};
pub use plan::BackupPlan;
pub use records::{BackupType, EncodingType, FileType};
pub use restore::{RestoreDriver, VerifyDriver, VerifyReport};
pub use volume::{DiskVolume, DiskVolumeFactory, Volume, VolumeFactory, VolumeOptions};
