//! On-disk record definitions for the `.bkp` volume format.
//!
//! # Volume layout (strictly in order)
//!
//! ```text
//! "BKP_0000"                magic, 8 ASCII bytes
//! ChunkHeader + payload     zero or more chunk records
//! Descriptor1               total chunk / label counts
//!   Descriptor1Chunk × N    one per chunk in this volume
//!   Descriptor1Label × M    the library's label registry
//! Descriptor2               optional; present iff this volume closes a
//!   description bytes       snapshot.  Followed by num_files of:
//!   BackupFile + name       per-file metadata (+ symlink target)
//!     FileChunk × K         per-file chunk references
//! DescriptorHeader          fixed 22-byte tail, always last
//! ```
//!
//! # Endianness and packing
//! Every numeric field is little-endian and every structure is packed —
//! the byte sizes below are exact and frozen.  A record begins with a
//! 4-byte header-type tag that MUST match on read; any mismatch is
//! `CorruptBackup` before a single payload byte is trusted.
//!
//! | Record           | Fixed size | Trailing variable data            |
//! |------------------|-----------:|-----------------------------------|
//! | ChunkHeader      |       40 B | `encoded_size` payload bytes      |
//! | Descriptor1      |       20 B | chunk + label records             |
//! | Descriptor1Chunk |       36 B | —                                 |
//! | Descriptor1Label |       36 B | `name_size` bytes of name         |
//! | Descriptor2      |       96 B | description + file records        |
//! | BackupFile       |       64 B | filename (+ symlink target)       |
//! | FileChunk        |       52 B | —                                 |
//! | DescriptorHeader |       22 B | —                                 |

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

use crate::error::{Error, Result};
use crate::hash::Md5Digest;

/// Magic/version string at offset 0 of every volume.
pub const MAGIC: &[u8; 8] = b"BKP_0000";

// ── Header-type tags ─────────────────────────────────────────────────────────

/// 4-byte tag leading every on-disk structure.  Values are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HeaderType {
    ChunkHeader = 0,
    Descriptor1 = 1,
    Descriptor1Chunk = 2,
    Descriptor1Label = 3,
    Descriptor2 = 4,
    DescriptorHeader = 5,
    BackupFile = 6,
    FileChunk = 7,
}

impl HeaderType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(HeaderType::ChunkHeader),
            1 => Some(HeaderType::Descriptor1),
            2 => Some(HeaderType::Descriptor1Chunk),
            3 => Some(HeaderType::Descriptor1Label),
            4 => Some(HeaderType::Descriptor2),
            5 => Some(HeaderType::DescriptorHeader),
            6 => Some(HeaderType::BackupFile),
            7 => Some(HeaderType::FileChunk),
            _ => None,
        }
    }
}

/// Read and validate a record's leading tag.
fn expect_tag<R: Read>(r: &mut R, want: HeaderType) -> Result<()> {
    let raw = r.read_u32::<LittleEndian>()?;
    match HeaderType::from_u32(raw) {
        Some(got) if got == want => Ok(()),
        _ => Err(Error::CorruptBackup(format!(
            "Invalid header type {raw:#x}, expected {want:?}"
        ))),
    }
}

// ── Encoding and backup type enums ───────────────────────────────────────────

/// How a chunk payload is stored.  Encoding never affects the chunk's
/// digest, which is always over the unencoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EncodingType {
    Raw = 0,
    Zlib = 1,
    // 2 is reserved (bzip2 in the original enum, never written).
}

impl EncodingType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(EncodingType::Raw),
            1 => Some(EncodingType::Zlib),
            _ => None,
        }
    }
}

/// How a snapshot relates to the rest of its label's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BackupType {
    Invalid = 0,
    Full = 1,
    Differential = 2,
    Incremental = 3,
}

impl BackupType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(BackupType::Invalid),
            1 => Some(BackupType::Full),
            2 => Some(BackupType::Differential),
            3 => Some(BackupType::Incremental),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BackupType::Invalid => "invalid",
            BackupType::Full => "full",
            BackupType::Differential => "differential",
            BackupType::Incremental => "incremental",
        }
    }
}

/// Kind of filesystem object a `BackupFile` record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Invalid = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 3,
}

impl FileType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(FileType::Invalid),
            1 => Some(FileType::Regular),
            2 => Some(FileType::Directory),
            3 => Some(FileType::Symlink),
            _ => None,
        }
    }
}

// ── ChunkHeader ──────────────────────────────────────────────────────────────

/// Precedes every chunk payload in the volume body.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    /// Digest of the *unencoded* chunk bytes.
    pub md5sum: Md5Digest,
    /// Logical byte length of the chunk.
    pub unencoded_size: u64,
    /// Payload length on disk, which may be larger than `unencoded_size`.
    pub encoded_size: u64,
    pub encoding_type: EncodingType,
}

impl ChunkHeader {
    pub const SIZE: usize = 4 + 16 + 8 + 8 + 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::ChunkHeader as u32).to_le_bytes());
        buf.extend_from_slice(&self.md5sum.to_le_bytes());
        buf.extend_from_slice(&self.unencoded_size.to_le_bytes());
        buf.extend_from_slice(&self.encoded_size.to_le_bytes());
        buf.extend_from_slice(&(self.encoding_type as u32).to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::ChunkHeader)?;
        let md5sum = read_digest(&mut buf)?;
        let unencoded_size = buf.read_u64::<LittleEndian>()?;
        let encoded_size = buf.read_u64::<LittleEndian>()?;
        let encoding_raw = buf.read_u32::<LittleEndian>()?;
        let encoding_type = EncodingType::from_u32(encoding_raw).ok_or_else(|| {
            Error::CorruptBackup(format!("Unsupported chunk encoding {encoding_raw}"))
        })?;
        Ok(Self { md5sum, unencoded_size, encoded_size, encoding_type })
    }
}

// ── Descriptor 1 ─────────────────────────────────────────────────────────────

/// Per-volume trailer: counts of the chunk and label records that follow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Descriptor1 {
    pub total_chunks: u64,
    pub total_labels: u64,
}

impl Descriptor1 {
    pub const SIZE: usize = 4 + 8 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::Descriptor1 as u32).to_le_bytes());
        buf.extend_from_slice(&self.total_chunks.to_le_bytes());
        buf.extend_from_slice(&self.total_labels.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::Descriptor1)?;
        Ok(Self {
            total_chunks: buf.read_u64::<LittleEndian>()?,
            total_labels: buf.read_u64::<LittleEndian>()?,
        })
    }
}

/// One chunk's location, as enumerated by descriptor 1.  The volume
/// number looks redundant inside a single volume but lets the library
/// build its union index without re-tagging every entry.
#[derive(Debug, Clone, Copy)]
pub struct Descriptor1Chunk {
    pub md5sum: Md5Digest,
    /// Offset of the `ChunkHeader` within its volume.
    pub offset: u64,
    pub volume_number: u64,
}

impl Descriptor1Chunk {
    pub const SIZE: usize = 4 + 16 + 8 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::Descriptor1Chunk as u32).to_le_bytes());
        buf.extend_from_slice(&self.md5sum.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.volume_number.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::Descriptor1Chunk)?;
        Ok(Self {
            md5sum: read_digest(&mut buf)?,
            offset: buf.read_u64::<LittleEndian>()?,
            volume_number: buf.read_u64::<LittleEndian>()?,
        })
    }
}

/// One label registry entry, serialized after the chunk records.  The
/// `name_size` bytes of the label name follow immediately.
#[derive(Debug, Clone)]
pub struct Descriptor1Label {
    pub id: u64,
    pub last_backup_offset: u64,
    pub last_backup_volume: u64,
    pub name_size: u64,
}

impl Descriptor1Label {
    pub const SIZE: usize = 4 + 8 + 8 + 8 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::Descriptor1Label as u32).to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.last_backup_offset.to_le_bytes());
        buf.extend_from_slice(&self.last_backup_volume.to_le_bytes());
        buf.extend_from_slice(&self.name_size.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::Descriptor1Label)?;
        Ok(Self {
            id: buf.read_u64::<LittleEndian>()?,
            last_backup_offset: buf.read_u64::<LittleEndian>()?,
            last_backup_volume: buf.read_u64::<LittleEndian>()?,
            name_size: buf.read_u64::<LittleEndian>()?,
        })
    }
}

// ── Descriptor 2 ─────────────────────────────────────────────────────────────

/// Per-snapshot trailer.  Present only in the last volume of a backup;
/// the user description and `num_files` file records follow.
///
/// `previous_backup_*` points at the temporally prior snapshot anywhere in
/// the library; `parent_backup_*` points at the snapshot this one used as
/// its baseline (normally the prior snapshot of the same label).  A zero
/// offset-and-volume pair terminates either chain.
#[derive(Debug, Clone, Default)]
pub struct Descriptor2 {
    pub previous_backup_offset: u64,
    pub previous_backup_volume: u64,
    pub parent_backup_offset: u64,
    pub parent_backup_volume: u64,
    /// Seconds since the epoch.
    pub backup_date: u64,
    pub backup_type: u32,
    pub unencoded_size: u64,
    pub encoded_size: u64,
    pub deduplicated_size: u64,
    pub num_files: u64,
    pub label_id: u64,
    pub description_size: u64,
}

impl Descriptor2 {
    pub const SIZE: usize = 4 + 8 * 4 + 8 + 4 + 8 * 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::Descriptor2 as u32).to_le_bytes());
        buf.extend_from_slice(&self.previous_backup_offset.to_le_bytes());
        buf.extend_from_slice(&self.previous_backup_volume.to_le_bytes());
        buf.extend_from_slice(&self.parent_backup_offset.to_le_bytes());
        buf.extend_from_slice(&self.parent_backup_volume.to_le_bytes());
        buf.extend_from_slice(&self.backup_date.to_le_bytes());
        buf.extend_from_slice(&self.backup_type.to_le_bytes());
        buf.extend_from_slice(&self.unencoded_size.to_le_bytes());
        buf.extend_from_slice(&self.encoded_size.to_le_bytes());
        buf.extend_from_slice(&self.deduplicated_size.to_le_bytes());
        buf.extend_from_slice(&self.num_files.to_le_bytes());
        buf.extend_from_slice(&self.label_id.to_le_bytes());
        buf.extend_from_slice(&self.description_size.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::Descriptor2)?;
        Ok(Self {
            previous_backup_offset: buf.read_u64::<LittleEndian>()?,
            previous_backup_volume: buf.read_u64::<LittleEndian>()?,
            parent_backup_offset: buf.read_u64::<LittleEndian>()?,
            parent_backup_volume: buf.read_u64::<LittleEndian>()?,
            backup_date: buf.read_u64::<LittleEndian>()?,
            backup_type: buf.read_u32::<LittleEndian>()?,
            unencoded_size: buf.read_u64::<LittleEndian>()?,
            encoded_size: buf.read_u64::<LittleEndian>()?,
            deduplicated_size: buf.read_u64::<LittleEndian>()?,
            num_files: buf.read_u64::<LittleEndian>()?,
            label_id: buf.read_u64::<LittleEndian>()?,
            description_size: buf.read_u64::<LittleEndian>()?,
        })
    }
}

// ── File records ─────────────────────────────────────────────────────────────

/// Per-file metadata inside descriptor 2.  The filename (and, for
/// symlinks, the target path) follows, then `num_chunks` `FileChunk`
/// records.
#[derive(Debug, Clone, Default)]
pub struct BackupFile {
    /// Unencoded size of the file; zero for directories.  Always equals
    /// the sum of the file's chunk `unencoded_size`s.
    pub file_size: u64,
    pub file_type: u32,
    pub create_date: u64,
    pub modify_date: u64,
    /// Platform-specific attribute bag, preserved byte-for-byte.
    pub attributes: u64,
    pub num_chunks: u64,
    pub filename_size: u64,
    /// Only non-zero when `file_type` is symlink.
    pub symlink_target_size: u64,
}

impl BackupFile {
    pub const SIZE: usize = 4 + 8 + 4 + 8 * 6;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::BackupFile as u32).to_le_bytes());
        buf.extend_from_slice(&self.file_size.to_le_bytes());
        buf.extend_from_slice(&self.file_type.to_le_bytes());
        buf.extend_from_slice(&self.create_date.to_le_bytes());
        buf.extend_from_slice(&self.modify_date.to_le_bytes());
        buf.extend_from_slice(&self.attributes.to_le_bytes());
        buf.extend_from_slice(&self.num_chunks.to_le_bytes());
        buf.extend_from_slice(&self.filename_size.to_le_bytes());
        buf.extend_from_slice(&self.symlink_target_size.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::BackupFile)?;
        Ok(Self {
            file_size: buf.read_u64::<LittleEndian>()?,
            file_type: buf.read_u32::<LittleEndian>()?,
            create_date: buf.read_u64::<LittleEndian>()?,
            modify_date: buf.read_u64::<LittleEndian>()?,
            attributes: buf.read_u64::<LittleEndian>()?,
            num_chunks: buf.read_u64::<LittleEndian>()?,
            filename_size: buf.read_u64::<LittleEndian>()?,
            symlink_target_size: buf.read_u64::<LittleEndian>()?,
        })
    }
}

/// One chunk reference belonging to a file.  `volume_num`/`volume_offset`
/// locate the chunk data (possibly in an earlier volume, via dedup);
/// `chunk_offset` is where the bytes land within the restored file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileChunk {
    pub md5sum: Md5Digest,
    pub volume_num: u64,
    pub volume_offset: u64,
    pub chunk_offset: u64,
    pub unencoded_size: u64,
}

impl FileChunk {
    pub const SIZE: usize = 4 + 16 + 8 * 4;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::FileChunk as u32).to_le_bytes());
        buf.extend_from_slice(&self.md5sum.to_le_bytes());
        buf.extend_from_slice(&self.volume_num.to_le_bytes());
        buf.extend_from_slice(&self.volume_offset.to_le_bytes());
        buf.extend_from_slice(&self.chunk_offset.to_le_bytes());
        buf.extend_from_slice(&self.unencoded_size.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::FileChunk)?;
        Ok(Self {
            md5sum: read_digest(&mut buf)?,
            volume_num: buf.read_u64::<LittleEndian>()?,
            volume_offset: buf.read_u64::<LittleEndian>()?,
            chunk_offset: buf.read_u64::<LittleEndian>()?,
            unencoded_size: buf.read_u64::<LittleEndian>()?,
        })
    }
}

// ── Descriptor header ────────────────────────────────────────────────────────

/// Fixed tail of every volume, read by seeking `-SIZE` from EOF.
///
/// `descriptor_2_present` distinguishes the end of a backup from the end
/// of a split volume whose backup continues in the next file.
/// `cancelled` marks a volume whose backup was aborted: it holds no
/// snapshot but its chunks remain usable for dedup.
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorHeader {
    pub descriptor_1_offset: u64,
    pub descriptor_2_present: bool,
    pub cancelled: bool,
    pub volume_number: u64,
}

impl DescriptorHeader {
    pub const SIZE: usize = 4 + 8 + 1 + 1 + 8;

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&(HeaderType::DescriptorHeader as u32).to_le_bytes());
        buf.extend_from_slice(&self.descriptor_1_offset.to_le_bytes());
        buf.push(self.descriptor_2_present as u8);
        buf.push(self.cancelled as u8);
        buf.extend_from_slice(&self.volume_number.to_le_bytes());
        buf
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        expect_tag(&mut buf, HeaderType::DescriptorHeader)?;
        Ok(Self {
            descriptor_1_offset: buf.read_u64::<LittleEndian>()?,
            descriptor_2_present: buf.read_u8()? != 0,
            cancelled: buf.read_u8()? != 0,
            volume_number: buf.read_u64::<LittleEndian>()?,
        })
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn read_digest<R: Read>(r: &mut R) -> Result<Md5Digest> {
    let mut bytes = [0u8; 16];
    r.read_exact(&mut bytes)?;
    Ok(Md5Digest::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_frozen() {
        assert_eq!(ChunkHeader::SIZE, 40);
        assert_eq!(Descriptor1::SIZE, 20);
        assert_eq!(Descriptor1Chunk::SIZE, 36);
        assert_eq!(Descriptor1Label::SIZE, 36);
        assert_eq!(Descriptor2::SIZE, 96);
        assert_eq!(BackupFile::SIZE, 64);
        assert_eq!(FileChunk::SIZE, 52);
        assert_eq!(DescriptorHeader::SIZE, 22);
    }

    #[test]
    fn encode_lengths_match_sizes() {
        assert_eq!(ChunkHeader {
            md5sum: Md5Digest(1),
            unencoded_size: 2,
            encoded_size: 3,
            encoding_type: EncodingType::Raw,
        }.encode().len(), ChunkHeader::SIZE);
        assert_eq!(Descriptor2::default().encode().len(), Descriptor2::SIZE);
        assert_eq!(BackupFile::default().encode().len(), BackupFile::SIZE);
        assert_eq!(FileChunk::default().encode().len(), FileChunk::SIZE);
        assert_eq!(DescriptorHeader::default().encode().len(), DescriptorHeader::SIZE);
    }

    #[test]
    fn tag_mismatch_is_corrupt_backup() {
        // A Descriptor1 buffer parsed as a chunk header must be rejected.
        let buf = Descriptor1 { total_chunks: 1, total_labels: 0 }.encode();
        let err = ChunkHeader::parse(&buf).unwrap_err();
        assert!(matches!(err, Error::CorruptBackup(_)));
    }

    #[test]
    fn chunk_header_round_trip() {
        let hdr = ChunkHeader {
            md5sum: Md5Digest(0x8346_7100_0089_2376),
            unencoded_size: 14,
            encoded_size: 5,
            encoding_type: EncodingType::Zlib,
        };
        let parsed = ChunkHeader::parse(&hdr.encode()).unwrap();
        assert_eq!(parsed.md5sum, hdr.md5sum);
        assert_eq!(parsed.unencoded_size, 14);
        assert_eq!(parsed.encoded_size, 5);
        assert_eq!(parsed.encoding_type, EncodingType::Zlib);
    }

    #[test]
    fn reserved_encoding_rejected() {
        let mut buf = ChunkHeader {
            md5sum: Md5Digest(1),
            unencoded_size: 2,
            encoded_size: 2,
            encoding_type: EncodingType::Raw,
        }.encode();
        let last = buf.len() - 4;
        buf[last..].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(ChunkHeader::parse(&buf), Err(Error::CorruptBackup(_))));
    }

    #[test]
    fn descriptor_header_flags() {
        let hdr = DescriptorHeader {
            descriptor_1_offset: 4096,
            descriptor_2_present: true,
            cancelled: false,
            volume_number: 3,
        };
        let parsed = DescriptorHeader::parse(&hdr.encode()).unwrap();
        assert!(parsed.descriptor_2_present);
        assert!(!parsed.cancelled);
        assert_eq!(parsed.descriptor_1_offset, 4096);
        assert_eq!(parsed.volume_number, 3);
    }
}
