//! Library-level tests: dedup, compression choice, volume roll-over,
//! bin-packing, labels, cancellation, and corruption detection.

use bkp::encoder::ZlibEncoder;
use bkp::error::Error;
use bkp::hash::Md5Generator;
use bkp::library::{BackupLibrary, BackupOptions};
use bkp::records::{BackupFile, BackupType, ChunkHeader, EncodingType, FileType};
use bkp::volume::DiskVolumeFactory;

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn open_library(path: &Path) -> BackupLibrary {
    let mut library = BackupLibrary::new(
        path.to_string_lossy(),
        Box::new(Md5Generator),
        Box::new(ZlibEncoder),
        Box::new(DiskVolumeFactory),
    );
    library.init().unwrap();
    library
}

fn full_backup_options(description: &str) -> BackupOptions {
    BackupOptions {
        description: description.to_string(),
        backup_type: BackupType::Full,
        ..BackupOptions::default()
    }
}

fn regular_metadata() -> BackupFile {
    BackupFile {
        file_type: FileType::Regular as u32,
        ..BackupFile::default()
    }
}

fn volume_path(dir: &TempDir, number: u64) -> PathBuf {
    dir.path().join(format!("set.{number}.bkp"))
}

/// Parse the chunk header right after the magic of a raw volume file.
fn first_chunk_header(path: &Path) -> ChunkHeader {
    let bytes = fs::read(path).unwrap();
    ChunkHeader::parse(&bytes[8..8 + ChunkHeader::SIZE]).unwrap()
}

#[test]
fn single_chunk_full_backup() {
    // One file, one 14-byte chunk, no compression, unlimited volume.
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let data = b"abcdefg1234567";

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("Foo")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(data, 0, file).unwrap();
        library.close_backup().unwrap();
    }
    assert!(path.exists());
    assert!(!volume_path(&dir, 1).exists());

    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    assert_eq!(snapshots.len(), 1);
    let snapshot = &snapshots[0];
    assert_eq!(snapshot.description(), "Foo");
    assert_eq!(snapshot.backup_type(), BackupType::Full);
    assert_eq!(snapshot.num_files(), 1);

    let entry = &snapshot.files()[0];
    assert_eq!(entry.filename(), "/a");
    assert_eq!(entry.chunks().len(), 1);
    assert_eq!(entry.chunks()[0].unencoded_size, 14);

    let restored = library.read_chunk(&entry.chunks()[0]).unwrap();
    assert_eq!(restored, data);
    assert_eq!(first_chunk_header(&path).encoding_type, EncodingType::Raw);
}

#[test]
fn identical_chunks_deduplicate() {
    // The same 14 bytes added at offsets 0, 16, and 32 of one file.
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let data = b"abcdefg1234567";

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("Foo")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        for i in 0..3u64 {
            library.add_chunk(data, 16 * i, file).unwrap();
        }
        library.close_backup().unwrap();
    }

    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    let entry = &snapshots[0].files()[0];
    assert_eq!(entry.chunks().len(), 3);
    assert_eq!(entry.file_size(), 42);

    // All three chunk references resolve to the same stored copy.
    let first = &entry.chunks()[0];
    for chunk in entry.chunks() {
        assert_eq!(chunk.md5sum, first.md5sum);
        assert_eq!(chunk.volume_num, first.volume_num);
        assert_eq!(chunk.volume_offset, first.volume_offset);
    }
    assert_eq!(snapshots[0].deduplicated_size, 14);
    assert_eq!(snapshots[0].unencoded_size, 42);

    // Exactly one payload on disk: magic + one chunk record + trailers.
    let header = first_chunk_header(&path);
    assert_eq!(header.encoded_size, 14);
}

#[test]
fn compression_is_used_only_when_smaller() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    // Highly repetitive data compresses; 14 random-ish bytes do not.
    let compressible = vec![b'a'; 4096];

    {
        let mut library = open_library(&path);
        let mut options = full_backup_options("compress");
        options.enable_compression = true;
        library.create_backup(options).unwrap();
        let file = library.create_file("/big", regular_metadata(), None).unwrap();
        library.add_chunk(&compressible, 0, file).unwrap();
        library.close_backup().unwrap();
    }

    let header = first_chunk_header(&path);
    assert_eq!(header.encoding_type, EncodingType::Zlib);
    assert_eq!(header.unencoded_size, 4096);
    assert!(header.encoded_size < 4096);

    // Round trip through the decoder and digest check.
    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    let chunk = &snapshots[0].files()[0].chunks()[0];
    assert_eq!(library.read_chunk(chunk).unwrap(), compressible);

    // Incompressible chunk in a second library stays raw.
    let dir2 = TempDir::new().unwrap();
    let path2 = volume_path(&dir2, 0);
    {
        let mut library = open_library(&path2);
        let mut options = full_backup_options("raw");
        options.enable_compression = true;
        library.create_backup(options).unwrap();
        let file = library.create_file("/small", regular_metadata(), None).unwrap();
        library.add_chunk(b"abcdefg1234567", 0, file).unwrap();
        library.close_backup().unwrap();
    }
    let header = first_chunk_header(&path2);
    assert_eq!(header.encoding_type, EncodingType::Raw);
    assert_eq!(header.encoded_size, 14);
}

#[test]
fn full_volume_rolls_over_to_next() {
    // 2 MB cap, distinct 256 KiB incompressible-ish chunks: the series
    // must spill into volume 1 and chunks from both stay readable.
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);

    let chunks: Vec<Vec<u8>> = (0..12u8)
        .map(|i| {
            (0..256 * 1024)
                .map(|j| (i as usize * 31 + j * 17) as u8)
                .collect()
        })
        .collect();

    {
        let mut library = open_library(&path);
        let mut options = full_backup_options("spanning");
        options.max_volume_size_mb = 2;
        library.create_backup(options).unwrap();
        let file = library.create_file("/big", regular_metadata(), None).unwrap();
        for (i, data) in chunks.iter().enumerate() {
            library.add_chunk(data, (i * 256 * 1024) as u64, file).unwrap();
        }
        library.close_backup().unwrap();
    }

    assert!(volume_path(&dir, 0).exists());
    assert!(volume_path(&dir, 1).exists());
    let size0 = fs::metadata(volume_path(&dir, 0)).unwrap().len();
    assert!(size0 <= 2 * 1024 * 1024 + 256 * 1024 + 1024);

    // Every chunk reads back across the volume boundary.
    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    let entry = &snapshots[0].files()[0];
    let mut seen_volumes: Vec<u64> = entry.chunks().iter().map(|c| c.volume_num).collect();
    seen_volumes.dedup();
    assert!(seen_volumes.contains(&0));
    assert!(seen_volumes.contains(&1));
    for (i, chunk) in entry.chunks().iter().enumerate() {
        assert_eq!(library.read_chunk(chunk).unwrap(), chunks[i]);
    }
}

#[test]
fn under_full_volume_is_bin_packed() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);

    {
        let mut library = open_library(&path);
        let mut options = full_backup_options("first");
        options.max_volume_size_mb = 20;
        library.create_backup(options).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(b"first backup data", 0, file).unwrap();
        library.close_backup().unwrap();
    }
    {
        // Volume 0 is far below 20 MB, so the second backup appends to
        // it rather than allocating volume 1.
        let mut library = open_library(&path);
        let mut options = full_backup_options("second");
        options.max_volume_size_mb = 20;
        library.create_backup(options).unwrap();
        let file = library.create_file("/b", regular_metadata(), None).unwrap();
        library.add_chunk(b"second backup data", 0, file).unwrap();
        library.close_backup().unwrap();
    }
    assert!(!volume_path(&dir, 1).exists());

    {
        // With a 1 MB cap there is no headroom left: volume 1 appears.
        let mut library = open_library(&path);
        let mut options = full_backup_options("third");
        options.max_volume_size_mb = 1;
        library.create_backup(options).unwrap();
        let file = library.create_file("/c", regular_metadata(), None).unwrap();
        library.add_chunk(b"third backup data", 0, file).unwrap();
        library.close_backup().unwrap();
    }
    assert!(volume_path(&dir, 1).exists());

    // All three snapshots are reachable through the previous-chain.
    let mut library = open_library(&path);
    let filesets = library.load_filesets(true).unwrap();
    let descriptions: Vec<&str> = filesets.iter().map(|f| f.description()).collect();
    assert_eq!(descriptions, vec!["third", "second", "first"]);
}

#[test]
fn dedup_spans_earlier_backups() {
    // A chunk stored by backup 1 is never re-written by backup 2.
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let data = b"shared chunk content";

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("first")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(data, 0, file).unwrap();
        library.close_backup().unwrap();
    }
    let size_after_first = fs::metadata(&path).unwrap().len();

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("second")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(data, 0, file).unwrap();
        library.close_backup().unwrap();
    }

    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, true).unwrap();
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots[0].deduplicated_size, 0);

    // The second snapshot only added descriptors, not payload bytes.
    let growth = fs::metadata(&path).unwrap().len() - size_after_first;
    assert!(growth < 1024, "library grew by {growth} bytes for a deduped chunk");
}

#[test]
fn labels_isolate_snapshot_chains() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);

    let backup = |description: &str, label_id: u64, label_name: &str, content: &[u8]| {
        let mut library = open_library(&path);
        let options = BackupOptions {
            description: description.to_string(),
            backup_type: BackupType::Full,
            label_id,
            label_name: label_name.to_string(),
            ..BackupOptions::default()
        };
        library.create_backup(options).unwrap();
        let file = library.create_file("/f", regular_metadata(), None).unwrap();
        library.add_chunk(content, 0, file).unwrap();
        library.close_backup().unwrap();
    };

    backup("default 1", 0, "", b"default data 1");
    backup("laptop 1", 0, "laptop", b"laptop data 1");
    backup("default 2", 0, "", b"default data 2");

    let mut library = open_library(&path);
    let labels = library.get_labels();
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0].id, 1);
    assert_eq!(labels[0].name, "Default");
    assert_eq!(labels[1].id, 2);
    assert_eq!(labels[1].name, "laptop");

    // Walking a label's parent chain only surfaces that label.
    let defaults = library.load_snapshots(1, true).unwrap();
    let names: Vec<&str> = defaults.iter().map(|f| f.description()).collect();
    assert_eq!(names, vec!["default 2", "default 1"]);
    for fileset in &defaults {
        assert_eq!(fileset.label_id, 1);
    }

    let laptops = library.load_snapshots(2, true).unwrap();
    assert_eq!(laptops.len(), 1);
    assert_eq!(laptops[0].description(), "laptop 1");
    assert_eq!(laptops[0].label_id, 2);
}

#[test]
fn cancelled_volume_is_skipped_but_chunks_dedup() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let shared = b"chunk that survives cancellation";

    // Backup 1 commits normally on volume 0.
    {
        let mut library = open_library(&path);
        let mut options = full_backup_options("committed");
        options.max_volume_size_mb = 1;
        library.create_backup(options).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(b"volume zero data", 0, file).unwrap();
        library.close_backup().unwrap();
    }

    // Backup 2 starts volume 1 (no headroom on volume 0) and cancels.
    {
        let mut library = open_library(&path);
        let mut options = full_backup_options("aborted");
        options.max_volume_size_mb = 1;
        library.create_backup(options).unwrap();
        let file = library.create_file("/b", regular_metadata(), None).unwrap();
        library.add_chunk(shared, 0, file).unwrap();
        library.cancel_backup().unwrap();
    }
    assert!(volume_path(&dir, 1).exists());

    // Labels still come back (from volume 0 past cancelled volume 1).
    let mut library = open_library(&path);
    assert_eq!(library.get_labels().len(), 1);

    // Backup 3 dedups against the cancelled volume's chunk.
    {
        let mut options = full_backup_options("after cancel");
        options.max_volume_size_mb = 1;
        library.create_backup(options).unwrap();
        let file = library.create_file("/b", regular_metadata(), None).unwrap();
        library.add_chunk(shared, 0, file).unwrap();
        library.close_backup().unwrap();
    }
    assert!(volume_path(&dir, 2).exists());

    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, true).unwrap();
    let names: Vec<&str> = snapshots.iter().map(|f| f.description()).collect();
    assert_eq!(names, vec!["after cancel", "committed"]);

    // The re-used chunk points into cancelled volume 1 and still reads.
    let entry = &snapshots[0].files()[0];
    assert_eq!(entry.chunks()[0].volume_num, 1);
    assert_eq!(library.read_chunk(&entry.chunks()[0]).unwrap(), shared);
}

#[test]
fn flipped_payload_byte_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let data = b"data that will be corrupted";

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("Foo")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(data, 0, file).unwrap();
        library.close_backup().unwrap();
    }

    // Flip one payload byte (magic 8 + chunk header 40 = payload start).
    let mut bytes = fs::read(&path).unwrap();
    bytes[8 + ChunkHeader::SIZE] ^= 0xFF;
    fs::write(&path, bytes).unwrap();

    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    let chunk = &snapshots[0].files()[0].chunks()[0];
    match library.read_chunk(chunk) {
        Err(Error::CorruptBackup(message)) => {
            assert_eq!(message, "Chunk MD5 mismatch");
        }
        other => panic!("expected CorruptBackup, got {other:?}"),
    }
}

#[test]
fn missing_volume_consults_change_callback() {
    let dir = TempDir::new().unwrap();
    let path = volume_path(&dir, 0);
    let data = b"relocatable volume";

    {
        let mut library = open_library(&path);
        library.create_backup(full_backup_options("moved")).unwrap();
        let file = library.create_file("/a", regular_metadata(), None).unwrap();
        library.add_chunk(data, 0, file).unwrap();
        library.close_backup().unwrap();
    }

    // Load the snapshot (and its chunk refs) before moving the file.
    let mut library = open_library(&path);
    let snapshots = library.load_snapshots(1, false).unwrap();
    let chunk = snapshots[0].files()[0].chunks()[0];

    let moved = dir.path().join("elsewhere.0.bkp");
    fs::rename(&path, &moved).unwrap();

    // Without a callback the read fails; with one it recovers.
    let mut fresh = BackupLibrary::new(
        path.to_string_lossy(),
        Box::new(Md5Generator),
        Box::new(ZlibEncoder),
        Box::new(DiskVolumeFactory),
    );
    fresh.init().unwrap();
    assert!(matches!(fresh.read_chunk(&chunk), Err(Error::NoSuchFile(_))));

    let moved_str = moved.to_string_lossy().into_owned();
    fresh.set_volume_change_callback(Box::new(move |_wanted| Some(moved_str.clone())));
    assert_eq!(fresh.read_chunk(&chunk).unwrap(), data);
}
