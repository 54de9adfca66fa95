//! End-to-end tests over real image files in a temp directory.

use revfs::{block_checksum, open_flags, FileType, Vfs, VfsError, BLOCK_SIZE};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

const CACHE_CAPACITY: usize = 128;

fn fresh_image(dir: &Path) -> PathBuf {
    dir.join("volume.img")
}

fn format_10mib(dir: &Path) -> (Vfs, PathBuf) {
    let image = fresh_image(dir);
    let vfs = Vfs::new();
    vfs.format(&image, 10, CACHE_CAPACITY).unwrap();
    (vfs, image)
}

fn write_file(vfs: &Vfs, path: &str, data: &[u8]) {
    vfs.create_file(path, 0o644).unwrap();
    let fd = vfs.open(path, open_flags::O_RDWR).unwrap();
    assert_eq!(vfs.write(fd, data).unwrap(), data.len());
    vfs.close(fd).unwrap();
}

fn read_file(vfs: &Vfs, path: &str) -> Vec<u8> {
    let fd = vfs.open(path, open_flags::O_RDONLY).unwrap();
    let size = vfs.seek(fd, SeekFrom::End(0)).unwrap();
    vfs.seek(fd, SeekFrom::Start(0)).unwrap();
    let data = vfs.read(fd, usize::try_from(size).unwrap()).unwrap();
    vfs.close(fd).unwrap();
    data
}

// ── Seed scenario 1: format / mount / list ──────────────────────────────────

#[test]
fn format_mount_list() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());

    // A fresh root lists empty, with only its own directory block in use.
    assert!(vfs.readdir("/").unwrap().is_empty());
    let stats = vfs.fs_stats().unwrap();
    assert!(stats.used_size > 0);
    assert_eq!(stats.used_data_blocks, 1);

    vfs.mkdir("/papers", 0o755).unwrap();
    vfs.mkdir("/users", 0o755).unwrap();
    let mut names: Vec<String> = vfs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["papers".to_owned(), "users".to_owned()]);
    assert!(vfs.is_directory("/papers").unwrap());
    assert!(!vfs.is_directory("/missing").unwrap());
}

// ── Seed scenario 2: small file round-trip ──────────────────────────────────

#[test]
fn write_and_read_small_file() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    vfs.mkdir("/papers", 0o755).unwrap();
    vfs.create_file("/papers/p.txt", 0o644).unwrap();

    let text = b"This is a research paper about operating systems.";
    assert_eq!(text.len(), 49);
    let fd = vfs.open("/papers/p.txt", open_flags::O_RDWR).unwrap();
    assert_eq!(vfs.write(fd, text).unwrap(), 49);
    vfs.seek(fd, SeekFrom::Start(0)).unwrap();
    let back = vfs.read(fd, 256).unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(back, text);
}

// ── Seed scenario 3: multi-block file through the indirect map ──────────────

#[test]
fn large_file_spans_indirect_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());

    let data: Vec<u8> = (0..50_000_u32).map(|i| b'A' + (i % 26) as u8).collect();
    write_file(&vfs, "/big.bin", &data);

    // 50 000 bytes exceed the 12 direct blocks (49 152 bytes), so the
    // indirect block must be live.
    let fd = vfs.open("/big.bin", open_flags::O_RDONLY).unwrap();
    vfs.seek(fd, SeekFrom::Start(39_000)).unwrap();
    let slice = vfs.read(fd, 5_000).unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(slice, &data[39_000..44_000]);

    assert_eq!(read_file(&vfs, "/big.bin"), data);
}

// ── Seed scenario 4: delete and reuse freed blocks ──────────────────────────

#[test]
fn freed_blocks_are_reused() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    let payload = vec![0x42_u8; BLOCK_SIZE as usize];

    let free_before = vfs.fs_stats().unwrap().free_blocks;
    for i in 0..10 {
        write_file(&vfs, &format!("/f{i}"), &payload);
    }
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, free_before - 10);

    for i in 0..5 {
        vfs.unlink(&format!("/f{i}")).unwrap();
    }
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, free_before - 5);

    write_file(&vfs, "/fresh", &payload);
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, free_before - 6);
    assert_eq!(read_file(&vfs, "/fresh"), payload);
}

// ── Seed scenario 5: snapshot round-trip ────────────────────────────────────

#[test]
fn snapshot_restores_point_in_time() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());

    write_file(&vfs, "/a.txt", b"v1");
    vfs.create_snapshot("s1").unwrap();
    assert_eq!(vfs.list_snapshots().unwrap(), vec!["s1".to_owned()]);

    let fd = vfs.open("/a.txt", open_flags::O_RDWR).unwrap();
    vfs.write(fd, b"v2").unwrap();
    vfs.close(fd).unwrap();
    assert_eq!(read_file(&vfs, "/a.txt"), b"v2");

    vfs.unmount().unwrap();
    vfs.restore_snapshot("s1").unwrap();
    vfs.mount(&fresh_image(dir.path()), CACHE_CAPACITY).unwrap();
    assert_eq!(read_file(&vfs, "/a.txt"), b"v1");
    // A restored snapshot is consumed.
    assert!(vfs.list_snapshots().unwrap().is_empty());
}

#[test]
fn snapshot_restores_deleted_files_and_tree() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());

    vfs.mkdir("/keep", 0o755).unwrap();
    write_file(&vfs, "/keep/data", b"original content");
    vfs.create_snapshot("pristine").unwrap();

    // Mutate arbitrarily: delete, recreate, grow.
    vfs.unlink("/keep/data").unwrap();
    write_file(&vfs, "/keep/other", &vec![7_u8; 3 * BLOCK_SIZE as usize]);
    vfs.mkdir("/new", 0o755).unwrap();

    vfs.unmount().unwrap();
    vfs.restore_snapshot("pristine").unwrap();
    vfs.mount(&image, CACHE_CAPACITY).unwrap();

    assert_eq!(read_file(&vfs, "/keep/data"), b"original content");
    assert!(!vfs.exists("/keep/other").unwrap());
    assert!(!vfs.exists("/new").unwrap());
}

// ── Seed scenario 6: journal replay with a corrupted record ─────────────────

#[test]
fn journal_replay_applies_valid_skips_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());

    // The first file write lands in the second data block: a 10 MiB image
    // has 2560 blocks, 320 inodes over 10 table blocks, one bitmap block,
    // so data starts at block 12 with the root directory; /j.txt's data is
    // block 13.
    write_file(&vfs, "/j.txt", &vec![b'x'; BLOCK_SIZE as usize]);
    vfs.unmount().unwrap();

    let journal_path = dir.path().join("volume.img.journal");
    let valid_payload = vec![0xAB_u8; BLOCK_SIZE as usize];
    let mut journal = Vec::new();
    journal.extend_from_slice(&13_u32.to_le_bytes());
    journal.extend_from_slice(&BLOCK_SIZE.to_le_bytes());
    journal.extend_from_slice(&block_checksum(&valid_payload).to_le_bytes());
    journal.extend_from_slice(&valid_payload);
    // Second record: checksum field flipped, must be skipped.
    let corrupt_payload = vec![0xCD_u8; BLOCK_SIZE as usize];
    journal.extend_from_slice(&14_u32.to_le_bytes());
    journal.extend_from_slice(&BLOCK_SIZE.to_le_bytes());
    journal.extend_from_slice(&(block_checksum(&corrupt_payload) ^ 1).to_le_bytes());
    journal.extend_from_slice(&corrupt_payload);
    std::fs::write(&journal_path, &journal).unwrap();

    vfs.mount(&image, CACHE_CAPACITY).unwrap();
    let stats = vfs.journal_stats().unwrap();
    assert_eq!(stats.replayed, 1);
    assert!(stats.recovered);
    assert_eq!(stats.pending, 0);
    assert_eq!(std::fs::metadata(&journal_path).unwrap().len(), 0);

    // Block 13 now carries the replayed payload.
    assert_eq!(read_file(&vfs, "/j.txt"), valid_payload);
}

// ── Universal invariants ────────────────────────────────────────────────────

#[test]
fn unmount_mount_is_a_fixed_point() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());

    vfs.mkdir("/d", 0o755).unwrap();
    write_file(&vfs, "/d/one", b"first");
    write_file(&vfs, "/two", &vec![9_u8; 10_000]);
    let stats_before = vfs.fs_stats().unwrap();
    let listing_before: Vec<_> = vfs.readdir("/").unwrap();

    vfs.unmount().unwrap();
    vfs.mount(&image, CACHE_CAPACITY).unwrap();

    let stats_after = vfs.fs_stats().unwrap();
    assert_eq!(stats_before.free_blocks, stats_after.free_blocks);
    assert_eq!(stats_before.free_inodes, stats_after.free_inodes);
    assert_eq!(stats_before.total_blocks, stats_after.total_blocks);
    assert_eq!(listing_before, vfs.readdir("/").unwrap());
    assert_eq!(read_file(&vfs, "/d/one"), b"first");
    assert_eq!(read_file(&vfs, "/two"), vec![9_u8; 10_000]);
}

#[test]
fn sparse_reads_return_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    vfs.create_file("/sparse", 0o644).unwrap();

    let fd = vfs.open("/sparse", open_flags::O_RDWR).unwrap();
    vfs.seek(fd, SeekFrom::Start(10_000)).unwrap();
    vfs.write(fd, b"end").unwrap();
    vfs.seek(fd, SeekFrom::Start(0)).unwrap();
    let data = vfs.read(fd, 20_000).unwrap();
    vfs.close(fd).unwrap();

    assert_eq!(data.len(), 10_003);
    assert!(data[..8192].iter().all(|&b| b == 0), "holes must read as zeros");
    assert_eq!(&data[10_000..], b"end");
}

#[test]
fn block_boundary_writes_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    vfs.create_file("/bounds", 0o644).unwrap();
    let fd = vfs.open("/bounds", open_flags::O_RDWR).unwrap();

    // Hit a direct index, the direct/indirect crossover, and an indirect
    // index.
    for index in [0_u64, 11, 12, 13, 100] {
        let marker = format!("block-{index}");
        vfs.seek(fd, SeekFrom::Start(index * u64::from(BLOCK_SIZE)))
            .unwrap();
        vfs.write(fd, marker.as_bytes()).unwrap();
    }
    for index in [0_u64, 11, 12, 13, 100] {
        let marker = format!("block-{index}");
        vfs.seek(fd, SeekFrom::Start(index * u64::from(BLOCK_SIZE)))
            .unwrap();
        assert_eq!(vfs.read(fd, marker.len()).unwrap(), marker.as_bytes());
    }
    vfs.close(fd).unwrap();
}

#[test]
fn free_counts_match_after_churn() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());
    let baseline = vfs.fs_stats().unwrap();

    write_file(&vfs, "/churn", &vec![1_u8; 6 * BLOCK_SIZE as usize]);
    vfs.unlink("/churn").unwrap();

    let stats = vfs.fs_stats().unwrap();
    assert_eq!(stats.free_blocks, baseline.free_blocks);
    assert_eq!(stats.free_inodes, baseline.free_inodes);

    // The persisted counts agree with the persisted bitmap.
    vfs.unmount().unwrap();
    vfs.mount(&image, CACHE_CAPACITY).unwrap();
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, baseline.free_blocks);
}

// ── Operation semantics ─────────────────────────────────────────────────────

#[test]
fn truncate_on_open_frees_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    let free_before = vfs.fs_stats().unwrap().free_blocks;
    write_file(&vfs, "/t", &vec![5_u8; 3 * BLOCK_SIZE as usize]);
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, free_before - 3);

    let fd = vfs
        .open("/t", open_flags::O_RDWR | open_flags::O_TRUNC)
        .unwrap();
    assert_eq!(vfs.fs_stats().unwrap().free_blocks, free_before);
    assert_eq!(vfs.read(fd, 100).unwrap(), Vec::<u8>::new());
    vfs.close(fd).unwrap();

    // Read-only opens must not truncate.
    write_file(&vfs, "/t2", b"stay");
    let fd = vfs
        .open("/t2", open_flags::O_RDONLY | open_flags::O_TRUNC)
        .unwrap();
    assert_eq!(vfs.read(fd, 16).unwrap(), b"stay");
    vfs.close(fd).unwrap();
}

#[test]
fn seek_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    write_file(&vfs, "/s", b"0123456789");
    let fd = vfs.open("/s", open_flags::O_RDONLY).unwrap();

    assert_eq!(vfs.seek(fd, SeekFrom::Start(4)).unwrap(), 4);
    assert_eq!(vfs.read(fd, 2).unwrap(), b"45");
    assert_eq!(vfs.seek(fd, SeekFrom::Current(-3)).unwrap(), 3);
    assert_eq!(vfs.seek(fd, SeekFrom::End(-1)).unwrap(), 9);
    assert_eq!(vfs.read(fd, 10).unwrap(), b"9");
    assert!(matches!(
        vfs.seek(fd, SeekFrom::Current(-100)),
        Err(VfsError::Invalid(_))
    ));
    vfs.close(fd).unwrap();
}

#[test]
fn namespace_error_kinds() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    vfs.mkdir("/d", 0o755).unwrap();
    write_file(&vfs, "/d/f", b"x");

    assert!(matches!(
        vfs.create_file("/d/f", 0o644),
        Err(VfsError::AlreadyExists)
    ));
    assert!(matches!(vfs.mkdir("/d", 0o755), Err(VfsError::AlreadyExists)));
    assert!(matches!(
        vfs.create_file("/nowhere/f", 0o644),
        Err(VfsError::NotFound(_))
    ));
    assert!(matches!(vfs.unlink("/d"), Err(VfsError::NotAFile)));
    assert!(matches!(vfs.rmdir("/d/f"), Err(VfsError::NotADirectory)));
    assert!(matches!(vfs.rmdir("/d"), Err(VfsError::NotEmpty)));
    assert!(matches!(
        vfs.open("/missing", open_flags::O_RDONLY),
        Err(VfsError::NotFound(_))
    ));
    assert!(matches!(
        vfs.open("/d", open_flags::O_RDONLY),
        Err(VfsError::NotAFile)
    ));
    let long = format!("/{}", "n".repeat(300));
    assert!(matches!(
        vfs.create_file(&long, 0o644),
        Err(VfsError::NameTooLong)
    ));

    vfs.unlink("/d/f").unwrap();
    vfs.rmdir("/d").unwrap();
    assert!(!vfs.exists("/d").unwrap());
}

#[test]
fn state_machine_guards() {
    let dir = tempfile::tempdir().unwrap();
    let image = fresh_image(dir.path());
    let vfs = Vfs::new();

    assert!(matches!(vfs.readdir("/"), Err(VfsError::NotMounted)));
    assert!(matches!(vfs.unmount(), Err(VfsError::NotMounted)));
    assert!(matches!(vfs.fs_stats(), Err(VfsError::NotMounted)));

    vfs.format(&image, 10, CACHE_CAPACITY).unwrap();
    assert!(vfs.is_mounted());
    assert!(matches!(
        vfs.format(&image, 10, CACHE_CAPACITY),
        Err(VfsError::AlreadyMounted)
    ));
    assert!(matches!(
        vfs.mount(&image, CACHE_CAPACITY),
        Err(VfsError::AlreadyMounted)
    ));
    assert!(matches!(
        vfs.restore_snapshot("s"),
        Err(VfsError::AlreadyMounted)
    ));

    vfs.unmount().unwrap();
    assert!(!vfs.is_mounted());
}

#[test]
fn mount_rejects_foreign_image() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("junk.img");
    std::fs::write(&path, vec![0_u8; 2 * BLOCK_SIZE as usize]).unwrap();
    let vfs = Vfs::new();
    assert!(matches!(
        vfs.mount(&path, CACHE_CAPACITY),
        Err(VfsError::BadImage(_))
    ));
    assert!(!vfs.is_mounted());
}

#[test]
fn readdir_preserves_insertion_order() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    for name in ["zeta", "alpha", "mid"] {
        vfs.create_file(&format!("/{name}"), 0o644).unwrap();
    }
    let entries = vfs.readdir("/").unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    assert!(entries.iter().all(|e| e.file_type == FileType::Regular));
}

#[test]
fn cache_stats_accumulate() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, _image) = format_10mib(dir.path());
    write_file(&vfs, "/c", &vec![3_u8; 2 * BLOCK_SIZE as usize]);
    let _ = read_file(&vfs, "/c");
    let stats = vfs.cache_stats().unwrap();
    assert!(stats.total_requests() > 0);
    assert!(stats.hits > 0, "re-reads must hit the cache");
    assert_eq!(stats.total_requests(), stats.hits + stats.misses);
}

#[test]
fn backup_surface_aliases_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());
    write_file(&vfs, "/b.txt", b"before");
    vfs.create_backup("nightly").unwrap();
    assert_eq!(vfs.list_backups().unwrap(), vec!["nightly".to_owned()]);

    let fd = vfs.open("/b.txt", open_flags::O_RDWR).unwrap();
    vfs.write(fd, b"AFTER!").unwrap();
    vfs.close(fd).unwrap();

    vfs.unmount().unwrap();
    vfs.restore_backup("nightly").unwrap();
    vfs.mount(&image, CACHE_CAPACITY).unwrap();
    assert_eq!(read_file(&vfs, "/b.txt"), b"before");
}

#[test]
fn snapshots_survive_remount_via_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let (vfs, image) = format_10mib(dir.path());
    write_file(&vfs, "/x", b"one");
    vfs.create_snapshot("persisted").unwrap();
    write_file(&vfs, "/y", b"two");
    vfs.unmount().unwrap();

    vfs.mount(&image, CACHE_CAPACITY).unwrap();
    assert_eq!(vfs.list_snapshots().unwrap(), vec!["persisted".to_owned()]);

    // Post-remount writes keep feeding the rediscovered snapshot, so a
    // restore still lands on the creation instant.
    let fd = vfs.open("/x", open_flags::O_RDWR).unwrap();
    vfs.write(fd, b"ONE").unwrap();
    vfs.close(fd).unwrap();
    vfs.unmount().unwrap();
    vfs.restore_snapshot("persisted").unwrap();
    vfs.mount(&image, CACHE_CAPACITY).unwrap();
    assert_eq!(read_file(&vfs, "/x"), b"one");
    assert!(!vfs.exists("/y").unwrap());
}
