#![forbid(unsafe_code)]
//! Copy-on-write snapshots for REVFS.
//!
//! Each snapshot owns a diff sidecar `<image>.snap.<name>.diff` holding
//! `(block_id, pre_image)` records. Pre-images are captured lazily on the
//! first post-snapshot write of a block; a block appears at most once per
//! diff. Restoring applies every captured pre-image back into the image
//! and deletes the diff, returning the image to its state at snapshot
//! creation.

use revfs_error::{Result, VfsError};
use revfs_types::{read_le_u32, BlockId, BLOCK_SIZE};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bytes per diff record: a u32 block id followed by the pre-image.
const DIFF_RECORD_LEN: usize = 4 + BLOCK_SIZE as usize;

/// One named snapshot: its diff sidecar and the set of already captured
/// blocks.
#[derive(Debug)]
pub struct SnapshotMeta {
    name: String,
    diff_path: PathBuf,
    captured: HashSet<u32>,
}

impl SnapshotMeta {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn diff_path(&self) -> &Path {
        &self.diff_path
    }

    #[must_use]
    pub fn captured_blocks(&self) -> usize {
        self.captured.len()
    }
}

/// Sidecar path for snapshot `name` of `image`.
#[must_use]
pub fn diff_path_for(image: &Path, name: &str) -> PathBuf {
    let mut os = OsString::from(image.as_os_str());
    os.push(format!(".snap.{name}.diff"));
    PathBuf::from(os)
}

/// The set of snapshots active for one image.
#[derive(Debug)]
pub struct SnapshotSet {
    image_path: PathBuf,
    snapshots: BTreeMap<String, SnapshotMeta>,
}

impl SnapshotSet {
    /// Empty set bound to `image`.
    #[must_use]
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image_path: image.into(),
            snapshots: BTreeMap::new(),
        }
    }

    /// Rebuild the set by scanning the image's directory for sibling
    /// `<image>.snap.<name>.diff` files, replaying each diff's block ids.
    pub fn discover(image: impl Into<PathBuf>) -> Result<Self> {
        let image_path: PathBuf = image.into();
        let mut set = Self::new(&image_path);

        let parent = match image_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let Some(base) = image_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(set);
        };
        let prefix = format!("{base}.snap.");

        let entries = match std::fs::read_dir(&parent) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(set),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let Some(rest) = file_name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(name) = rest.strip_suffix(".diff") else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let diff_path = entry.path();
            let captured = read_captured_blocks(&diff_path)?;
            debug!(
                snapshot = name,
                blocks = captured.len(),
                "snapshot discovered"
            );
            set.snapshots.insert(
                name.to_owned(),
                SnapshotMeta {
                    name: name.to_owned(),
                    diff_path,
                    captured,
                },
            );
        }
        Ok(set)
    }

    /// Register a new snapshot with an empty diff file. An existing
    /// snapshot of the same name is reset.
    pub fn create(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(VfsError::Invalid("snapshot name is empty".to_owned()));
        }
        let diff_path = diff_path_for(&self.image_path, name);
        // Truncate so a recreated snapshot starts from this instant.
        let _ = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&diff_path)?;
        info!(snapshot = name, "snapshot created");
        self.snapshots.insert(
            name.to_owned(),
            SnapshotMeta {
                name: name.to_owned(),
                diff_path,
                captured: HashSet::new(),
            },
        );
        Ok(())
    }

    /// Capture `pre_image` for every active snapshot that has not yet seen
    /// `block`. A snapshot whose diff cannot be extended is left uncaptured
    /// and logged; the write itself must not fail on snapshot bookkeeping.
    pub fn record_pre_image(&mut self, block: BlockId, pre_image: &[u8]) {
        debug_assert_eq!(pre_image.len(), BLOCK_SIZE as usize);
        for meta in self.snapshots.values_mut() {
            if meta.captured.contains(&block.0) {
                continue;
            }
            match append_diff_record(&meta.diff_path, block, pre_image) {
                Ok(()) => {
                    let _ = meta.captured.insert(block.0);
                }
                Err(err) => {
                    warn!(
                        snapshot = meta.name.as_str(),
                        block = block.0,
                        error = %err,
                        "failed to capture pre-image"
                    );
                }
            }
        }
    }

    /// Snapshot names in lexicographic order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshots.keys().cloned().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.snapshots.contains_key(name)
    }
}

fn append_diff_record(diff_path: &Path, block: BlockId, pre_image: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(diff_path)?;
    let mut record = Vec::with_capacity(DIFF_RECORD_LEN);
    record.extend_from_slice(&block.0.to_le_bytes());
    record.extend_from_slice(pre_image);
    file.write_all(&record)?;
    file.flush()?;
    Ok(())
}

fn read_captured_blocks(diff_path: &Path) -> Result<HashSet<u32>> {
    let bytes = match std::fs::read(diff_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(err) => return Err(err.into()),
    };
    let mut captured = HashSet::new();
    let mut offset = 0_usize;
    while offset + DIFF_RECORD_LEN <= bytes.len() {
        let block = read_le_u32(&bytes, offset).map_err(VfsError::from)?;
        let _ = captured.insert(block);
        offset += DIFF_RECORD_LEN;
    }
    Ok(captured)
}

/// Restore snapshot `name` into the (unmounted) image: write every captured
/// pre-image back at its home block, then delete the diff. The checksum
/// sidecar is removed so restored blocks read back without stale warnings.
pub fn restore_into(image: &Path, name: &str) -> Result<()> {
    let diff_path = diff_path_for(image, name);
    let bytes = match std::fs::read(&diff_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(VfsError::NotFound(format!("snapshot {name}")));
        }
        Err(err) => return Err(err.into()),
    };

    let file = OpenOptions::new().read(true).write(true).open(image)?;
    let mut restored = 0_u64;
    let mut offset = 0_usize;
    while offset + DIFF_RECORD_LEN <= bytes.len() {
        let block = read_le_u32(&bytes, offset).map_err(VfsError::from)?;
        let payload = &bytes[offset + 4..offset + DIFF_RECORD_LEN];
        file.write_all_at(payload, u64::from(block) * u64::from(BLOCK_SIZE))?;
        restored += 1;
        offset += DIFF_RECORD_LEN;
    }
    file.sync_all()?;
    drop(file);

    std::fs::remove_file(&diff_path)?;
    let mut checksum_path = OsString::from(image.as_os_str());
    checksum_path.push(".checksum");
    let _ = std::fs::remove_file(PathBuf::from(checksum_path));

    info!(snapshot = name, restored, "snapshot restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pre_image(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE as usize]
    }

    fn make_image(dir: &Path, blocks: u32) -> PathBuf {
        let path = dir.join("img");
        std::fs::write(&path, vec![0_u8; (blocks * BLOCK_SIZE) as usize]).unwrap();
        path
    }

    #[test]
    fn create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 4);
        let mut set = SnapshotSet::new(&image);
        set.create("s1").unwrap();
        set.create("s2").unwrap();
        assert_eq!(set.names(), vec!["s1".to_owned(), "s2".to_owned()]);
        assert!(set.contains("s1"));
        assert!(diff_path_for(&image, "s1").exists());
    }

    #[test]
    fn empty_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 4);
        let mut set = SnapshotSet::new(&image);
        assert!(matches!(set.create(""), Err(VfsError::Invalid(_))));
    }

    #[test]
    fn pre_image_captured_once_per_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 4);
        let mut set = SnapshotSet::new(&image);
        set.create("s1").unwrap();

        set.record_pre_image(BlockId(2), &pre_image(0xAA));
        set.record_pre_image(BlockId(2), &pre_image(0xBB));
        set.record_pre_image(BlockId(3), &pre_image(0xCC));

        let diff = std::fs::read(diff_path_for(&image, "s1")).unwrap();
        // Exactly two records: block 2 (first capture only) and block 3.
        assert_eq!(diff.len(), 2 * DIFF_RECORD_LEN);
        assert_eq!(&diff[..4], &2_u32.to_le_bytes());
        assert_eq!(diff[4], 0xAA);
    }

    #[test]
    fn discover_rebuilds_captured_set() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 4);
        let mut set = SnapshotSet::new(&image);
        set.create("s1").unwrap();
        set.record_pre_image(BlockId(1), &pre_image(0x01));
        set.record_pre_image(BlockId(2), &pre_image(0x02));
        drop(set);

        let rediscovered = SnapshotSet::discover(&image).unwrap();
        assert_eq!(rediscovered.names(), vec!["s1".to_owned()]);
        let meta = &rediscovered.snapshots["s1"];
        assert_eq!(meta.captured_blocks(), 2);

        // A rediscovered snapshot must not re-capture known blocks.
        let mut set = rediscovered;
        set.record_pre_image(BlockId(1), &pre_image(0xFF));
        let diff = std::fs::read(diff_path_for(&image, "s1")).unwrap();
        assert_eq!(diff.len(), 2 * DIFF_RECORD_LEN);
    }

    #[test]
    fn restore_applies_pre_images_and_deletes_diff() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 4);
        // Blocks 1 and 3 currently hold "new" content.
        {
            let file = OpenOptions::new().write(true).open(&image).unwrap();
            file.write_all_at(&pre_image(0x99), u64::from(BLOCK_SIZE))
                .unwrap();
            file.write_all_at(&pre_image(0x77), 3 * u64::from(BLOCK_SIZE))
                .unwrap();
        }
        let mut set = SnapshotSet::new(&image);
        set.create("s1").unwrap();
        set.record_pre_image(BlockId(1), &pre_image(0x10));
        set.record_pre_image(BlockId(3), &pre_image(0x30));
        drop(set);

        // Stale checksum sidecar must be dropped by restore.
        let mut checksum = OsString::from(image.as_os_str());
        checksum.push(".checksum");
        let checksum = PathBuf::from(checksum);
        std::fs::write(&checksum, [0_u8; 16]).unwrap();

        restore_into(&image, "s1").unwrap();

        let bytes = std::fs::read(&image).unwrap();
        let bs = BLOCK_SIZE as usize;
        assert!(bytes[bs..2 * bs].iter().all(|&b| b == 0x10));
        assert!(bytes[3 * bs..4 * bs].iter().all(|&b| b == 0x30));
        assert!(!diff_path_for(&image, "s1").exists());
        assert!(!checksum.exists());
    }

    #[test]
    fn restore_unknown_snapshot_fails() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 2);
        assert!(matches!(
            restore_into(&image, "nope"),
            Err(VfsError::NotFound(_))
        ));
    }

    #[test]
    fn discover_ignores_unrelated_files() {
        let dir = tempfile::tempdir().unwrap();
        let image = make_image(dir.path(), 2);
        std::fs::write(dir.path().join("other.snap.x.diff"), b"junk").unwrap();
        std::fs::write(dir.path().join("img.snap..diff"), b"junk").unwrap();
        std::fs::write(dir.path().join("img.snapshots"), b"junk").unwrap();
        let set = SnapshotSet::discover(&image).unwrap();
        assert!(set.is_empty());
    }
}
