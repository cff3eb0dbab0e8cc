//! File hash caches.
//!
//! Three variants behind one tagged type: the recording cache used when
//! assembling a job descriptor, the plain pass-through used by purely
//! local builds, and the replay cache a remote worker builds from a
//! deserialized [`JobState`](stampede_common::JobState).
//!
//! The recording variant is a faithful decorator: hash values come back
//! exactly as the undecorated cache produced them; recording happens on
//! the side, at most once per (cell, path).

use crate::cells::{CellError, CellIndexer};
use stampede_common::paths;
use stampede_common::protocol::{CellFileHashes, FileHashEntry, MtimeClass};
use stampede_common::types::{CellIndex, FileHash};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Files modified within this window of the scan are flagged volatile so
/// the coordinator re-validates them before trusting the hash.
const MTIME_VOLATILE_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HashCacheError {
    #[error("failed to hash {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no recorded hash for {}", .path.display())]
    MissingRemoteEntry { path: PathBuf },
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// The undecorated hash source.
pub trait FileHashLoader: Send + Sync {
    fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError>;

    fn hash_archive_member(
        &self,
        archive: &Path,
        member: &Path,
    ) -> Result<FileHash, HashCacheError>;
}

/// Disk-backed loader: SHA-256 over file bytes, memoized per path.
/// Directories hash their sorted child names so tree shape changes are
/// visible without walking contents twice.
#[derive(Default)]
pub struct DiskHashCache {
    memo: Mutex<HashMap<PathBuf, FileHash>>,
}

impl DiskHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn compute(path: &Path) -> Result<FileHash, HashCacheError> {
        use sha2::{Digest, Sha256};
        let io = |source| HashCacheError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut hasher = Sha256::new();
        let metadata = std::fs::metadata(path).map_err(io)?;
        if metadata.is_dir() {
            let mut names: Vec<String> = std::fs::read_dir(path)
                .map_err(io)?
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            for name in names {
                hasher.update(name.as_bytes());
                hasher.update([0u8]);
            }
        } else {
            hasher.update(std::fs::read(path).map_err(io)?);
        }
        Ok(FileHash::from_bytes(hasher.finalize().into()))
    }
}

impl FileHashLoader for DiskHashCache {
    fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError> {
        {
            let memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hash) = memo.get(path) {
                return Ok(*hash);
            }
        }
        let hash = Self::compute(path)?;
        self.memo
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    fn hash_archive_member(
        &self,
        archive: &Path,
        member: &Path,
    ) -> Result<FileHash, HashCacheError> {
        // Archive members are keyed by the synthetic path `ar!member`;
        // the digest covers the archive bytes plus the member name, so a
        // member rename is visible even when archive bytes are unchanged.
        use sha2::{Digest, Sha256};
        let archive_hash = self.hash_file(archive)?;
        let mut hasher = Sha256::new();
        hasher.update(archive_hash.as_bytes());
        hasher.update(paths::to_wire(member).as_bytes());
        Ok(FileHash::from_bytes(hasher.finalize().into()))
    }
}

// ── Recording ────────────────────────────────────────────────────────────

struct CellBuffer {
    seen: HashSet<String>,
    entries: Vec<FileHashEntry>,
}

/// Collects one [`FileHashEntry`] per (cell, path) across all
/// rule-key workers.
pub struct FileHashRecorder {
    cells: Arc<CellIndexer>,
    buffers: Mutex<BTreeMap<CellIndex, CellBuffer>>,
}

impl FileHashRecorder {
    pub fn new(cells: Arc<CellIndexer>) -> Self {
        Self {
            cells,
            buffers: Mutex::new(BTreeMap::new()),
        }
    }

    fn record(&self, path: &Path, archive_member: Option<&Path>, hash: FileHash) {
        let (cell_index, wire_path, path_is_absolute) = match self.cells.cell_for_path(path) {
            Ok((index, rel)) => (index, paths::to_wire(&rel), false),
            // Outside every known cell root: keep the absolute path in
            // the root cell's table rather than inventing a cell.
            Err(_) => (CellIndex::ROOT, paths::to_wire(path), true),
        };

        let member_wire = archive_member.map(|m| paths::to_wire(m));
        let dedup_key = match &member_wire {
            Some(member) => format!("{wire_path}!{member}"),
            None => wire_path.clone(),
        };

        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = buffers.entry(cell_index).or_insert_with(|| CellBuffer {
            seen: HashSet::new(),
            entries: Vec::new(),
        });
        if !buffer.seen.insert(dedup_key) {
            return;
        }

        let (is_directory, is_root_symlink, mtime_class) = classify(path);
        buffer.entries.push(FileHashEntry {
            path: wire_path,
            archive_member_path: member_wire,
            hash,
            mtime_class,
            is_directory,
            is_root_symlink,
            path_is_absolute,
            contents: None,
        });
    }

    /// Freeze and return the per-cell tables, ordered by cell index.
    /// Call only after every rule key has been computed.
    pub fn snapshot(&self) -> Vec<CellFileHashes> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .iter()
            .map(|(index, buffer)| CellFileHashes {
                cell_index: index.as_u32(),
                entries: buffer.entries.clone(),
            })
            .collect()
    }
}

fn classify(path: &Path) -> (bool, bool, MtimeClass) {
    let is_root_symlink = path
        .symlink_metadata()
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false);
    let metadata = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(_) => return (false, is_root_symlink, MtimeClass::Stable),
    };
    let mtime_class = match metadata.modified() {
        Ok(modified) => match SystemTime::now().duration_since(modified) {
            Ok(age) if age >= MTIME_VOLATILE_WINDOW => MtimeClass::Stable,
            _ => MtimeClass::Volatile,
        },
        Err(_) => MtimeClass::Stable,
    };
    (metadata.is_dir(), is_root_symlink, mtime_class)
}

/// Decorator that records every successful lookup.
pub struct RecordingHashCache {
    delegate: Arc<dyn FileHashLoader>,
    recorder: Arc<FileHashRecorder>,
}

impl RecordingHashCache {
    pub fn new(delegate: Arc<dyn FileHashLoader>, recorder: Arc<FileHashRecorder>) -> Self {
        Self { delegate, recorder }
    }

    pub fn recorder(&self) -> Arc<FileHashRecorder> {
        Arc::clone(&self.recorder)
    }
}

impl FileHashLoader for RecordingHashCache {
    fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError> {
        let hash = self.delegate.hash_file(path)?;
        self.recorder.record(path, None, hash);
        Ok(hash)
    }

    fn hash_archive_member(
        &self,
        archive: &Path,
        member: &Path,
    ) -> Result<FileHash, HashCacheError> {
        let hash = self.delegate.hash_archive_member(archive, member)?;
        self.recorder.record(archive, Some(member), hash);
        Ok(hash)
    }
}

// ── Remote replay ────────────────────────────────────────────────────────

/// Serves hashes recorded on the submitting host; used on the remote
/// side where the files themselves may not exist yet.
pub struct RemoteReplayCache {
    cell_root: PathBuf,
    by_path: HashMap<String, FileHash>,
}

impl RemoteReplayCache {
    pub fn new(cell_root: PathBuf, hashes: &CellFileHashes) -> Self {
        let by_path = hashes
            .entries
            .iter()
            .map(|entry| {
                let key = match &entry.archive_member_path {
                    Some(member) => format!("{}!{member}", entry.path),
                    None => entry.path.clone(),
                };
                (key, entry.hash)
            })
            .collect();
        Self { cell_root, by_path }
    }

    fn lookup(&self, path: &Path, member: Option<&Path>) -> Result<FileHash, HashCacheError> {
        let rel = paths::strip_root(&self.cell_root, path).unwrap_or_else(|| path.to_path_buf());
        let mut key = paths::to_wire(&rel);
        if let Some(member) = member {
            key = format!("{key}!{}", paths::to_wire(member));
        }
        self.by_path
            .get(&key)
            .copied()
            .ok_or_else(|| HashCacheError::MissingRemoteEntry {
                path: path.to_path_buf(),
            })
    }
}

impl FileHashLoader for RemoteReplayCache {
    fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError> {
        self.lookup(path, None)
    }

    fn hash_archive_member(
        &self,
        archive: &Path,
        member: &Path,
    ) -> Result<FileHash, HashCacheError> {
        self.lookup(archive, Some(member))
    }
}

// ── Tagged dispatch ──────────────────────────────────────────────────────

/// The three cache shapes a build can run with.
pub enum CellHashCache {
    Recording(RecordingHashCache),
    PassThrough(Arc<dyn FileHashLoader>),
    RemoteReplay(RemoteReplayCache),
}

impl CellHashCache {
    pub fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError> {
        match self {
            Self::Recording(cache) => cache.hash_file(path),
            Self::PassThrough(cache) => cache.hash_file(path),
            Self::RemoteReplay(cache) => cache.hash_file(path),
        }
    }

    pub fn hash_archive_member(
        &self,
        archive: &Path,
        member: &Path,
    ) -> Result<FileHash, HashCacheError> {
        match self {
            Self::Recording(cache) => cache.hash_archive_member(archive, member),
            Self::PassThrough(cache) => cache.hash_archive_member(archive, member),
            Self::RemoteReplay(cache) => cache.hash_archive_member(archive, member),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::KnownCell;
    use std::collections::BTreeMap;

    struct FixedLoader(FileHash);

    impl FileHashLoader for FixedLoader {
        fn hash_file(&self, _path: &Path) -> Result<FileHash, HashCacheError> {
            Ok(self.0)
        }

        fn hash_archive_member(
            &self,
            _archive: &Path,
            _member: &Path,
        ) -> Result<FileHash, HashCacheError> {
            Ok(self.0)
        }
    }

    fn cells() -> Arc<CellIndexer> {
        Arc::new(CellIndexer::new(
            KnownCell {
                root: PathBuf::from("/repo"),
                name: String::new(),
                config_overrides: BTreeMap::new(),
            },
            vec![KnownCell {
                root: PathBuf::from("/aux"),
                name: "aux".to_string(),
                config_overrides: BTreeMap::new(),
            }],
        ))
    }

    fn recording() -> RecordingHashCache {
        let recorder = Arc::new(FileHashRecorder::new(cells()));
        RecordingHashCache::new(
            Arc::new(FixedLoader(FileHash::from_bytes([0xaa; 32]))),
            recorder,
        )
    }

    #[test]
    fn test_recording_is_a_faithful_pass_through() {
        let cache = recording();
        let hash = cache.hash_file(Path::new("/repo/src/a.c")).unwrap();
        assert_eq!(hash, FileHash::from_bytes([0xaa; 32]));
    }

    #[test]
    fn test_repeated_lookups_record_once() {
        let cache = recording();
        for _ in 0..4 {
            cache.hash_file(Path::new("/repo/src/a.c")).unwrap();
        }
        let tables = cache.recorder().snapshot();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].entries.len(), 1);
        assert_eq!(tables[0].entries[0].path, "src/a.c");
    }

    #[test]
    fn test_entries_are_split_per_cell() {
        let cache = recording();
        cache.hash_file(Path::new("/repo/src/a.c")).unwrap();
        cache.hash_file(Path::new("/aux/b.c")).unwrap();
        let tables = cache.recorder().snapshot();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].cell_index, 0);
        assert_eq!(tables[1].cell_index, 1);
        assert_eq!(tables[1].entries[0].path, "b.c");
    }

    #[test]
    fn test_outside_cell_paths_are_flagged_absolute() {
        let cache = recording();
        cache.hash_file(Path::new("/usr/include/stdio.h")).unwrap();
        let tables = cache.recorder().snapshot();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].cell_index, 0);
        let entry = &tables[0].entries[0];
        assert!(entry.path_is_absolute);
        assert_eq!(entry.path, "/usr/include/stdio.h");
    }

    #[test]
    fn test_archive_members_record_member_path() {
        let cache = recording();
        cache
            .hash_archive_member(Path::new("/repo/libs/core.ar"), Path::new("obj/a.o"))
            .unwrap();
        // Same archive, same member: deduped.
        cache
            .hash_archive_member(Path::new("/repo/libs/core.ar"), Path::new("obj/a.o"))
            .unwrap();
        // Same archive, different member: its own entry.
        cache
            .hash_archive_member(Path::new("/repo/libs/core.ar"), Path::new("obj/b.o"))
            .unwrap();
        let tables = cache.recorder().snapshot();
        assert_eq!(tables[0].entries.len(), 2);
        assert_eq!(
            tables[0].entries[0].archive_member_path.as_deref(),
            Some("obj/a.o")
        );
    }

    #[test]
    fn test_disk_cache_hashes_real_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"hello").unwrap();

        let cache = DiskHashCache::new();
        let first = cache.hash_file(&file).unwrap();
        let second = cache.hash_file(&file).unwrap();
        assert_eq!(first, second);

        use sha2::{Digest, Sha256};
        let expected: [u8; 32] = Sha256::digest(b"hello").into();
        assert_eq!(first, FileHash::from_bytes(expected));
    }

    #[test]
    fn test_disk_cache_missing_file_is_io_error() {
        let cache = DiskHashCache::new();
        assert!(matches!(
            cache.hash_file(Path::new("/definitely/not/here")),
            Err(HashCacheError::Io { .. })
        ));
    }

    #[test]
    fn test_remote_replay_round_trip() {
        let cache = recording();
        cache.hash_file(Path::new("/repo/src/a.c")).unwrap();
        let tables = cache.recorder().snapshot();

        let replay = RemoteReplayCache::new(PathBuf::from("/work/repo"), &tables[0]);
        let hash = replay.hash_file(Path::new("/work/repo/src/a.c")).unwrap();
        assert_eq!(hash, FileHash::from_bytes([0xaa; 32]));
    }

    #[test]
    fn test_remote_replay_miss_is_an_error() {
        let replay = RemoteReplayCache::new(
            PathBuf::from("/work/repo"),
            &CellFileHashes {
                cell_index: 0,
                entries: vec![],
            },
        );
        assert!(matches!(
            replay.hash_file(Path::new("/work/repo/src/a.c")),
            Err(HashCacheError::MissingRemoteEntry { .. })
        ));
    }

    #[test]
    fn test_tagged_dispatch_matches_variant() {
        let pass = CellHashCache::PassThrough(Arc::new(FixedLoader(FileHash::from_bytes(
            [0x11; 32],
        ))));
        assert_eq!(
            pass.hash_file(Path::new("/anything")).unwrap(),
            FileHash::from_bytes([0x11; 32])
        );
    }
}
