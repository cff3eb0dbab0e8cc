//! Cell indexing.
//!
//! A build may span several independently-rooted source trees. Each
//! root ("cell") gets a stable small integer the first time rule
//! traversal touches it; the wire format refers to cells only by index.

use stampede_common::paths;
use stampede_common::protocol::JobStateCell;
use stampede_common::types::CellIndex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CellError {
    #[error("path {} is not inside any known cell root", .path.display())]
    OutsideCells { path: PathBuf },
    #[error("unknown cell index {0}")]
    UnknownIndex(CellIndex),
}

/// Metadata for one indexed cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellInfo {
    pub index: CellIndex,
    pub root: PathBuf,
    pub name: String,
    pub config_overrides: BTreeMap<String, String>,
}

impl CellInfo {
    pub fn to_wire(&self) -> JobStateCell {
        JobStateCell {
            index: self.index.as_u32(),
            root: paths::to_wire(&self.root),
            name: self.name.clone(),
            config_overrides: self.config_overrides.clone(),
        }
    }
}

/// A not-yet-indexed cell root the indexer knows how to resolve.
#[derive(Debug, Clone)]
pub struct KnownCell {
    pub root: PathBuf,
    pub name: String,
    pub config_overrides: BTreeMap<String, String>,
}

struct Inner {
    /// Index assignment in first-seen order; the root cell is seeded at 0.
    assigned: Vec<CellInfo>,
    by_root: BTreeMap<PathBuf, CellIndex>,
}

/// Assigns stable indices to cell roots and resolves paths back to them.
///
/// A single monotonic counter guarded by one lock; indices are immutable
/// once assigned.
pub struct CellIndexer {
    known: Vec<KnownCell>,
    inner: Mutex<Inner>,
}

impl CellIndexer {
    /// `root_cell` receives index 0 immediately; `other_cells` are
    /// indexed lazily in the order rule traversal first touches them.
    pub fn new(root_cell: KnownCell, other_cells: Vec<KnownCell>) -> Self {
        let root_info = CellInfo {
            index: CellIndex::ROOT,
            root: root_cell.root.clone(),
            name: root_cell.name.clone(),
            config_overrides: root_cell.config_overrides.clone(),
        };
        let mut by_root = BTreeMap::new();
        by_root.insert(root_info.root.clone(), CellIndex::ROOT);

        let mut known = other_cells;
        known.insert(0, root_cell);

        Self {
            known,
            inner: Mutex::new(Inner {
                assigned: vec![root_info],
                by_root,
            }),
        }
    }

    /// Index of the cell rooted at `cell_root`, assigning the next index
    /// on first sight. Idempotent.
    pub fn index_of(&self, cell_root: &Path) -> Result<CellIndex, CellError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = inner.by_root.get(cell_root) {
            return Ok(*index);
        }
        let known = self
            .known
            .iter()
            .find(|c| c.root == cell_root)
            .ok_or_else(|| CellError::OutsideCells {
                path: cell_root.to_path_buf(),
            })?;
        let index = CellIndex(inner.assigned.len() as u32);
        let info = CellInfo {
            index,
            root: known.root.clone(),
            name: known.name.clone(),
            config_overrides: known.config_overrides.clone(),
        };
        inner.by_root.insert(info.root.clone(), index);
        inner.assigned.push(info);
        Ok(index)
    }

    /// Resolve an absolute file path to its owning cell and the
    /// cell-relative remainder. Longest matching root wins.
    pub fn cell_for_path(&self, path: &Path) -> Result<(CellIndex, PathBuf), CellError> {
        let best = self
            .known
            .iter()
            .filter_map(|cell| {
                paths::strip_root(&cell.root, path).map(|rel| (cell.root.clone(), rel))
            })
            .max_by_key(|(root, _)| root.components().count());
        match best {
            Some((root, rel)) => Ok((self.index_of(&root)?, rel)),
            None => Err(CellError::OutsideCells {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Root path of an already-assigned cell.
    pub fn root_of(&self, index: CellIndex) -> Result<PathBuf, CellError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .assigned
            .get(index.as_u32() as usize)
            .map(|c| c.root.clone())
            .ok_or(CellError::UnknownIndex(index))
    }

    /// All assigned cells in index order.
    pub fn enumerate(&self) -> Vec<CellInfo> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.assigned.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(root: &str, name: &str) -> KnownCell {
        KnownCell {
            root: PathBuf::from(root),
            name: name.to_string(),
            config_overrides: BTreeMap::new(),
        }
    }

    fn indexer() -> CellIndexer {
        CellIndexer::new(
            known("/repo", ""),
            vec![known("/repo/vendor/sdk", "sdk"), known("/aux", "aux")],
        )
    }

    #[test]
    fn test_root_cell_is_index_zero() {
        let cells = indexer();
        assert_eq!(cells.index_of(Path::new("/repo")).unwrap(), CellIndex::ROOT);
        assert_eq!(cells.enumerate().len(), 1);
    }

    #[test]
    fn test_indices_are_assigned_in_first_seen_order() {
        let cells = indexer();
        let aux = cells.index_of(Path::new("/aux")).unwrap();
        let sdk = cells.index_of(Path::new("/repo/vendor/sdk")).unwrap();
        assert_eq!(aux, CellIndex(1));
        assert_eq!(sdk, CellIndex(2));
    }

    #[test]
    fn test_index_of_is_idempotent() {
        let cells = indexer();
        let first = cells.index_of(Path::new("/aux")).unwrap();
        for _ in 0..5 {
            assert_eq!(cells.index_of(Path::new("/aux")).unwrap(), first);
        }
        assert_eq!(cells.enumerate().len(), 2);
    }

    #[test]
    fn test_unknown_root_is_an_error() {
        let cells = indexer();
        assert!(matches!(
            cells.index_of(Path::new("/elsewhere")),
            Err(CellError::OutsideCells { .. })
        ));
    }

    #[test]
    fn test_cell_for_path_prefers_longest_root() {
        let cells = indexer();
        let (index, rel) = cells
            .cell_for_path(Path::new("/repo/vendor/sdk/include/api.h"))
            .unwrap();
        assert_eq!(cells.root_of(index).unwrap(), PathBuf::from("/repo/vendor/sdk"));
        assert_eq!(rel, PathBuf::from("include/api.h"));
    }

    #[test]
    fn test_cell_for_path_outside_all_roots() {
        let cells = indexer();
        assert!(matches!(
            cells.cell_for_path(Path::new("/usr/lib/libc.so")),
            Err(CellError::OutsideCells { .. })
        ));
    }

    #[test]
    fn test_enumerate_sorted_by_index() {
        let cells = indexer();
        cells.index_of(Path::new("/aux")).unwrap();
        cells.index_of(Path::new("/repo/vendor/sdk")).unwrap();
        let infos = cells.enumerate();
        let indices: Vec<u32> = infos.iter().map(|c| c.index.as_u32()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
