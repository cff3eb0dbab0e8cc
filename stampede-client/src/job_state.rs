//! Job descriptor assembly.
//!
//! Freezes the cell table, the recorded file hashes, the raw target
//! graph and the top-level target set into one portable [`JobState`].
//! Rule-key computation must have completed before assembly so the hash
//! tables are complete.

use crate::cells::CellIndexer;
use crate::hash_cache::FileHashRecorder;
use stampede_common::graph::TargetGraph;
use stampede_common::paths;
use stampede_common::protocol::{ClientVersion, JobState, JOB_STATE_SCHEMA_VERSION};
use stampede_common::types::{BuildTarget, CellIndex};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("top-level target {target} is not in the target graph")]
    TargetNotInGraph { target: String },
    #[error("file hash table references unknown cell index {index}")]
    UnknownCellIndex { index: u32 },
    #[error("failed to write job state to {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode job state: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Assemble the frozen job descriptor. The graph is the *unversioned*
/// one: the coordinator performs its own version resolution.
pub fn assemble(
    cells: &CellIndexer,
    recorder: &FileHashRecorder,
    target_graph: &TargetGraph,
    top_level_targets: &BTreeSet<BuildTarget>,
    client_version: ClientVersion,
) -> Result<JobState, JobStateError> {
    for target in top_level_targets {
        if !target_graph.contains(target) {
            return Err(JobStateError::TargetNotInGraph {
                target: target.to_string(),
            });
        }
    }

    let cell_table: Vec<_> = cells.enumerate().iter().map(|c| c.to_wire()).collect();
    let file_hashes = recorder.snapshot();
    for table in &file_hashes {
        if !cell_table.iter().any(|c| c.index == table.cell_index) {
            return Err(JobStateError::UnknownCellIndex {
                index: table.cell_index,
            });
        }
    }

    let target_graph_nodes = target_graph
        .nodes()
        .map(|node| {
            serde_json::json!({
                "target": node.target.as_str(),
                "cell_root": paths::to_wire(&node.cell_root),
                "deps": node.deps.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
                "attributes": node.raw_attributes,
            })
        })
        .collect();

    Ok(JobState {
        schema_version: JOB_STATE_SCHEMA_VERSION,
        cells: cell_table,
        target_graph_nodes,
        top_level_targets: top_level_targets.iter().map(|t| t.to_string()).collect(),
        file_hashes,
        client_version,
    })
}

/// Inline the bytes of every recorded file into its entry (hex-encoded),
/// for `--build-state-file` dumps. Files that vanished since recording
/// are skipped, matching the best-effort nature of the dump.
pub fn inline_file_contents(state: &mut JobState, cells: &CellIndexer) -> Result<(), JobStateError> {
    for table in &mut state.file_hashes {
        let cell_root = cells
            .root_of(CellIndex(table.cell_index))
            .map_err(|_| JobStateError::UnknownCellIndex {
                index: table.cell_index,
            })?;
        for entry in &mut table.entries {
            let path = if entry.path_is_absolute {
                paths::from_wire(&entry.path)
            } else {
                cell_root.join(paths::from_wire(&entry.path))
            };
            if let Ok(bytes) = std::fs::read(&path) {
                entry.contents = Some(hex_encode(&bytes));
            }
        }
    }
    Ok(())
}

/// Serialize the descriptor to a file, creating parent directories.
pub fn write_to_file(state: &JobState, path: &Path) -> Result<(), JobStateError> {
    let io = |source| JobStateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
    }
    let bytes = state.to_json_bytes()?;
    std::fs::write(path, bytes).map_err(io)
}

fn hex_encode(bytes: &[u8]) -> String {
    const ALPHABET: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(ALPHABET[(b >> 4) as usize] as char);
        out.push(ALPHABET[(b & 0x0f) as usize] as char);
    }
    out
}
