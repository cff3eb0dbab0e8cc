//! Wire schema shared with the remote coordinator.
//!
//! The job descriptor (`JobState`) and the coordinator request/response
//! messages are plain JSON structures. The schema is stable across
//! client/coordinator versions: fields are only ever added, under
//! `#[serde(default)]`, and `schema_version` gates incompatible changes.
//!
//! All paths in this module use forward-slash separators regardless of
//! the client platform.

use crate::types::{DistBuildMode, FileHash, RuleKey, StampedeId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const JOB_STATE_SCHEMA_VERSION: u32 = 2;

/// Portable descriptor of one build invocation: everything the
/// coordinator needs to reproduce the action graph remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobState {
    pub schema_version: u32,
    pub cells: Vec<JobStateCell>,
    /// Raw pre-versioning target-graph nodes; the coordinator performs
    /// its own version resolution.
    pub target_graph_nodes: Vec<serde_json::Value>,
    pub top_level_targets: Vec<String>,
    pub file_hashes: Vec<CellFileHashes>,
    pub client_version: ClientVersion,
}

impl JobState {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// One row of the cell table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStateCell {
    pub index: u32,
    /// Cell root, forward-slash separated.
    pub root: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_overrides: BTreeMap<String, String>,
}

/// File-hash table for a single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellFileHashes {
    pub cell_index: u32,
    pub entries: Vec<FileHashEntry>,
}

/// One recorded hash-cache lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileHashEntry {
    /// Cell-relative path, or the absolute path when
    /// `path_is_absolute` is set.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_member_path: Option<String>,
    pub hash: FileHash,
    pub mtime_class: MtimeClass,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub is_root_symlink: bool,
    #[serde(default)]
    pub path_is_absolute: bool,
    /// Hex-encoded file bytes, inlined only for state dumps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
}

/// Stability class of a file's mtime at scan time. `Volatile` entries
/// were modified close enough to the scan that a concurrent writer may
/// still be racing; the coordinator re-validates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtimeClass {
    Stable,
    Volatile,
}

/// Version tag identifying the client binary the coordinator must run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ClientVersion {
    /// Built from a known git commit.
    Git(String),
    /// Content hash of a local binary uploaded out of band.
    Binary(String),
}

impl ClientVersion {
    pub fn payload(&self) -> &str {
        match self {
            Self::Git(p) | Self::Binary(p) => p,
        }
    }
}

// ── Coordinator operations ───────────────────────────────────────────────

/// Remote build lifecycle as reported by `fetch_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteBuildState {
    Queued,
    Building,
    FinishedOk,
    FinishedFailed,
}

impl RemoteBuildState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::FinishedOk | Self::FinishedFailed)
    }
}

/// A rule the coordinator finished since the build started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleFinished {
    pub rule_key: RuleKey,
    pub success: bool,
}

/// Snapshot of remote progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStatus {
    pub stampede_id: StampedeId,
    pub state: RemoteBuildState,
    /// Cumulative: every rule finished so far, not a delta.
    pub finished_rules: Vec<RuleFinished>,
    /// Build-slave log streams that have data available.
    pub log_run_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// One materialized build-slave log stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLogBatch {
    pub run_id: String,
    pub files: Vec<RemoteLogFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLogFile {
    pub name: String,
    pub contents: String,
}

/// Cache-visibility record for one rule key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleKeyLogEntry {
    pub rule_key: RuleKey,
    pub was_stored: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stored_by: Option<String>,
}

/// Request envelope for the newline-delimited JSON transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    StartBuild {
        job: Box<JobState>,
        mode: DistBuildMode,
        minions: u32,
        repository: String,
        tenant: String,
    },
    FetchStatus {
        stampede_id: StampedeId,
    },
    FetchLogs {
        run_ids: Vec<String>,
    },
    FetchRuleKeyLogs {
        rule_keys: Vec<RuleKey>,
    },
}

/// Response envelope for the newline-delimited JSON transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CoordinatorResponse {
    Started { stampede_id: StampedeId },
    Status { status: BuildStatus },
    Logs { batches: Vec<RemoteLogBatch> },
    RuleKeyLogs { entries: Vec<RuleKeyLogEntry> },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileHash;

    fn sample_state() -> JobState {
        JobState {
            schema_version: JOB_STATE_SCHEMA_VERSION,
            cells: vec![JobStateCell {
                index: 0,
                root: "/repo".to_string(),
                name: String::new(),
                config_overrides: BTreeMap::new(),
            }],
            target_graph_nodes: vec![serde_json::json!({
                "target": "//app:bin",
                "deps": ["//lib:core"],
            })],
            top_level_targets: vec!["//app:bin".to_string()],
            file_hashes: vec![CellFileHashes {
                cell_index: 0,
                entries: vec![FileHashEntry {
                    path: "app/main.c".to_string(),
                    archive_member_path: None,
                    hash: FileHash::from_bytes([0xaa; 32]),
                    mtime_class: MtimeClass::Stable,
                    is_directory: false,
                    is_root_symlink: false,
                    path_is_absolute: false,
                    contents: None,
                }],
            }],
            client_version: ClientVersion::Git("deadbeef".to_string()),
        }
    }

    #[test]
    fn test_job_state_round_trip_is_structural_identity() {
        let state = sample_state();
        let bytes = state.to_json_bytes().unwrap();
        let back = JobState::from_json_slice(&bytes).unwrap();
        assert_eq!(state, back);
    }

    #[test]
    fn test_client_version_wire_shape() {
        let v = ClientVersion::Git("abc123".to_string());
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["kind"], "git");
        assert_eq!(json["payload"], "abc123");

        let b = ClientVersion::Binary("ff00".to_string());
        let json = serde_json::to_value(&b).unwrap();
        assert_eq!(json["kind"], "binary");
    }

    #[test]
    fn test_file_hash_entry_optional_fields_are_omitted() {
        let entry = &sample_state().file_hashes[0].entries[0];
        let json = serde_json::to_value(entry).unwrap();
        assert!(json.get("contents").is_none());
        assert!(json.get("archive_member_path").is_none());
    }

    #[test]
    fn test_remote_build_state_terminality() {
        assert!(!RemoteBuildState::Queued.is_terminal());
        assert!(!RemoteBuildState::Building.is_terminal());
        assert!(RemoteBuildState::FinishedOk.is_terminal());
        assert!(RemoteBuildState::FinishedFailed.is_terminal());
    }

    #[test]
    fn test_request_envelope_tags() {
        let req = CoordinatorRequest::FetchStatus {
            stampede_id: StampedeId::new("s-1"),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["op"], "fetch_status");
    }
}
