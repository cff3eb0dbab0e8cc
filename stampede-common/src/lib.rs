//! Common types used across stampede components.
//!
//! This crate holds everything both the coordinator client and the CLI
//! need to agree on: target and cell identifiers, the action/target graph
//! model, the `JobState` wire schema, configuration, and the error/exit
//! code catalog.

#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod graph;
pub mod paths;
pub mod protocol;
pub mod types;
pub mod version;

pub use config::{DistConfig, GeneralConfig, StampedeConfig};
pub use errors::{BuildClientError, ExitCode};
pub use graph::{ActionGraph, BuildRule, TargetGraph, TargetNode};
pub use protocol::{ClientVersion, FileHashEntry, JobState};
pub use types::{BuildTarget, CellIndex, FileHash, RuleKey, StampedeId};
