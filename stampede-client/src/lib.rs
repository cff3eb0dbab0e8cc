//! Client-side coordination of hybrid local+remote builds.
//!
//! Given an action graph, this crate fingerprints it into a portable
//! [`JobState`](stampede_common::JobState), submits it to the remote
//! coordinator, and runs a local build that blocks on each cacheable
//! artifact until the remote has produced it. The
//! [`orchestrator`] module is the entry point; everything else supports
//! it.
//!
//! Component dependency order, leaves first: [`cells`] →
//! [`hash_cache`] → [`rule_keys`] → [`job_state`] → [`sync`] →
//! [`controller`] → [`orchestrator`].

#![forbid(unsafe_code)]

pub mod analysis;
pub mod cells;
pub mod controller;
pub mod events;
pub mod hash_cache;
pub mod job_state;
pub mod local;
pub mod logs;
pub mod orchestrator;
pub mod retry;
pub mod rule_keys;
pub mod service;
pub mod stats;
pub mod sync;

pub use cells::CellIndexer;
pub use controller::RemoteBuildController;
pub use events::EventBus;
pub use orchestrator::HybridBuildOrchestrator;
pub use stats::ClientStatsTracker;
pub use sync::RemoteBuildSynchronizer;
