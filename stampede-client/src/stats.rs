//! Client-side build statistics.
//!
//! Wall-clock timers for each coordinator phase plus the outcome fields
//! the stats pipeline consumes. Timers nest strictly: `generate` refuses
//! to emit while any started phase is missing its stop.

use serde::Serialize;
use stampede_common::types::StampedeId;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Timed phases of a distributed build invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildPhase {
    LocalPreparation,
    LocalGraphConstruction,
    PerformLocalBuild,
    PostBuildAnalysis,
    PostDistributedBuildLocalSteps,
}

impl std::fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::LocalPreparation => "LOCAL_PREPARATION",
            Self::LocalGraphConstruction => "LOCAL_GRAPH_CONSTRUCTION",
            Self::PerformLocalBuild => "PERFORM_LOCAL_BUILD",
            Self::PostBuildAnalysis => "POST_BUILD_ANALYSIS",
            Self::PostDistributedBuildLocalSteps => "POST_DISTRIBUTED_BUILD_LOCAL_STEPS",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatsError {
    #[error("phase {0} was started but never stopped")]
    PhaseStillRunning(BuildPhase),
    #[error("phase {0} was stopped but never started")]
    PhaseNeverStarted(BuildPhase),
}

#[derive(Debug, Clone, Copy)]
enum TimerSlot {
    Running(Instant),
    Finished(Duration),
    /// `stop` without a matching `start`; surfaced at generate time.
    Orphaned,
}

#[derive(Default)]
struct StatsInner {
    timers: BTreeMap<BuildPhase, TimerSlot>,
    stampede_id: Option<StampedeId>,
    distributed_exit_code: Option<i32>,
    local_exit_code: Option<i32>,
    fallback_enabled: bool,
    performed_local_build: bool,
    client_error: bool,
    error_message: Option<String>,
}

/// Emitted snapshot of one invocation's client stats.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ClientStats {
    pub build_label: String,
    pub stampede_id: Option<String>,
    pub phase_durations_ms: BTreeMap<String, u64>,
    pub distributed_exit_code: Option<i32>,
    pub local_exit_code: Option<i32>,
    pub is_fallback_enabled: bool,
    pub performed_local_build: bool,
    pub client_error: bool,
    pub error_message: Option<String>,
}

/// Tracks stats for the lifetime of one invocation.
pub struct ClientStatsTracker {
    build_label: String,
    inner: Mutex<StatsInner>,
}

impl ClientStatsTracker {
    pub fn new(build_label: impl Into<String>) -> Self {
        Self {
            build_label: build_label.into(),
            inner: Mutex::new(StatsInner::default()),
        }
    }

    pub fn start_timer(&self, phase: BuildPhase) {
        let mut inner = self.lock();
        // A duplicate start restarts the phase; the old measurement is
        // meaningless once the phase re-enters.
        inner.timers.insert(phase, TimerSlot::Running(Instant::now()));
    }

    pub fn stop_timer(&self, phase: BuildPhase) {
        let mut inner = self.lock();
        let slot = match inner.timers.get(&phase) {
            Some(TimerSlot::Running(started)) => TimerSlot::Finished(started.elapsed()),
            Some(finished @ TimerSlot::Finished(_)) => *finished,
            Some(TimerSlot::Orphaned) | None => TimerSlot::Orphaned,
        };
        inner.timers.insert(phase, slot);
    }

    pub fn set_stampede_id(&self, id: StampedeId) {
        self.lock().stampede_id = Some(id);
    }

    pub fn has_stampede_id(&self) -> bool {
        self.lock().stampede_id.is_some()
    }

    pub fn set_distributed_exit_code(&self, code: i32) {
        self.lock().distributed_exit_code = Some(code);
    }

    pub fn set_local_exit_code(&self, code: i32) {
        self.lock().local_exit_code = Some(code);
    }

    pub fn set_fallback_enabled(&self, enabled: bool) {
        self.lock().fallback_enabled = enabled;
    }

    pub fn set_performed_local_build(&self, performed: bool) {
        self.lock().performed_local_build = performed;
    }

    pub fn set_client_error(&self, message: impl Into<String>) {
        let mut inner = self.lock();
        inner.client_error = true;
        inner.error_message = Some(message.into());
    }

    /// Produce the stats snapshot. Fails when timer pairs are unbalanced
    /// so broken instrumentation is caught instead of shipped.
    pub fn generate(&self) -> Result<ClientStats, StatsError> {
        let inner = self.lock();
        let mut phase_durations_ms = BTreeMap::new();
        for (phase, slot) in &inner.timers {
            match slot {
                TimerSlot::Running(_) => return Err(StatsError::PhaseStillRunning(*phase)),
                TimerSlot::Orphaned => return Err(StatsError::PhaseNeverStarted(*phase)),
                TimerSlot::Finished(duration) => {
                    phase_durations_ms.insert(phase.to_string(), duration.as_millis() as u64);
                }
            }
        }
        Ok(ClientStats {
            build_label: self.build_label.clone(),
            stampede_id: inner.stampede_id.as_ref().map(|id| id.as_str().to_string()),
            phase_durations_ms,
            distributed_exit_code: inner.distributed_exit_code,
            local_exit_code: inner.local_exit_code,
            is_fallback_enabled: inner.fallback_enabled,
            performed_local_build: inner.performed_local_build,
            client_error: inner.client_error,
            error_message: inner.error_message.clone(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
