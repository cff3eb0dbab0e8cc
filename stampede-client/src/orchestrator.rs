//! Hybrid build orchestration.
//!
//! Runs the local and remote builds concurrently, applies the fallback
//! policy, and reduces the two exit codes to one:
//!
//! | remote | local | fallback | final |
//! |--------|-------|----------|-------|
//! | 0      | 0     | —        | 0     |
//! | 0      | ≠0    | —        | local |
//! | ≠0     | —     | off      | remote|
//! | ≠0     | x     | on       | x     |
//!
//! The orchestrator exclusively owns the synchronizer and both sub-build
//! handles; cancellation flows from here and nowhere else.

use crate::analysis::PostBuildAnalysis;
use crate::cells::CellIndexer;
use crate::controller::{ControllerOptions, ExecutionResult, RemoteBuildController};
use crate::events::EventBus;
use crate::job_state::{self, JobStateError};
use crate::local::{
    BuildHandle, CacheMissCollector, InitializationLatch, LocalBuildExecutor, LocalBuildOptions,
};
use crate::logs::LogMaterializer;
use crate::service::CoordinatorService;
use crate::stats::{BuildPhase, ClientStatsTracker};
use crate::sync::{RemoteBuildSynchronizer, RemoteRuleCompletionWaiter};
use stampede_common::config::DistConfig;
use stampede_common::errors::DIST_LOCAL_STEP_FAILED_EXIT_CODE;
use stampede_common::graph::{ActionGraph, TargetGraphAndTargets};
use stampede_common::protocol::JobState;
use stampede_common::types::{BuildTarget, RuleKey};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("build was cancelled")]
    Cancelled,
    #[error("local build task failed to join: {0}")]
    LocalJoin(String),
    #[error(transparent)]
    JobState(#[from] JobStateError),
}

/// The graphs one invocation works with. Distributed builds always ship
/// the unversioned graph; the local build prefers the versioned one when
/// version resolution ran.
pub struct BuildGraphs {
    pub unversioned: TargetGraphAndTargets,
    pub versioned: Option<TargetGraphAndTargets>,
    pub action_graph: ActionGraph,
}

impl BuildGraphs {
    pub fn for_local_build(&self) -> &TargetGraphAndTargets {
        self.versioned.as_ref().unwrap_or(&self.unversioned)
    }
}

/// External cancel trigger (signal handler, parent process).
pub struct CancelSignal {
    tx: watch::Sender<bool>,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Everything `execute` needs for one distributed invocation.
pub struct DistBuildParams {
    pub graphs: Arc<BuildGraphs>,
    pub job: JobState,
    pub cells: Arc<CellIndexer>,
    pub rule_keys: BTreeMap<BuildTarget, RuleKey>,
    /// Top-level targets the local build drives.
    pub targets: Vec<BuildTarget>,
    pub local_options: LocalBuildOptions,
    /// `--build-state-file`: dump the inlined job state and stop.
    pub state_dump_path: Option<PathBuf>,
    pub invocation_id: String,
}

pub struct HybridBuildOrchestrator {
    service: Arc<dyn CoordinatorService>,
    executor: Arc<dyn LocalBuildExecutor>,
    events: EventBus,
    config: DistConfig,
    log_dir: PathBuf,
    cancel: Arc<CancelSignal>,
}

impl HybridBuildOrchestrator {
    pub fn new(
        service: Arc<dyn CoordinatorService>,
        executor: Arc<dyn LocalBuildExecutor>,
        events: EventBus,
        config: DistConfig,
        log_dir: PathBuf,
    ) -> Self {
        Self {
            service,
            executor,
            events,
            config,
            log_dir,
            cancel: Arc::new(CancelSignal::new()),
        }
    }

    /// Handle for wiring signal handlers to this invocation.
    pub fn cancel_signal(&self) -> Arc<CancelSignal> {
        Arc::clone(&self.cancel)
    }

    /// Run the distributed invocation to a single exit code.
    pub async fn execute(
        &self,
        params: DistBuildParams,
        stats: Arc<ClientStatsTracker>,
    ) -> Result<i32, OrchestratorError> {
        let DistBuildParams {
            graphs,
            mut job,
            cells,
            rule_keys,
            targets,
            mut local_options,
            state_dump_path,
            invocation_id,
        } = params;

        // `--build-state-file`: inline every recorded file's bytes and
        // dump; no coordinator contact at all.
        if let Some(dump_path) = state_dump_path {
            job_state::inline_file_contents(&mut job, &cells)?;
            job_state::write_to_file(&job, &dump_path)?;
            info!("wrote distributed build state to {}", dump_path.display());
            return Ok(0);
        }

        let fallback_enabled = self.config.enable_slow_local_build_fallback;
        local_options.build_cacheable_locally_when_not_built = fallback_enabled;
        let cache_misses = local_options
            .cache_misses
            .get_or_insert_with(|| Arc::new(CacheMissCollector::default()))
            .clone();

        let synchronizer = Arc::new(RemoteBuildSynchronizer::new());
        let handle = Arc::new(BuildHandle::new());
        let initialized = Arc::new(InitializationLatch::new());

        stats.stop_timer(BuildPhase::LocalPreparation);

        // Local build task: blocks on cacheable artifacts until the
        // remote makes them available, builds the rest natively.
        let local_task = {
            let executor = Arc::clone(&self.executor);
            let graphs = Arc::clone(&graphs);
            let handle = Arc::clone(&handle);
            let initialized = Arc::clone(&initialized);
            let waiter: Arc<dyn RemoteRuleCompletionWaiter> = synchronizer.clone();
            let stats = Arc::clone(&stats);
            let options = local_options.clone();
            let targets = targets.clone();
            tokio::spawn(async move {
                stats.start_timer(BuildPhase::PerformLocalBuild);
                // The build handle is live: early termination may now
                // reach this task.
                initialized.signal();
                let code = match executor
                    .build(&graphs.action_graph, &targets, handle, waiter, &options)
                    .await
                {
                    Ok(code) => {
                        info!("distributed build local client has finished building");
                        stats.set_performed_local_build(true);
                        code
                    }
                    Err(err) => {
                        error!("local build failed: {err}");
                        DIST_LOCAL_STEP_FAILED_EXIT_CODE
                    }
                };
                stats.stop_timer(BuildPhase::PerformLocalBuild);
                stats.set_local_exit_code(code);
                code
            })
        };

        let controller = RemoteBuildController::new(
            Arc::clone(&self.service),
            Arc::clone(&synchronizer),
            LogMaterializer::new(
                Arc::clone(&self.service),
                self.log_dir.clone(),
                Duration::from_millis(self.config.max_wait_for_remote_logs_ms),
            ),
            self.events.clone(),
            Arc::clone(&stats),
            ControllerOptions::from_config(&self.config),
        );

        let mut cancel_rx = self.cancel.subscribe();
        let remote_result = tokio::select! {
            result = controller.execute(
                &job,
                self.config.build_mode,
                self.config.number_of_minions,
                &self.config.repository,
                &self.config.tenant_id,
            ) => result,
            () = wait_cancelled(&mut cancel_rx) => {
                warn!("cancellation requested, aborting both sub-builds");
                synchronizer.cancel();
                handle.terminate_build_with_failure("build was cancelled");
                let _ = local_task.await;
                return Err(OrchestratorError::Cancelled);
            }
        };

        stats.set_fallback_enabled(fallback_enabled);
        stats.set_distributed_exit_code(remote_result.exit_code);
        stats.start_timer(BuildPhase::PostDistributedBuildLocalSteps);

        if remote_result.exit_code != 0 && !fallback_enabled {
            let stampede_id = remote_result
                .stampede_id
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            self.events.console_error(format!(
                "The remote build with stampede id [{stampede_id}] failed with exit \
                 code [{}]. Terminating the local build.",
                remote_result.exit_code
            ));
            // Make sure the build handle exists on the local side, then
            // stop it as soon as its current rules finish.
            initialized.wait().await;
            handle.terminate_build_with_failure(
                "distributed build finished with non-zero exit code, terminating local build",
            );
        }

        let local_exit_code = local_task
            .await
            .map_err(|e| OrchestratorError::LocalJoin(e.to_string()))?;

        let mut exit_code = remote_result.exit_code;
        if fallback_enabled || remote_result.exit_code == 0 {
            if remote_result.exit_code != 0 {
                self.print_fallback_banner(&remote_result, &targets);
            }

            // Cache-visibility details for any artifacts that missed.
            controller
                .publish_cache_miss_details(&cache_misses.keys())
                .await;

            // Always after the local join, so the summary cannot race
            // late rule completions.
            stats.start_timer(BuildPhase::PostBuildAnalysis);
            let analysis = PostBuildAnalysis::new(
                invocation_id,
                remote_result.stampede_id.clone(),
                self.log_dir.clone(),
                controller.materialized_log_run_ids(),
                "build",
            );
            let summary = analysis.run(&rule_keys);
            match analysis.dump_to_log_file(&summary) {
                Ok(path) => self.events.console_warning(format!(
                    "Details of distributed build analysis: {}",
                    path.display()
                )),
                Err(err) => warn!("failed to write post-build analysis: {err}"),
            }
            stats.stop_timer(BuildPhase::PostBuildAnalysis);

            exit_code = local_exit_code;
        }

        stats.stop_timer(BuildPhase::PostDistributedBuildLocalSteps);
        Ok(exit_code)
    }

    fn print_fallback_banner(&self, remote: &ExecutionResult, targets: &[BuildTarget]) {
        let stampede_id = remote
            .stampede_id
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let target_list = targets
            .iter()
            .map(BuildTarget::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let message = format!(
            "The remote build with stampede id [{stampede_id}] failed with exit code \
             [{}] trying to build targets [{target_list}]. This program will continue \
             by falling back to a local build because config \
             [stampede.enable_slow_local_build_fallback=true].",
            remote.exit_code
        );
        error!("{message}");
        self.events.console_error(message);
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender lives in the orchestrator; if it is gone the build
            // is over anyway. Park forever rather than spuriously cancel.
            std::future::pending::<()>().await;
        }
    }
}
