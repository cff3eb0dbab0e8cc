//! Remote build controller.
//!
//! Submits the job descriptor, drives the polling loop against the
//! coordinator, forwards per-rule completions into the synchronizer, and
//! materializes build-slave logs. Whatever happens, the synchronizer is
//! closed on the way out so no local waiter hangs.

use crate::events::{names, EventBus};
use crate::logs::LogMaterializer;
use crate::retry::{run_with_retry, RpcRetryPolicy};
use crate::service::{CoordinatorService, ServiceError};
use crate::stats::ClientStatsTracker;
use crate::sync::RemoteBuildSynchronizer;
use serde_json::json;
use stampede_common::config::DistConfig;
use stampede_common::errors::DIST_REMOTE_STEP_FAILED_EXIT_CODE;
use stampede_common::protocol::{BuildStatus, JobState, RemoteBuildState};
use stampede_common::types::{DistBuildMode, RuleKey, StampedeId};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Knobs lifted from the `[stampede]` config table.
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub poll_interval: Duration,
    pub max_build_duration: Duration,
    pub log_materialization_enabled: bool,
    pub retry: RpcRetryPolicy,
}

impl ControllerOptions {
    pub fn from_config(config: &DistConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_build_duration: Duration::from_secs(config.max_build_duration_secs),
            log_materialization_enabled: config.log_materialization_enabled,
            retry: RpcRetryPolicy::from_millis(
                config.rpc_max_attempts,
                config.rpc_base_delay_ms,
                config.rpc_max_delay_ms,
            ),
        }
    }
}

/// Outcome of one remote build attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub stampede_id: Option<StampedeId>,
    pub exit_code: i32,
}

pub struct RemoteBuildController {
    service: Arc<dyn CoordinatorService>,
    synchronizer: Arc<RemoteBuildSynchronizer>,
    logs: LogMaterializer,
    events: EventBus,
    stats: Arc<ClientStatsTracker>,
    options: ControllerOptions,
}

impl RemoteBuildController {
    pub fn new(
        service: Arc<dyn CoordinatorService>,
        synchronizer: Arc<RemoteBuildSynchronizer>,
        logs: LogMaterializer,
        events: EventBus,
        stats: Arc<ClientStatsTracker>,
        options: ControllerOptions,
    ) -> Self {
        Self {
            service,
            synchronizer,
            logs,
            events,
            stats,
            options,
        }
    }

    /// Drive the remote build to a terminal state and report its exit
    /// code. Persistent RPC failure maps to the remote-step-failed code.
    pub async fn execute(
        &self,
        job: &JobState,
        mode: DistBuildMode,
        minions: u32,
        repository: &str,
        tenant: &str,
    ) -> ExecutionResult {
        self.events.emit(
            names::DIST_BUILD_STARTED,
            &json!({
                "mode": mode,
                "minions": minions,
                "repository": repository,
                "tenant": tenant,
            }),
        );

        let mut stampede_id = None;
        let exit_code = match self
            .run_remote_build(job, mode, minions, repository, tenant, &mut stampede_id)
            .await
        {
            Ok(status) => match status.state {
                RemoteBuildState::FinishedOk => 0,
                _ => status.exit_code.unwrap_or(DIST_REMOTE_STEP_FAILED_EXIT_CODE),
            },
            Err(err) => {
                error!("remote build step failed: {err}");
                DIST_REMOTE_STEP_FAILED_EXIT_CODE
            }
        };

        // Terminal state reached (or given up on): every key the remote
        // never signalled is now not-built.
        self.synchronizer.close();

        self.events.emit(
            names::DIST_BUILD_FINISHED,
            &json!({
                "stampede_id": stampede_id.as_ref().map(StampedeId::as_str),
                "exit_code": exit_code,
            }),
        );

        ExecutionResult {
            stampede_id,
            exit_code,
        }
    }

    async fn run_remote_build(
        &self,
        job: &JobState,
        mode: DistBuildMode,
        minions: u32,
        repository: &str,
        tenant: &str,
        stampede_id_out: &mut Option<StampedeId>,
    ) -> Result<BuildStatus, ServiceError> {
        let stampede_id = run_with_retry("start_build", &self.options.retry, || {
            self.service
                .start_build(job, mode, minions, repository, tenant)
        })
        .await?;
        info!("distributed build accepted with stampede id {stampede_id}");
        self.stats.set_stampede_id(stampede_id.clone());
        *stampede_id_out = Some(stampede_id.clone());

        let deadline = Instant::now() + self.options.max_build_duration;
        let mut signalled: HashSet<RuleKey> = HashSet::new();
        loop {
            let status = run_with_retry("fetch_status", &self.options.retry, || {
                self.service.fetch_status(&stampede_id)
            })
            .await?;

            for finished in &status.finished_rules {
                if signalled.insert(finished.rule_key) {
                    if finished.success {
                        self.synchronizer.signal_available(&finished.rule_key);
                    } else {
                        self.synchronizer.signal_not_built(&finished.rule_key);
                    }
                }
            }

            if self.options.log_materialization_enabled {
                self.logs.materialize_new(&status.log_run_ids).await;
            }

            if status.state.is_terminal() {
                if self.options.log_materialization_enabled {
                    // Bounded; failures inside are logged, not raised.
                    let _ = self.logs.wait_for_remaining(&status.log_run_ids).await;
                }
                return Ok(status);
            }

            if Instant::now() >= deadline {
                return Err(ServiceError::DeadlineExceeded);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    /// Publish cache-visibility details for default rule keys that
    /// missed. A non-zero count suggests a problem worth investigating;
    /// failure to fetch the details never fails the build.
    pub async fn publish_cache_miss_details(&self, cache_miss_keys: &[RuleKey]) {
        if cache_miss_keys.is_empty() {
            return;
        }
        match self.service.fetch_rule_key_logs(cache_miss_keys).await {
            Ok(entries) => self.events.emit(
                names::CACHE_MISS_RULE_KEYS,
                &json!({
                    "requested": cache_miss_keys.len(),
                    "entries": entries,
                }),
            ),
            Err(err) => warn!("failed to fetch rule key logs for cache misses: {err}"),
        }
    }

    pub fn materialized_log_run_ids(&self) -> Vec<String> {
        self.logs.materialized_run_ids()
    }
}
