//! Local build seam.
//!
//! The heavy rule-execution engine lives elsewhere; this module owns the
//! pieces the coordinator needs to steer it: a terminable build handle,
//! the executor trait, and a dependency-ordered driver that gates
//! cacheable rules on the remote synchronizer and delegates actual rule
//! work to a [`RuleRunner`].

use crate::sync::{RemoteRuleCompletionWaiter, WaitOutcome};
use async_trait::async_trait;
use serde::Serialize;
use stampede_common::errors::DIST_LOCAL_STEP_FAILED_EXIT_CODE;
use stampede_common::graph::{ActionGraph, BuildRule, GraphError};
use stampede_common::types::{BuildTarget, LocalBuildMode, RuleKey};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ── Build handle ─────────────────────────────────────────────────────────

/// Handle onto a running local build. Constructed before the build
/// starts so the orchestrator can terminate it early; termination is
/// idempotent and the first cause wins.
pub struct BuildHandle {
    cancel: watch::Sender<Option<String>>,
}

impl BuildHandle {
    pub fn new() -> Self {
        Self {
            cancel: watch::channel(None).0,
        }
    }

    /// Ask the build to stop as soon as its current rules finish.
    pub fn terminate_build_with_failure(&self, cause: impl Into<String>) {
        let cause = cause.into();
        self.cancel.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(cause);
                true
            } else {
                false
            }
        });
    }

    pub fn termination_cause(&self) -> Option<String> {
        self.cancel.borrow().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.borrow().is_some()
    }

    /// Resolve once the build has been terminated, with the cause.
    pub async fn terminated(&self) -> String {
        let mut rx = self.cancel.subscribe();
        loop {
            if let Some(cause) = rx.borrow_and_update().clone() {
                return cause;
            }
            if rx.changed().await.is_err() {
                return "build handle dropped".to_string();
            }
        }
    }
}

impl Default for BuildHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot latch: the local task signals it once its build handle is
/// live, so the remote side knows early termination is possible.
pub struct InitializationLatch {
    tx: watch::Sender<bool>,
}

impl InitializationLatch {
    pub fn new() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }

    pub fn signal(&self) {
        let _ = self.tx.send(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for InitializationLatch {
    fn default() -> Self {
        Self::new()
    }
}

// ── Executor seams ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LocalBuildError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("no rule key computed for {target}")]
    MissingRuleKey { target: String },
    #[error("failed to write build report: {0}")]
    Report(#[from] std::io::Error),
}

/// Why one rule did not produce its outputs.
#[derive(Debug, thiserror::Error)]
pub enum RuleFailure {
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("artifact unavailable: {0}")]
    CacheMiss(String),
}

/// Executes or downloads a single rule.
#[async_trait]
pub trait RuleRunner: Send + Sync {
    /// Run the rule natively on this host.
    async fn run_rule(&self, rule: &BuildRule) -> Result<(), RuleFailure>;

    /// Materialize the rule's outputs from the remote cache.
    async fn fetch_from_cache(&self, rule: &BuildRule, key: &RuleKey) -> Result<(), RuleFailure>;
}

/// Collects rule keys whose artifacts missed the cache, for the
/// cache-visibility report published after the build.
#[derive(Debug, Default)]
pub struct CacheMissCollector {
    keys: std::sync::Mutex<Vec<RuleKey>>,
}

impl CacheMissCollector {
    pub fn record(&self, key: RuleKey) {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).push(key);
    }

    pub fn keys(&self) -> Vec<RuleKey> {
        self.keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocalBuildOptions {
    pub keep_going: bool,
    pub mode: Option<LocalBuildMode>,
    pub build_report: Option<PathBuf>,
    /// Fallback policy: build cacheable rules natively when the remote
    /// reports them not-built.
    pub build_cacheable_locally_when_not_built: bool,
    /// Per-rule bound on waiting for remote completion.
    pub wait_timeout: Option<Duration>,
    /// When set, artifact fetch failures are recorded here.
    pub cache_misses: Option<Arc<CacheMissCollector>>,
}

/// Runs the local half of a build for the given top-level targets.
#[async_trait]
pub trait LocalBuildExecutor: Send + Sync {
    async fn build(
        &self,
        graph: &ActionGraph,
        targets: &[BuildTarget],
        handle: Arc<BuildHandle>,
        waiter: Arc<dyn RemoteRuleCompletionWaiter>,
        options: &LocalBuildOptions,
    ) -> Result<i32, LocalBuildError>;
}

// ── Default driver ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "message")]
enum RuleOutcome {
    Built,
    Downloaded,
    Skipped(String),
    Failed(String),
}

#[derive(Serialize)]
struct BuildReport<'a> {
    success: bool,
    exit_code: i32,
    rules: &'a BTreeMap<String, RuleOutcome>,
}

/// Dependency-ordered driver over a [`RuleRunner`].
pub struct DefaultLocalExecutor {
    runner: Arc<dyn RuleRunner>,
    rule_keys: BTreeMap<BuildTarget, RuleKey>,
}

impl DefaultLocalExecutor {
    pub fn new(runner: Arc<dyn RuleRunner>, rule_keys: BTreeMap<BuildTarget, RuleKey>) -> Self {
        Self { runner, rule_keys }
    }

    async fn drive_rule(
        &self,
        rule: &BuildRule,
        handle: &BuildHandle,
        waiter: &Arc<dyn RemoteRuleCompletionWaiter>,
        options: &LocalBuildOptions,
    ) -> Result<RuleOutcome, LocalBuildError> {
        let populate_only = options.mode == Some(LocalBuildMode::PopulateCache);
        if populate_only && !rule.cacheable {
            return Ok(RuleOutcome::Skipped(
                "non-cacheable rule in populate-cache mode".to_string(),
            ));
        }

        if rule.cacheable && waiter.expects_remote_completion() {
            let key = self
                .rule_keys
                .get(&rule.target)
                .ok_or_else(|| LocalBuildError::MissingRuleKey {
                    target: rule.target.to_string(),
                })?;

            let outcome = tokio::select! {
                outcome = waiter.wait_for_rule(key, options.wait_timeout) => outcome,
                cause = handle.terminated() => {
                    return Ok(RuleOutcome::Failed(format!("build terminated: {cause}")));
                }
            };
            return Ok(match outcome {
                WaitOutcome::Available => match self.runner.fetch_from_cache(rule, key).await {
                    Ok(()) => RuleOutcome::Downloaded,
                    Err(err) => {
                        if let Some(collector) = &options.cache_misses {
                            collector.record(*key);
                        }
                        RuleOutcome::Failed(err.to_string())
                    }
                },
                WaitOutcome::NotBuilt => {
                    if options.build_cacheable_locally_when_not_built {
                        debug!("remote did not build {}, building locally", rule.target);
                        self.run_native(rule).await
                    } else {
                        RuleOutcome::Failed(
                            "remote build did not produce this artifact".to_string(),
                        )
                    }
                }
                WaitOutcome::Cancelled => {
                    RuleOutcome::Failed("remote synchronizer was cancelled".to_string())
                }
                WaitOutcome::TimedOut => {
                    RuleOutcome::Failed("timed out waiting for remote completion".to_string())
                }
            });
        }

        if populate_only {
            // Local-only populate run: pull what the cache has, skip the rest.
            let key = self.rule_keys.get(&rule.target);
            return Ok(match key {
                Some(key) => match self.runner.fetch_from_cache(rule, key).await {
                    Ok(()) => RuleOutcome::Downloaded,
                    Err(err) => RuleOutcome::Skipped(err.to_string()),
                },
                None => RuleOutcome::Skipped("no rule key available".to_string()),
            });
        }

        Ok(self.run_native(rule).await)
    }

    async fn run_native(&self, rule: &BuildRule) -> RuleOutcome {
        match self.runner.run_rule(rule).await {
            Ok(()) => RuleOutcome::Built,
            Err(err) => RuleOutcome::Failed(err.to_string()),
        }
    }

    fn write_report(
        path: &std::path::Path,
        exit_code: i32,
        rules: &BTreeMap<String, RuleOutcome>,
    ) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let report = BuildReport {
            success: exit_code == 0,
            exit_code,
            rules,
        };
        std::fs::write(path, serde_json::to_vec_pretty(&report)?)
    }
}

#[async_trait]
impl LocalBuildExecutor for DefaultLocalExecutor {
    async fn build(
        &self,
        graph: &ActionGraph,
        targets: &[BuildTarget],
        handle: Arc<BuildHandle>,
        waiter: Arc<dyn RemoteRuleCompletionWaiter>,
        options: &LocalBuildOptions,
    ) -> Result<i32, LocalBuildError> {
        let scope = match options.mode {
            // Deep builds materialize the whole graph's outputs.
            Some(LocalBuildMode::Deep) => vec![],
            _ => targets.to_vec(),
        };
        let order = graph.topo_order(&scope)?;
        info!("local build driving {} rule(s)", order.len());

        let mut outcomes: BTreeMap<String, RuleOutcome> = BTreeMap::new();
        let mut failed: BTreeSet<BuildTarget> = BTreeSet::new();
        let mut terminated = false;

        for target in order {
            if let Some(cause) = handle.termination_cause() {
                warn!("local build stopping early: {cause}");
                terminated = true;
                break;
            }
            let rule = match graph.get(&target) {
                Some(rule) => rule,
                None => {
                    return Err(GraphError::UnknownTarget {
                        target: target.to_string(),
                    }
                    .into())
                }
            };

            if let Some(dep) = rule.deps.iter().find(|d| failed.contains(*d)) {
                failed.insert(target.clone());
                outcomes.insert(
                    target.to_string(),
                    RuleOutcome::Failed(format!("dependency {dep} failed")),
                );
                continue;
            }

            let outcome = self.drive_rule(rule, &handle, &waiter, options).await?;
            if matches!(outcome, RuleOutcome::Failed(_)) {
                failed.insert(target.clone());
                outcomes.insert(target.to_string(), outcome);
                if !options.keep_going {
                    break;
                }
            } else {
                outcomes.insert(target.to_string(), outcome);
            }
        }

        let exit_code = if terminated {
            DIST_LOCAL_STEP_FAILED_EXIT_CODE
        } else if failed.is_empty() {
            0
        } else {
            1
        };

        if let Some(report) = &options.build_report {
            Self::write_report(report, exit_code, &outcomes)?;
        }
        Ok(exit_code)
    }
}
