//! The build command.
//!
//! Argument validation, graph creation through the manifest providers,
//! then dispatch: a purely local build, or the hybrid distributed path
//! through the orchestrator. Success-path reporting (symlinks, output
//! listings, `--out`) happens here as well.

use crate::manifest::ManifestProvider;
use crate::output::{self, ShowOutputOptions};
use crate::runner::CommandRuleRunner;
use stampede_client::cells::{CellIndexer, KnownCell};
use stampede_client::events::{names, EventBus};
use stampede_client::hash_cache::{DiskHashCache, FileHashLoader, FileHashRecorder, RecordingHashCache};
use stampede_client::job_state;
use stampede_client::local::{
    BuildHandle, DefaultLocalExecutor, LocalBuildExecutor, LocalBuildOptions,
};
use stampede_client::orchestrator::{
    BuildGraphs, DistBuildParams, HybridBuildOrchestrator, OrchestratorError,
};
use stampede_client::rule_keys::{RuleKeyComputer, RuleKeyLogger};
use stampede_client::service::JsonLineClient;
use stampede_client::stats::{BuildPhase, ClientStatsTracker};
use stampede_client::sync::NoOpCompletionWaiter;
use stampede_common::config::StampedeConfig;
use stampede_common::errors::{missing_targets_message, BuildClientError, ExitCode};
use stampede_common::graph::{ActionGraphProvider, TargetGraphProvider};
use stampede_common::types::{BuildTarget, LocalBuildMode, RuleKey};
use stampede_common::version::{resolve_client_version, VersionError};
use stampede_common::protocol::ClientVersion;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, warn};

/// Parsed command-line surface of `stampede`.
#[derive(Debug, Clone, Default)]
pub struct BuildCommandArgs {
    pub targets: Vec<String>,
    pub keep_going: bool,
    pub build_report: Option<PathBuf>,
    pub just_build: Option<String>,
    pub deep: bool,
    pub shallow: bool,
    pub populate_cache: bool,
    pub out: Option<PathBuf>,
    pub report_absolute_paths: bool,
    pub show: ShowOutputOptions,
    pub distributed: bool,
    pub client_binary: Option<PathBuf>,
    pub build_state_file: Option<PathBuf>,
    pub rulekeys_log_path: Option<PathBuf>,
}

pub struct BuildCommand {
    args: BuildCommandArgs,
    config: StampedeConfig,
    repo_root: PathBuf,
    /// Release git commit, read once from the environment at startup.
    git_commit: Option<String>,
    events: EventBus,
}

impl BuildCommand {
    pub fn new(
        args: BuildCommandArgs,
        config: StampedeConfig,
        repo_root: PathBuf,
        git_commit: Option<String>,
        events: EventBus,
    ) -> Self {
        Self {
            args,
            config,
            repo_root,
            git_commit,
            events,
        }
    }

    /// Run to completion and reduce everything to a process exit code.
    pub async fn run(&self) -> ExitCode {
        match self.execute().await {
            Ok(code) => code,
            Err(err) => {
                let message = self.render_error(&err);
                error!("{message}");
                self.events.console_error(message);
                err.exit_code()
            }
        }
    }

    /// Errors name source files relative to the repo root unless
    /// `--report-absolute-paths` asks otherwise.
    fn render_error(&self, err: &BuildClientError) -> String {
        let message = err.to_string();
        if self.args.report_absolute_paths {
            return message;
        }
        let mut prefix = self.repo_root.display().to_string();
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        message.replace(&prefix, "")
    }

    async fn execute(&self) -> Result<ExitCode, BuildClientError> {
        self.check_arguments()?;

        let provider = Arc::new(
            ManifestProvider::load(&self.repo_root)
                .map_err(|e| BuildClientError::Parse(e.to_string()))?,
        );
        let patterns = self.resolve_aliases();

        if self.args.distributed {
            self.execute_dist_build(provider, &patterns).await
        } else {
            self.execute_local_build(provider, &patterns).await
        }
    }

    fn check_arguments(&self) -> Result<(), BuildClientError> {
        if self.args.targets.is_empty() {
            return Err(BuildClientError::CommandLine(missing_targets_message(
                self.config.general.aliases.keys().map(String::as_str),
            )));
        }
        let modes = [self.args.deep, self.args.shallow, self.args.populate_cache];
        if modes.iter().filter(|m| **m).count() > 1 {
            return Err(BuildClientError::CommandLine(
                "--deep, --shallow and --populate-cache are mutually exclusive".to_string(),
            ));
        }
        if self.args.populate_cache && self.args.distributed {
            return Err(BuildClientError::CommandLine(
                "--populate-cache cannot be combined with --distributed".to_string(),
            ));
        }
        Ok(())
    }

    fn resolve_aliases(&self) -> Vec<String> {
        self.args
            .targets
            .iter()
            .map(|pattern| {
                self.config
                    .general
                    .aliases
                    .get(pattern)
                    .cloned()
                    .unwrap_or_else(|| pattern.clone())
            })
            .collect()
    }

    fn local_build_mode(&self) -> Option<LocalBuildMode> {
        if self.args.deep {
            Some(LocalBuildMode::Deep)
        } else if self.args.shallow {
            Some(LocalBuildMode::Shallow)
        } else if self.args.populate_cache {
            Some(LocalBuildMode::PopulateCache)
        } else {
            None
        }
    }

    fn output_root(&self) -> PathBuf {
        self.repo_root.join(&self.config.general.output_root)
    }

    fn log_dir(&self) -> PathBuf {
        self.repo_root.join(&self.config.general.log_dir)
    }

    /// Build both graphs and apply the target-narrowing flags.
    fn create_graphs(
        &self,
        provider: &ManifestProvider,
        patterns: &[String],
    ) -> Result<(BuildGraphs, BTreeSet<BuildTarget>), BuildClientError> {
        let unversioned = provider
            .unversioned_target_graph(patterns)
            .map_err(|e| BuildClientError::Parse(e.to_string()))?;
        let versioned = if self.config.general.build_versions {
            provider
                .versioned_target_graph(&unversioned)
                .map_err(|e| BuildClientError::Parse(e.to_string()))?
        } else {
            None
        };

        let local_graph = versioned.as_ref().unwrap_or(&unversioned);

        // `--out` needs exactly one target; a lone wildcard argument can
        // still have expanded to several, which only shows up here.
        if self.args.out.is_some() && local_graph.targets.len() != 1 {
            let expanded = local_graph
                .targets
                .iter()
                .map(BuildTarget::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(BuildClientError::Parse(format!(
                "when using --out you must specify exactly one build target, \
                 but you specified [{expanded}]"
            )));
        }

        let action_graph = provider
            .action_graph(local_graph)
            .map_err(|e| BuildClientError::Parse(e.to_string()))?;

        let build_targets = match &self.args.just_build {
            Some(name) => {
                let target = BuildTarget::new(name);
                if !action_graph.contains(&target) {
                    return Err(BuildClientError::Parse(
                        "targets specified via `--just-build` must be a subset of the action \
                         graph"
                            .to_string(),
                    ));
                }
                [target].into()
            }
            None => local_graph.targets.clone(),
        };

        Ok((
            BuildGraphs {
                unversioned,
                versioned,
                action_graph,
            },
            build_targets,
        ))
    }

    fn cell_indexer(&self, provider: &ManifestProvider) -> Arc<CellIndexer> {
        let root = KnownCell {
            root: self.repo_root.clone(),
            name: String::new(),
            config_overrides: BTreeMap::new(),
        };
        let others = provider
            .cells()
            .into_iter()
            .map(|(name, root)| KnownCell {
                root,
                name,
                config_overrides: BTreeMap::new(),
            })
            .collect();
        Arc::new(CellIndexer::new(root, others))
    }

    fn rule_key_logger(&self) -> Result<Option<Arc<RuleKeyLogger>>, BuildClientError> {
        match &self.args.rulekeys_log_path {
            Some(path) => RuleKeyLogger::create(path)
                .map(|l| Some(Arc::new(l)))
                .map_err(|e| BuildClientError::Fatal(format!("cannot open rule key log: {e}"))),
            None => Ok(None),
        }
    }

    fn local_options(&self) -> LocalBuildOptions {
        LocalBuildOptions {
            keep_going: self.args.keep_going,
            mode: self.local_build_mode(),
            build_report: self.args.build_report.clone(),
            build_cacheable_locally_when_not_built: false,
            wait_timeout: None,
            cache_misses: None,
        }
    }

    // ── Local-only path ──────────────────────────────────────────────

    async fn execute_local_build(
        &self,
        provider: Arc<ManifestProvider>,
        patterns: &[String],
    ) -> Result<ExitCode, BuildClientError> {
        let (graphs, build_targets) = self.create_graphs(&provider, patterns)?;

        // Keys are only needed when something consumes them: the rule
        // key log, `--show-rulekey`, or cache population.
        let logger = self.rule_key_logger()?;
        let needs_keys =
            logger.is_some() || self.args.show.show_rulekey || self.args.populate_cache;
        let rule_keys = if needs_keys {
            let cells = self.cell_indexer(&provider);
            let cache: Arc<dyn FileHashLoader> = Arc::new(DiskHashCache::new());
            RuleKeyComputer::new(self.config.general.key_seed, cells, cache, logger)
                .compute(&graphs.action_graph)
                .await
                .map_err(|e| BuildClientError::Fatal(e.to_string()))?
        } else {
            BTreeMap::new()
        };

        let executor = DefaultLocalExecutor::new(
            Arc::new(CommandRuleRunner::new(
                self.repo_root.clone(),
                self.output_root(),
            )),
            rule_keys.clone(),
        );
        let targets: Vec<BuildTarget> = build_targets.iter().cloned().collect();
        let code = executor
            .build(
                &graphs.action_graph,
                &targets,
                Arc::new(BuildHandle::new()),
                Arc::new(NoOpCompletionWaiter),
                &self.local_options(),
            )
            .await
            .map_err(|e| BuildClientError::Fatal(e.to_string()))?;

        let exit = ExitCode::from_build_code(code);
        if exit.is_success() {
            self.process_successful_build(&graphs, &build_targets, &rule_keys)?;
        }
        Ok(exit)
    }

    // ── Distributed path ─────────────────────────────────────────────

    async fn execute_dist_build(
        &self,
        provider: Arc<ManifestProvider>,
        patterns: &[String],
    ) -> Result<ExitCode, BuildClientError> {
        let stats = Arc::new(ClientStatsTracker::new(
            self.config.stampede.build_label.clone(),
        ));
        stats.start_timer(BuildPhase::LocalPreparation);
        stats.start_timer(BuildPhase::LocalGraphConstruction);
        let (graphs, build_targets) = self.create_graphs(&provider, patterns)?;
        stats.stop_timer(BuildPhase::LocalGraphConstruction);

        let result = self
            .run_distributed(provider, graphs, &build_targets, Arc::clone(&stats))
            .await;

        // Stats are emitted on every path out of the distributed build,
        // but only once a stampede id was received; without one there is
        // nothing the stats pipeline can join them against.
        if let Err(err) = &result {
            stats.set_client_error(err.to_string());
        }
        if stats.has_stampede_id() {
            match stats.generate() {
                Ok(snapshot) => self.events.emit(names::CLIENT_STATS, &snapshot),
                Err(err) => warn!("not publishing client stats: {err}"),
            }
        } else {
            error!("not publishing client stats: no stampede id was received");
        }

        let (code, graphs, rule_keys) = result?;
        let exit = ExitCode::from_build_code(code);
        if exit.is_success() {
            self.process_successful_build(&graphs, &build_targets, &rule_keys)?;
        }
        Ok(exit)
    }

    async fn run_distributed(
        &self,
        provider: Arc<ManifestProvider>,
        graphs: BuildGraphs,
        build_targets: &BTreeSet<BuildTarget>,
        stats: Arc<ClientStatsTracker>,
    ) -> Result<(i32, Arc<BuildGraphs>, BTreeMap<BuildTarget, RuleKey>), BuildClientError> {
        // Fingerprint the graph through the recording cache so the job
        // descriptor carries every hash the keys read.
        let cells = self.cell_indexer(&provider);
        let recorder = Arc::new(FileHashRecorder::new(Arc::clone(&cells)));
        let recording: Arc<dyn FileHashLoader> = Arc::new(RecordingHashCache::new(
            Arc::new(DiskHashCache::new()),
            Arc::clone(&recorder),
        ));
        let logger = self.rule_key_logger()?;
        let rule_keys = RuleKeyComputer::new(
            self.config.general.key_seed,
            Arc::clone(&cells),
            recording,
            logger,
        )
        .compute(&graphs.action_graph)
        .await
        .map_err(|e| BuildClientError::Fatal(e.to_string()))?;

        let client_version = match resolve_client_version(
            self.args.client_binary.as_deref(),
            self.git_commit.as_deref(),
        ) {
            Ok(version) => version,
            // A state dump never talks to the coordinator; a missing
            // version tag should not block it.
            Err(VersionError::NoGitCommit) if self.args.build_state_file.is_some() => {
                ClientVersion::Git("unversioned".to_string())
            }
            Err(err) => return Err(BuildClientError::CommandLine(err.to_string())),
        };

        let job = job_state::assemble(
            &cells,
            &recorder,
            &graphs.unversioned.graph,
            &graphs.unversioned.targets,
            client_version,
        )
        .map_err(|e| BuildClientError::Fatal(e.to_string()))?;

        let executor: Arc<dyn LocalBuildExecutor> = Arc::new(DefaultLocalExecutor::new(
            Arc::new(CommandRuleRunner::new(
                self.repo_root.clone(),
                self.output_root(),
            )),
            rule_keys.clone(),
        ));
        let orchestrator = HybridBuildOrchestrator::new(
            Arc::new(JsonLineClient::new(
                self.config.stampede.coordinator_address.clone(),
            )),
            executor,
            self.events.clone(),
            self.config.stampede.clone(),
            self.log_dir(),
        );

        // A signal must stop both sub-builds, not just this process.
        let cancel = orchestrator.cancel_signal();
        let signal_task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let graphs = Arc::new(graphs);
        let params = DistBuildParams {
            graphs: Arc::clone(&graphs),
            job,
            cells,
            rule_keys: rule_keys.clone(),
            targets: build_targets.iter().cloned().collect(),
            local_options: self.local_options(),
            state_dump_path: self.args.build_state_file.clone(),
            invocation_id: uuid::Uuid::new_v4().to_string(),
        };

        let outcome = orchestrator.execute(params, stats).await;
        signal_task.abort();

        let code = outcome.map_err(|err| match err {
            OrchestratorError::Cancelled => BuildClientError::Fatal("build was cancelled".into()),
            other => BuildClientError::Fatal(other.to_string()),
        })?;
        Ok((code, graphs, rule_keys))
    }

    // ── Success path ─────────────────────────────────────────────────

    fn process_successful_build(
        &self,
        graphs: &BuildGraphs,
        build_targets: &BTreeSet<BuildTarget>,
        rule_keys: &BTreeMap<BuildTarget, RuleKey>,
    ) -> Result<(), BuildClientError> {
        let output_root = self.output_root();

        if self.config.general.create_build_output_symlinks {
            output::symlink_build_results(&graphs.action_graph, build_targets, &output_root)
                .map_err(|e| BuildClientError::Fatal(format!("failed to update last/: {e}")))?;
        }

        if self.args.show.any() {
            let mut stdout = std::io::stdout().lock();
            output::show_outputs(
                &mut stdout,
                &graphs.action_graph,
                build_targets,
                rule_keys,
                &output_root,
                &self.args.show,
            )
            .map_err(|e| BuildClientError::Fatal(e.to_string()))?;
        }

        if let Some(destination) = &self.args.out {
            let target = build_targets.iter().next().ok_or_else(|| {
                BuildClientError::Fatal("no build target for --out".to_string())
            })?;
            output::copy_single_output(&graphs.action_graph, target, &output_root, destination)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_common::config::{GeneralConfig, StampedeConfig};

    const MANIFEST: &str = r#"{
        "targets": {
            "//app:bin": {
                "type": "genrule",
                "deps": ["//lib:core"],
                "inputs": ["app.src"],
                "outputs": ["app/bin"],
                "cacheable": false,
                "cmd": "cat app.src > stampede-out/app/bin"
            },
            "//lib:core": {
                "type": "genrule",
                "inputs": ["lib.src"],
                "outputs": ["lib/core.a"],
                "cmd": "cat lib.src > stampede-out/lib/core.a"
            }
        }
    }"#;

    fn write_repo(dir: &std::path::Path) {
        std::fs::create_dir_all(dir.join(".stampede")).unwrap();
        std::fs::write(dir.join(".stampede/manifest.json"), MANIFEST).unwrap();
        std::fs::write(dir.join("app.src"), b"app bytes").unwrap();
        std::fs::write(dir.join("lib.src"), b"lib bytes").unwrap();
    }

    fn command(dir: &std::path::Path, args: BuildCommandArgs) -> BuildCommand {
        command_with_config(dir, args, StampedeConfig::default())
    }

    fn command_with_config(
        dir: &std::path::Path,
        args: BuildCommandArgs,
        config: StampedeConfig,
    ) -> BuildCommand {
        BuildCommand::new(
            args,
            config,
            dir.to_path_buf(),
            Some("test-commit".to_string()),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_zero_targets_is_a_commandline_error_with_alias_suggestions() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let config = StampedeConfig {
            general: GeneralConfig {
                aliases: [("app".to_string(), "//app:bin".to_string())].into(),
                ..GeneralConfig::default()
            },
            ..StampedeConfig::default()
        };
        let cmd = command_with_config(dir.path(), BuildCommandArgs::default(), config);
        let err = cmd.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CommandLineError);
        assert!(err.to_string().contains("at least one build target"));
        assert!(err.to_string().contains("app"));
    }

    #[tokio::test]
    async fn test_populate_cache_conflicts_with_distributed() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                populate_cache: true,
                distributed: true,
                ..Default::default()
            },
        );
        let err = cmd.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CommandLineError);
    }

    #[tokio::test]
    async fn test_exclusive_depth_flags_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                deep: true,
                shallow: true,
                ..Default::default()
            },
        );
        let err = cmd.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CommandLineError);
    }

    #[tokio::test]
    async fn test_out_with_wildcard_expanding_to_many_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//...".to_string()],
                out: Some(dir.path().join("delivered")),
                ..Default::default()
            },
        );
        let err = cmd.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::ParseError);
        assert!(err.to_string().contains("exactly one build target"));
    }

    #[tokio::test]
    async fn test_just_build_outside_action_graph_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                just_build: Some("//ghost:x".to_string()),
                ..Default::default()
            },
        );
        let err = cmd.execute().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::ParseError);
        assert!(err.to_string().contains("--just-build"));
    }

    #[tokio::test]
    async fn test_local_build_produces_outputs_and_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                ..Default::default()
            },
        );
        let exit = cmd.execute().await.unwrap();
        assert!(exit.is_success());
        assert_eq!(
            std::fs::read(dir.path().join("stampede-out/app/bin")).unwrap(),
            b"app bytes"
        );
        // last/ symlinks maintained by default.
        assert!(dir.path().join("stampede-out/last/bin").exists());
    }

    #[tokio::test]
    async fn test_out_copies_the_lone_output() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let destination = dir.path().join("delivered/bin");
        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                out: Some(destination.clone()),
                ..Default::default()
            },
        );
        let exit = cmd.execute().await.unwrap();
        assert!(exit.is_success());
        assert_eq!(std::fs::read(destination).unwrap(), b"app bytes");
    }

    #[tokio::test]
    async fn test_alias_resolution_reaches_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let config = StampedeConfig {
            general: GeneralConfig {
                aliases: [("app".to_string(), "//app:bin".to_string())].into(),
                ..GeneralConfig::default()
            },
            ..StampedeConfig::default()
        };
        let cmd = command_with_config(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["app".to_string()],
                ..Default::default()
            },
            config,
        );
        assert!(cmd.execute().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_build_state_file_dump_makes_no_rpc_and_exits_zero() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let dump = dir.path().join("state.json");
        let cmd = command(
            dir.path(),
            BuildCommandArgs {
                targets: vec!["//app:bin".to_string()],
                distributed: true,
                build_state_file: Some(dump.clone()),
                ..Default::default()
            },
        );
        // The default coordinator address points nowhere; the dump path
        // must succeed regardless because it never dials out.
        let exit = cmd.execute().await.unwrap();
        assert!(exit.is_success());

        let state = stampede_common::protocol::JobState::from_json_slice(
            &std::fs::read(&dump).unwrap(),
        )
        .unwrap();
        assert_eq!(state.top_level_targets, vec!["//app:bin".to_string()]);
        let entries: usize = state.file_hashes.iter().map(|t| t.entries.len()).sum();
        assert_eq!(entries, 2);
        for table in &state.file_hashes {
            for entry in &table.entries {
                assert!(entry.contents.is_some());
            }
        }
    }

    #[tokio::test]
    async fn test_errors_use_relative_paths_unless_asked() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path());

        let relative = command(dir.path(), BuildCommandArgs::default());
        let absolute = command(
            dir.path(),
            BuildCommandArgs {
                report_absolute_paths: true,
                ..Default::default()
            },
        );
        let err = BuildClientError::Parse(format!(
            "cannot read {}/app.src",
            dir.path().display()
        ));

        assert_eq!(relative.render_error(&err), "cannot read app.src");
        assert!(absolute.render_error(&err).contains(&*dir.path().to_string_lossy()));
    }
}
