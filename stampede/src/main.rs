//! Stampede build CLI.
//!
//! Builds the requested targets locally, or hybrid local+remote with
//! `--distributed`: the action graph is fingerprinted and shipped to the
//! coordinator while the local build downloads artifacts as the remote
//! produces them.

#![forbid(unsafe_code)]

mod command;
mod manifest;
mod output;
mod runner;

use anyhow::{Context, Result};
use clap::Parser;
use command::{BuildCommand, BuildCommandArgs};
use output::ShowOutputOptions;
use stampede_client::events::EventBus;
use stampede_common::config::StampedeConfig;
use stampede_common::version::GIT_COMMIT_ENV;
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "stampede")]
#[command(author, version, about = "Builds the specified targets")]
struct Cli {
    /// Keep going when some targets can't be made.
    #[arg(long)]
    keep_going: bool,

    /// File where a build report will be written.
    #[arg(long, value_name = "PATH")]
    build_report: Option<PathBuf>,

    /// For debugging, limits the build to a specific target in the
    /// action graph.
    #[arg(long, value_name = "TARGET", hide = true)]
    just_build: Option<String>,

    /// Perform a "deep" build, making the output of all transitive
    /// dependencies available.
    #[arg(long)]
    deep: bool,

    /// Perform a "shallow" build, only making the outputs of the listed
    /// targets available.
    #[arg(long)]
    shallow: bool,

    /// Fetch unchanged outputs from the remote cache without building
    /// anything locally.
    #[arg(long)]
    populate_cache: bool,

    /// Copies the output of the lone build target to this path.
    #[arg(long, value_name = "PATH")]
    out: Option<PathBuf>,

    /// Report errors using absolute paths to the source files.
    #[arg(long)]
    report_absolute_paths: bool,

    /// Print the path to the output for each built rule, relative to the
    /// output root.
    #[arg(long)]
    show_output: bool,

    /// Print the absolute path to the output for each built rule.
    #[arg(long)]
    show_full_output: bool,

    /// Show output in JSON format.
    #[arg(long)]
    show_json_output: bool,

    /// Show full output in JSON format.
    #[arg(long)]
    show_full_json_output: bool,

    /// Print the rule key for each built rule.
    #[arg(long)]
    show_rulekey: bool,

    /// Run in distributed build mode.
    #[arg(long)]
    distributed: bool,

    /// Client binary to ship to the coordinator instead of the release
    /// git version.
    #[arg(long, value_name = "PATH", hide = true)]
    client_binary: Option<PathBuf>,

    /// Dump the serialized job state to this file instead of contacting
    /// the coordinator.
    #[arg(long, value_name = "PATH", hide = true)]
    build_state_file: Option<PathBuf>,

    /// If set, log a binary representation of rule keys to this file.
    #[arg(long, value_name = "PATH")]
    rulekeys_log_path: Option<PathBuf>,

    /// Path to the config file (defaults to `.stampede.toml` at the repo
    /// root).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Repo root (defaults to the current directory).
    #[arg(long, value_name = "PATH")]
    repo_root: Option<PathBuf>,

    /// Build targets.
    targets: Vec<String>,
}

impl Cli {
    fn into_args(self) -> (BuildCommandArgs, Option<PathBuf>, Option<PathBuf>) {
        let show = ShowOutputOptions {
            show_output: self.show_output,
            show_full_output: self.show_full_output,
            show_json_output: self.show_json_output,
            show_full_json_output: self.show_full_json_output,
            show_rulekey: self.show_rulekey,
        };
        (
            BuildCommandArgs {
                targets: self.targets,
                keep_going: self.keep_going,
                build_report: self.build_report,
                just_build: self.just_build,
                deep: self.deep,
                shallow: self.shallow,
                populate_cache: self.populate_cache,
                out: self.out,
                report_absolute_paths: self.report_absolute_paths,
                show,
                distributed: self.distributed,
                client_binary: self.client_binary,
                build_state_file: self.build_state_file,
                rulekeys_log_path: self.rulekeys_log_path,
            },
            self.config,
            self.repo_root,
        )
    }
}

/// Forward console-facing events to stderr.
fn spawn_console_forwarder(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(line) = rx.recv().await {
            let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            let event = parsed["event"].as_str().unwrap_or_default();
            if event == stampede_client::events::names::CONSOLE_WARNING
                || event == stampede_client::events::names::CONSOLE_ERROR
            {
                if let Some(message) = parsed["data"]["message"].as_str() {
                    eprintln!("{message}");
                }
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (args, config_path, repo_root) = cli.into_args();

    let repo_root = match repo_root {
        Some(root) => root,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    let config = StampedeConfig::load(config_path.as_deref(), &repo_root)
        .context("failed to load configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.general.log_level.clone()));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    // Process-wide release property, read exactly once; everything
    // downstream receives the resolved value.
    let git_commit = std::env::var(GIT_COMMIT_ENV).ok();

    let events = EventBus::default();
    spawn_console_forwarder(&events);

    let command = BuildCommand::new(args, config, repo_root, git_commit, events);
    let exit = command.run().await;
    std::process::exit(exit.code());
}
