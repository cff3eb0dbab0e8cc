//! Client configuration.
//!
//! Loaded from a TOML file (`.stampede.toml` at the repo root by
//! default), with a small set of environment overrides applied on top so
//! CI hosts can retarget the coordinator without editing files.

use crate::types::DistBuildMode;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const ENV_COORDINATOR: &str = "STAMPEDE_COORDINATOR";
pub const ENV_FALLBACK: &str = "STAMPEDE_ENABLE_FALLBACK";
pub const ENV_LOG_LEVEL: &str = "STAMPEDE_LOG_LEVEL";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: '{value}'")]
    InvalidEnvValue { var: &'static str, value: String },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StampedeConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub stampede: DistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root directory for build outputs, relative to the repo root.
    #[serde(default = "default_output_root")]
    pub output_root: PathBuf,
    /// Directory for invocation logs, relative to the repo root.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Maintain `<output_root>/last/` symlinks to produced outputs.
    #[serde(default = "default_true")]
    pub create_build_output_symlinks: bool,
    /// Seed mixed into every rule key.
    #[serde(default)]
    pub key_seed: u64,
    /// Resolve versioned dependencies before building.
    #[serde(default)]
    pub build_versions: bool,
    /// Target aliases, suggested when no targets are given.
    #[serde(default)]
    pub aliases: BTreeMap<String, String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            output_root: default_output_root(),
            log_dir: default_log_dir(),
            create_build_output_symlinks: true,
            key_seed: 0,
            build_versions: false,
            aliases: BTreeMap::new(),
        }
    }
}

/// The `[stampede]` table: everything the distributed path needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistConfig {
    /// `host:port` of the coordinator service.
    #[serde(default = "default_coordinator_address")]
    pub coordinator_address: String,
    /// Let the local build finish even when the remote build failed.
    #[serde(default)]
    pub enable_slow_local_build_fallback: bool,
    #[serde(default)]
    pub build_mode: DistBuildMode,
    #[serde(default = "default_minions")]
    pub number_of_minions: u32,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub tenant_id: String,
    /// Free-form label attached to client stats.
    #[serde(default)]
    pub build_label: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Overall wall-clock limit for the remote build.
    #[serde(default = "default_max_build_duration_secs")]
    pub max_build_duration_secs: u64,
    /// Bound on waiting for build-slave logs after the remote finishes.
    #[serde(default = "default_max_wait_for_remote_logs_ms")]
    pub max_wait_for_remote_logs_ms: u64,
    #[serde(default = "default_true")]
    pub log_materialization_enabled: bool,
    /// RPC retry budget.
    #[serde(default = "default_rpc_max_attempts")]
    pub rpc_max_attempts: u32,
    #[serde(default = "default_rpc_base_delay_ms")]
    pub rpc_base_delay_ms: u64,
    #[serde(default = "default_rpc_max_delay_ms")]
    pub rpc_max_delay_ms: u64,
}

impl Default for DistConfig {
    fn default() -> Self {
        Self {
            coordinator_address: default_coordinator_address(),
            enable_slow_local_build_fallback: false,
            build_mode: DistBuildMode::default(),
            number_of_minions: default_minions(),
            repository: String::new(),
            tenant_id: String::new(),
            build_label: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            max_build_duration_secs: default_max_build_duration_secs(),
            max_wait_for_remote_logs_ms: default_max_wait_for_remote_logs_ms(),
            log_materialization_enabled: true,
            rpc_max_attempts: default_rpc_max_attempts(),
            rpc_base_delay_ms: default_rpc_base_delay_ms(),
            rpc_max_delay_ms: default_rpc_max_delay_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output_root() -> PathBuf {
    PathBuf::from("stampede-out")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("stampede-out/log")
}

fn default_true() -> bool {
    true
}

fn default_coordinator_address() -> String {
    "127.0.0.1:9363".to_string()
}

fn default_minions() -> u32 {
    8
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_build_duration_secs() -> u64 {
    3_600
}

fn default_max_wait_for_remote_logs_ms() -> u64 {
    30_000
}

fn default_rpc_max_attempts() -> u32 {
    5
}

fn default_rpc_base_delay_ms() -> u64 {
    250
}

fn default_rpc_max_delay_ms() -> u64 {
    10_000
}

impl StampedeConfig {
    /// Load from `path` when given, else from `.stampede.toml` under
    /// `repo_root` if present, else defaults. Environment overrides are
    /// applied in every case.
    pub fn load(path: Option<&Path>, repo_root: &Path) -> Result<Self, ConfigError> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let implicit = repo_root.join(".stampede.toml");
                implicit.is_file().then_some(implicit)
            }
        };

        let mut config = match candidate {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(addr) = std::env::var(ENV_COORDINATOR) {
            if !addr.is_empty() {
                self.stampede.coordinator_address = addr;
            }
        }
        if let Ok(level) = std::env::var(ENV_LOG_LEVEL) {
            if !level.is_empty() {
                self.general.log_level = level;
            }
        }
        if let Ok(value) = std::env::var(ENV_FALLBACK) {
            self.stampede.enable_slow_local_build_fallback =
                match value.to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => true,
                    "0" | "false" | "no" | "off" | "" => false,
                    _ => {
                        return Err(ConfigError::InvalidEnvValue {
                            var: ENV_FALLBACK,
                            value,
                        })
                    }
                };
        }
        Ok(())
    }
}
