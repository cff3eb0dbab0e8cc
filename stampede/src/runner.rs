//! Shell-command rule runner.
//!
//! Rules lowered from the manifest carry a `cmd` field; native execution
//! runs it through the shell with the repo root as working directory.
//! Artifact fetches copy outputs out of the local artifact cache,
//! `<output_root>/cache/<rule_key>/`, which the download pipeline keeps
//! populated.

use async_trait::async_trait;
use stampede_client::local::{RuleFailure, RuleRunner};
use stampede_common::graph::BuildRule;
use stampede_common::types::RuleKey;
use std::path::PathBuf;
use tracing::debug;

pub struct CommandRuleRunner {
    repo_root: PathBuf,
    output_root: PathBuf,
}

impl CommandRuleRunner {
    pub fn new(repo_root: PathBuf, output_root: PathBuf) -> Self {
        Self {
            repo_root,
            output_root,
        }
    }

    fn cache_dir(&self, key: &RuleKey) -> PathBuf {
        self.output_root.join("cache").join(key.to_hex())
    }

    fn prepare_output_dirs(&self, rule: &BuildRule) -> std::io::Result<()> {
        for output in &rule.outputs {
            if let Some(parent) = self.output_root.join(output).parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RuleRunner for CommandRuleRunner {
    async fn run_rule(&self, rule: &BuildRule) -> Result<(), RuleFailure> {
        let Some(cmd) = rule.fields.get("cmd") else {
            // Rules without commands (filegroups, aliases) have nothing
            // to execute.
            return Ok(());
        };
        self.prepare_output_dirs(rule)
            .map_err(|e| RuleFailure::Execution(e.to_string()))?;

        debug!("running {}: {cmd}", rule.target);
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| RuleFailure::Execution(format!("failed to spawn shell: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuleFailure::Execution(format!(
                "command exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn fetch_from_cache(&self, rule: &BuildRule, key: &RuleKey) -> Result<(), RuleFailure> {
        let cache_dir = self.cache_dir(key);
        if !cache_dir.is_dir() {
            return Err(RuleFailure::CacheMiss(format!(
                "no cached artifact for {} at {}",
                rule.target,
                cache_dir.display()
            )));
        }
        self.prepare_output_dirs(rule)
            .map_err(|e| RuleFailure::Execution(e.to_string()))?;

        for output in &rule.outputs {
            let name = output
                .file_name()
                .ok_or_else(|| RuleFailure::CacheMiss(format!("output {:?} has no name", output)))?;
            let from = cache_dir.join(name);
            let to = self.output_root.join(output);
            std::fs::copy(&from, &to).map_err(|e| {
                RuleFailure::CacheMiss(format!(
                    "failed to copy {} into place: {e}",
                    from.display()
                ))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stampede_common::types::BuildTarget;

    fn rule(cmd: Option<&str>, outputs: &[&str]) -> BuildRule {
        let mut fields = BTreeMap::new();
        if let Some(cmd) = cmd {
            fields.insert("cmd".to_string(), cmd.to_string());
        }
        BuildRule {
            target: BuildTarget::new("//demo:x"),
            rule_type: "genrule".to_string(),
            cell_root: PathBuf::from("/repo"),
            inputs: vec![],
            deps: vec![],
            outputs: outputs.iter().map(PathBuf::from).collect(),
            cacheable: true,
            fields,
        }
    }

    #[tokio::test]
    async fn test_run_rule_executes_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let out_root = dir.path().join("out");
        let runner = CommandRuleRunner::new(dir.path().to_path_buf(), out_root.clone());

        let r = rule(Some("echo hi > out/demo/result.txt"), &["demo/result.txt"]);
        runner.run_rule(&r).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(out_root.join("demo/result.txt"))
                .unwrap()
                .trim(),
            "hi"
        );
    }

    #[tokio::test]
    async fn test_failing_command_reports_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            CommandRuleRunner::new(dir.path().to_path_buf(), dir.path().join("out"));

        let r = rule(Some("echo broken >&2; exit 3"), &[]);
        let err = runner.run_rule(&r).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[tokio::test]
    async fn test_rule_without_command_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            CommandRuleRunner::new(dir.path().to_path_buf(), dir.path().join("out"));
        runner.run_rule(&rule(None, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_from_cache_copies_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out_root = dir.path().join("out");
        let runner = CommandRuleRunner::new(dir.path().to_path_buf(), out_root.clone());

        let key = RuleKey::from_bytes([0x42; 32]);
        let cache = out_root.join("cache").join(key.to_hex());
        std::fs::create_dir_all(&cache).unwrap();
        std::fs::write(cache.join("lib.a"), b"archive").unwrap();

        let r = rule(None, &["libs/lib.a"]);
        runner.fetch_from_cache(&r, &key).await.unwrap();
        assert_eq!(
            std::fs::read(out_root.join("libs/lib.a")).unwrap(),
            b"archive"
        );
    }

    #[tokio::test]
    async fn test_fetch_miss_is_reported_as_cache_miss() {
        let dir = tempfile::tempdir().unwrap();
        let runner =
            CommandRuleRunner::new(dir.path().to_path_buf(), dir.path().join("out"));
        let err = runner
            .fetch_from_cache(&rule(None, &["x"]), &RuleKey::from_bytes([9; 32]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuleFailure::CacheMiss(_)));
    }
}
