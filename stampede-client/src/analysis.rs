//! Post-build analysis.
//!
//! After the local build joins, a summary of the distributed build is
//! dumped under the invocation's log directory: which rules were in
//! play, their keys, and which build-slave log streams were
//! materialized. The file is what gets linked from the console when a
//! distributed build needs investigating.

use stampede_common::types::{BuildTarget, RuleKey, StampedeId};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// Inputs the analysis works from.
pub struct PostBuildAnalysis {
    invocation_id: String,
    stampede_id: Option<StampedeId>,
    log_dir: PathBuf,
    materialized_run_ids: Vec<String>,
    command_name: &'static str,
}

/// Rendered analysis, ready to dump.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSummary {
    pub rule_count: usize,
    pub text: String,
}

impl PostBuildAnalysis {
    pub fn new(
        invocation_id: impl Into<String>,
        stampede_id: Option<StampedeId>,
        log_dir: PathBuf,
        materialized_run_ids: Vec<String>,
        command_name: &'static str,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            stampede_id,
            log_dir,
            materialized_run_ids,
            command_name,
        }
    }

    pub fn run(&self, rule_keys: &BTreeMap<BuildTarget, RuleKey>) -> AnalysisSummary {
        let mut text = String::new();
        let _ = writeln!(text, "command: {}", self.command_name);
        let _ = writeln!(text, "invocation: {}", self.invocation_id);
        let _ = writeln!(
            text,
            "stampede_id: {}",
            self.stampede_id
                .as_ref()
                .map(StampedeId::as_str)
                .unwrap_or("<none>")
        );
        let _ = writeln!(text, "rules: {}", rule_keys.len());
        let _ = writeln!(
            text,
            "materialized_log_runs: {}",
            if self.materialized_run_ids.is_empty() {
                "<none>".to_string()
            } else {
                self.materialized_run_ids.join(", ")
            }
        );
        let _ = writeln!(text);
        for (target, key) in rule_keys {
            let _ = writeln!(text, "{target} => {key}");
        }
        AnalysisSummary {
            rule_count: rule_keys.len(),
            text,
        }
    }

    /// Write the summary under the log directory and return its path.
    pub fn dump_to_log_file(&self, summary: &AnalysisSummary) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.log_dir)?;
        let path = self
            .log_dir
            .join(format!("dist_build_analysis_{}.txt", self.invocation_id));
        std::fs::write(&path, &summary.text)?;
        Ok(path)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> BTreeMap<BuildTarget, RuleKey> {
        [
            (
                BuildTarget::new("//app:bin"),
                RuleKey::from_bytes([0x11; 32]),
            ),
            (
                BuildTarget::new("//lib:core"),
                RuleKey::from_bytes([0x22; 32]),
            ),
        ]
        .into()
    }

    #[test]
    fn test_summary_names_every_rule() {
        let analysis = PostBuildAnalysis::new(
            "inv-1",
            Some(StampedeId::new("s-7")),
            PathBuf::from("/tmp/logs"),
            vec!["run-1".to_string()],
            "build",
        );
        let summary = analysis.run(&keys());
        assert_eq!(summary.rule_count, 2);
        assert!(summary.text.contains("stampede_id: s-7"));
        assert!(summary.text.contains("//app:bin"));
        assert!(summary.text.contains(&"11".repeat(32)));
        assert!(summary.text.contains("run-1"));
    }

    #[test]
    fn test_dump_writes_under_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let analysis = PostBuildAnalysis::new(
            "inv-2",
            None,
            dir.path().join("log"),
            vec![],
            "build",
        );
        let summary = analysis.run(&keys());
        let path = analysis.dump_to_log_file(&summary).unwrap();

        assert_eq!(
            path.file_name().unwrap().to_string_lossy(),
            "dist_build_analysis_inv-2.txt"
        );
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("stampede_id: <none>"));
        assert!(contents.contains("materialized_log_runs: <none>"));
    }
}
