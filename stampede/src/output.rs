//! Success-path reporting: `--show-output` variants, `last/` symlinks,
//! and the `--out` copy.

use stampede_common::errors::BuildClientError;
use stampede_common::graph::ActionGraph;
use stampede_common::types::{BuildTarget, RuleKey};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct ShowOutputOptions {
    pub show_output: bool,
    pub show_full_output: bool,
    pub show_json_output: bool,
    pub show_full_json_output: bool,
    pub show_rulekey: bool,
}

impl ShowOutputOptions {
    pub fn any(&self) -> bool {
        self.show_output
            || self.show_full_output
            || self.show_json_output
            || self.show_full_json_output
            || self.show_rulekey
    }

    fn json(&self) -> bool {
        self.show_json_output || self.show_full_json_output
    }

    fn full(&self) -> bool {
        self.show_full_output || self.show_full_json_output
    }
}

/// Render the per-target output report to `sink`.
pub fn show_outputs(
    sink: &mut impl Write,
    graph: &ActionGraph,
    targets: &BTreeSet<BuildTarget>,
    rule_keys: &BTreeMap<BuildTarget, RuleKey>,
    output_root: &Path,
    options: &ShowOutputOptions,
) -> std::io::Result<()> {
    let display_path = |output: &PathBuf| {
        let path = output_root.join(output);
        if options.full() {
            path
        } else {
            path.strip_prefix(output_root)
                .map(Path::to_path_buf)
                .unwrap_or(path)
        }
    };

    if options.json() {
        let mut sorted: BTreeMap<String, String> = BTreeMap::new();
        for target in targets {
            let output = graph
                .get(target)
                .and_then(|rule| rule.primary_output())
                .map(|o| display_path(o).display().to_string())
                .unwrap_or_default();
            sorted.insert(target.to_string(), output);
        }
        let rendered = serde_json::to_string_pretty(&sorted)?;
        writeln!(sink, "{rendered}")?;
        return Ok(());
    }

    for target in targets {
        let rule = graph.get(target);
        let mut line = target.to_string();
        if options.show_rulekey {
            if let Some(key) = rule_keys.get(target) {
                line.push(' ');
                line.push_str(&key.to_hex());
            }
        }
        if options.show_output || options.show_full_output {
            if let Some(output) = rule.and_then(|r| r.primary_output()) {
                line.push(' ');
                line.push_str(&display_path(output).display().to_string());
            }
        }
        writeln!(sink, "{line}")?;
    }
    Ok(())
}

/// Recreate `<output_root>/last/` with a symlink per produced output.
/// Duplicate basenames keep the first link.
pub fn symlink_build_results(
    graph: &ActionGraph,
    targets: &BTreeSet<BuildTarget>,
    output_root: &Path,
) -> std::io::Result<()> {
    let last_dir = output_root.join("last");
    if last_dir.exists() {
        std::fs::remove_dir_all(&last_dir)?;
    }
    std::fs::create_dir_all(&last_dir)?;

    for target in targets {
        let Some(output) = graph.get(target).and_then(|r| r.primary_output()) else {
            continue;
        };
        let produced = output_root.join(output);
        let Some(name) = produced.file_name() else {
            continue;
        };
        let link = last_dir.join(name);
        if link.exists() {
            debug!("skipping duplicate last/ symlink for {}", target);
            continue;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&produced, &link)?;
        #[cfg(not(unix))]
        std::fs::copy(&produced, &link).map(|_| ())?;
    }
    Ok(())
}

/// `--out`: copy the lone target's single output to `destination`.
pub fn copy_single_output(
    graph: &ActionGraph,
    target: &BuildTarget,
    output_root: &Path,
    destination: &Path,
) -> Result<(), BuildClientError> {
    let rule = graph
        .get(target)
        .ok_or_else(|| BuildClientError::Parse(format!("unknown target {target}")))?;
    if !rule.output_file_can_be_copied() {
        return Err(BuildClientError::OutputIncompatible {
            target: target.to_string(),
        });
    }
    let output = rule
        .primary_output()
        .ok_or_else(|| BuildClientError::OutputIncompatible {
            target: target.to_string(),
        })?;
    let from = output_root.join(output);
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BuildClientError::Fatal(e.to_string()))?;
        }
    }
    std::fs::copy(&from, destination)
        .map(|_| ())
        .map_err(|e| BuildClientError::Fatal(format!("failed to copy {}: {e}", from.display())))
}
