//! Manifest-backed graph providers.
//!
//! The real parser and action-graph machinery live behind the provider
//! traits in `stampede_common::graph`; this binary ships a JSON-manifest
//! implementation so the tool runs end-to-end against a checked-in
//! description of the repo's targets.
//!
//! Manifest shape (`.stampede/manifest.json` at the repo root):
//!
//! ```json
//! {
//!   "cells": { "sdk": "vendor/sdk" },
//!   "targets": {
//!     "//app:bin": {
//!       "type": "cc_binary",
//!       "deps": ["//lib:core"],
//!       "inputs": ["app/main.c"],
//!       "outputs": ["app/bin"],
//!       "cacheable": false,
//!       "cmd": "cc -o stampede-out/app/bin app/main.c"
//!     }
//!   }
//! }
//! ```

use serde::Deserialize;
use stampede_common::graph::{
    ActionGraph, ActionGraphProvider, BuildRule, GraphError, TargetGraph, TargetGraphAndTargets,
    TargetGraphProvider, TargetNode,
};
use stampede_common::types::BuildTarget;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

pub const MANIFEST_RELATIVE_PATH: &str = ".stampede/manifest.json";

#[derive(Debug, Clone, Deserialize)]
struct ManifestTarget {
    #[serde(rename = "type")]
    rule_type: String,
    #[serde(default)]
    deps: Vec<String>,
    #[serde(default)]
    inputs: Vec<String>,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default = "default_cacheable")]
    cacheable: bool,
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

fn default_cacheable() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
struct ManifestFile {
    #[serde(default)]
    cells: BTreeMap<String, String>,
    targets: BTreeMap<String, ManifestTarget>,
}

/// Parses target patterns and lowers rules from the repo manifest.
pub struct ManifestProvider {
    repo_root: PathBuf,
    manifest: ManifestFile,
}

impl ManifestProvider {
    pub fn load(repo_root: &Path) -> Result<Self, GraphError> {
        let path = repo_root.join(MANIFEST_RELATIVE_PATH);
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            GraphError::Parse(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let manifest: ManifestFile = serde_json::from_str(&raw).map_err(|e| {
            GraphError::Parse(format!("malformed manifest {}: {e}", path.display()))
        })?;
        Ok(Self {
            repo_root: repo_root.to_path_buf(),
            manifest,
        })
    }

    #[cfg(test)]
    fn from_parts(repo_root: &Path, json: &str) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            manifest: serde_json::from_str(json).expect("valid manifest json"),
        }
    }

    /// Cell name → absolute root, for seeding the cell indexer. The
    /// root cell is the repo root itself.
    pub fn cells(&self) -> BTreeMap<String, PathBuf> {
        self.manifest
            .cells
            .iter()
            .map(|(name, root)| {
                let path = PathBuf::from(root);
                let absolute = if path.is_absolute() {
                    path
                } else {
                    self.repo_root.join(path)
                };
                (name.clone(), absolute)
            })
            .collect()
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn cell_root_for(&self, target: &BuildTarget) -> PathBuf {
        let cell = target.cell_name();
        if cell.is_empty() {
            return self.repo_root.clone();
        }
        self.cells()
            .get(cell)
            .cloned()
            .unwrap_or_else(|| self.repo_root.clone())
    }

    /// Expand one pattern: an exact target, or a recursive `//path/...`
    /// wildcard over everything beneath that path.
    fn expand_pattern(&self, pattern: &str) -> Result<Vec<String>, GraphError> {
        if let Some(raw) = pattern.strip_suffix("...") {
            // `//lib/...` covers `//lib:core` and `//lib/sub:x`; a bare
            // `//...` covers the whole repo.
            let base = raw.trim_end_matches('/').to_string();
            let matches: Vec<String> = self
                .manifest
                .targets
                .keys()
                .filter(|name| {
                    base.is_empty()
                        || name.starts_with(&format!("{base}:"))
                        || name.starts_with(&format!("{base}/"))
                })
                .cloned()
                .collect();
            if matches.is_empty() {
                return Err(GraphError::Parse(format!(
                    "no targets match pattern {pattern}"
                )));
            }
            return Ok(matches);
        }
        if self.manifest.targets.contains_key(pattern) {
            Ok(vec![pattern.to_string()])
        } else {
            Err(GraphError::Parse(format!("unknown target {pattern}")))
        }
    }

    fn node_for(&self, name: &str) -> Result<TargetNode, GraphError> {
        let spec = self
            .manifest
            .targets
            .get(name)
            .ok_or_else(|| GraphError::Parse(format!("unknown target {name}")))?;
        let target = BuildTarget::new(name);
        Ok(TargetNode {
            cell_root: self.cell_root_for(&target),
            raw_attributes: serde_json::json!({
                "type": spec.rule_type,
                "inputs": spec.inputs,
                "outputs": spec.outputs,
                "cacheable": spec.cacheable,
                "cmd": spec.cmd,
                "fields": spec.fields,
            }),
            deps: spec.deps.iter().map(BuildTarget::new).collect(),
            target,
        })
    }
}

impl TargetGraphProvider for ManifestProvider {
    fn unversioned_target_graph(
        &self,
        patterns: &[String],
    ) -> Result<TargetGraphAndTargets, GraphError> {
        let mut top_level: BTreeSet<BuildTarget> = BTreeSet::new();
        for pattern in patterns {
            for name in self.expand_pattern(pattern)? {
                top_level.insert(BuildTarget::new(name));
            }
        }

        // Nodes for the transitive closure of the requested targets.
        let mut nodes: BTreeMap<BuildTarget, TargetNode> = BTreeMap::new();
        let mut stack: Vec<BuildTarget> = top_level.iter().cloned().collect();
        while let Some(target) = stack.pop() {
            if nodes.contains_key(&target) {
                continue;
            }
            let node = self.node_for(target.as_str())?;
            stack.extend(node.deps.iter().cloned());
            nodes.insert(target, node);
        }

        Ok(TargetGraphAndTargets {
            graph: TargetGraph::new(nodes.into_values()),
            targets: top_level,
        })
    }
}

impl ActionGraphProvider for ManifestProvider {
    fn action_graph(&self, graph: &TargetGraphAndTargets) -> Result<ActionGraph, GraphError> {
        let mut rules = Vec::new();
        for node in graph.graph.nodes() {
            let spec = self
                .manifest
                .targets
                .get(node.target.as_str())
                .ok_or_else(|| GraphError::Parse(format!("unknown target {}", node.target)))?;
            let mut fields = spec.fields.clone();
            if let Some(cmd) = &spec.cmd {
                fields.insert("cmd".to_string(), cmd.clone());
            }
            rules.push(BuildRule {
                target: node.target.clone(),
                rule_type: spec.rule_type.clone(),
                cell_root: node.cell_root.clone(),
                inputs: spec
                    .inputs
                    .iter()
                    .map(|p| node.cell_root.join(p))
                    .collect(),
                deps: node.deps.clone(),
                outputs: spec.outputs.iter().map(PathBuf::from).collect(),
                cacheable: spec.cacheable,
                fields,
            });
        }
        Ok(ActionGraph::new(rules))
    }
}
