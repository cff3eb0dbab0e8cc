//! Target-graph and action-graph model.
//!
//! Target-pattern parsing and action-graph lowering live behind the
//! provider traits at the bottom of this module; the client only consumes
//! their results.

use crate::types::BuildTarget;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::PathBuf;

/// A parsed, pre-versioning target-graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetNode {
    pub target: BuildTarget,
    /// Absolute root of the cell that owns this node.
    pub cell_root: PathBuf,
    /// Raw node attributes as produced by the parser, before any version
    /// resolution. The coordinator re-parses these remotely.
    pub raw_attributes: serde_json::Value,
    pub deps: Vec<BuildTarget>,
}

/// DAG of parsed target nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetGraph {
    nodes: BTreeMap<BuildTarget, TargetNode>,
}

impl TargetGraph {
    pub fn new(nodes: impl IntoIterator<Item = TargetNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.target.clone(), n)).collect(),
        }
    }

    pub fn get(&self, target: &BuildTarget) -> Option<&TargetNode> {
        self.nodes.get(target)
    }

    pub fn contains(&self, target: &BuildTarget) -> bool {
        self.nodes.contains_key(target)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TargetNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// A target graph together with the top-level targets the user asked for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetGraphAndTargets {
    pub graph: TargetGraph,
    pub targets: BTreeSet<BuildTarget>,
}

/// One executable rule lowered from a target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRule {
    pub target: BuildTarget,
    pub rule_type: String,
    /// Absolute root of the owning cell; rules carry their cell rather
    /// than a back-pointer into filesystem state.
    pub cell_root: PathBuf,
    /// Absolute paths of the input files whose hashes feed the rule key.
    pub inputs: Vec<PathBuf>,
    pub deps: Vec<BuildTarget>,
    /// Outputs relative to the output root.
    pub outputs: Vec<PathBuf>,
    /// Whether the remote cache may serve this rule's outputs.
    pub cacheable: bool,
    /// Key-affecting rule attributes (flags, env, toolchain pins).
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl BuildRule {
    /// `--out` only works for rules with exactly one file output.
    pub fn output_file_can_be_copied(&self) -> bool {
        self.outputs.len() == 1
    }

    pub fn primary_output(&self) -> Option<&PathBuf> {
        self.outputs.first()
    }
}

/// DAG of executable build rules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionGraph {
    rules: BTreeMap<BuildTarget, BuildRule>,
}

impl ActionGraph {
    pub fn new(rules: impl IntoIterator<Item = BuildRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.target.clone(), r)).collect(),
        }
    }

    pub fn get(&self, target: &BuildTarget) -> Option<&BuildRule> {
        self.rules.get(target)
    }

    pub fn contains(&self, target: &BuildTarget) -> bool {
        self.rules.contains_key(target)
    }

    pub fn rules(&self) -> impl Iterator<Item = &BuildRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Dependency-first order over the transitive closure of `roots`
    /// (or the whole graph when `roots` is empty).
    pub fn topo_order(&self, roots: &[BuildTarget]) -> Result<Vec<BuildTarget>, GraphError> {
        let in_scope: BTreeSet<BuildTarget> = if roots.is_empty() {
            self.rules.keys().cloned().collect()
        } else {
            self.closure_of(roots)?
        };

        let mut indegree: BTreeMap<&BuildTarget, usize> = BTreeMap::new();
        let mut rdeps: BTreeMap<&BuildTarget, Vec<&BuildTarget>> = BTreeMap::new();
        for target in &in_scope {
            let rule = self.require(target)?;
            let mut degree = 0;
            for dep in &rule.deps {
                if in_scope.contains(dep) {
                    degree += 1;
                    rdeps.entry(dep).or_default().push(target);
                }
            }
            indegree.insert(target, degree);
        }

        let mut queue: VecDeque<&BuildTarget> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(t, _)| *t)
            .collect();
        let mut order = Vec::with_capacity(in_scope.len());
        while let Some(target) = queue.pop_front() {
            order.push(target.clone());
            for rdep in rdeps.get(target).into_iter().flatten() {
                if let Some(slot) = indegree.get_mut(*rdep) {
                    *slot -= 1;
                    if *slot == 0 {
                        queue.push_back(*rdep);
                    }
                }
            }
        }

        if order.len() != in_scope.len() {
            let stuck = indegree
                .iter()
                .find(|(_, d)| **d > 0)
                .map(|(t, _)| t.to_string())
                .unwrap_or_default();
            return Err(GraphError::Cycle { near: stuck });
        }
        Ok(order)
    }

    fn closure_of(&self, roots: &[BuildTarget]) -> Result<BTreeSet<BuildTarget>, GraphError> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&BuildTarget> = roots.iter().collect();
        while let Some(target) = stack.pop() {
            if !seen.insert(target.clone()) {
                continue;
            }
            let rule = self.require(target)?;
            stack.extend(rule.deps.iter());
        }
        Ok(seen)
    }

    fn require(&self, target: &BuildTarget) -> Result<&BuildRule, GraphError> {
        self.rules.get(target).ok_or_else(|| GraphError::UnknownTarget {
            target: target.to_string(),
        })
    }
}

/// Errors surfaced while constructing or traversing graphs.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("{0}")]
    Parse(String),
    #[error("version resolution failed: {0}")]
    Version(String),
    #[error("unknown target: {target}")]
    UnknownTarget { target: String },
    #[error("dependency cycle near {near}")]
    Cycle { near: String },
}

/// Produces target graphs from user-supplied target patterns.
pub trait TargetGraphProvider: Send + Sync {
    fn unversioned_target_graph(
        &self,
        patterns: &[String],
    ) -> Result<TargetGraphAndTargets, GraphError>;

    /// Resolve versioned dependencies, when the build configures it.
    /// Providers without a version universe report `None`.
    fn versioned_target_graph(
        &self,
        _unversioned: &TargetGraphAndTargets,
    ) -> Result<Option<TargetGraphAndTargets>, GraphError> {
        Ok(None)
    }
}

/// Lowers a target graph into an action graph of build rules.
pub trait ActionGraphProvider: Send + Sync {
    fn action_graph(&self, graph: &TargetGraphAndTargets) -> Result<ActionGraph, GraphError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str, deps: &[&str]) -> BuildRule {
        BuildRule {
            target: BuildTarget::new(name),
            rule_type: "test_rule".to_string(),
            cell_root: PathBuf::from("/repo"),
            inputs: vec![],
            deps: deps.iter().map(|d| BuildTarget::new(*d)).collect(),
            outputs: vec![],
            cacheable: true,
            fields: BTreeMap::new(),
        }
    }

    #[test]
    fn test_topo_order_puts_deps_first() {
        let graph = ActionGraph::new([
            rule("//a:a", &["//b:b", "//c:c"]),
            rule("//b:b", &["//c:c"]),
            rule("//c:c", &[]),
        ]);
        let order = graph.topo_order(&[]).unwrap();
        let pos = |t: &str| {
            order
                .iter()
                .position(|x| x.as_str() == t)
                .expect("target in order")
        };
        assert!(pos("//c:c") < pos("//b:b"));
        assert!(pos("//b:b") < pos("//a:a"));
    }

    #[test]
    fn test_topo_order_restricted_to_closure() {
        let graph = ActionGraph::new([
            rule("//a:a", &["//b:b"]),
            rule("//b:b", &[]),
            rule("//orphan:x", &[]),
        ]);
        let order = graph.topo_order(&[BuildTarget::new("//a:a")]).unwrap();
        assert_eq!(order.len(), 2);
        assert!(!order.iter().any(|t| t.as_str() == "//orphan:x"));
    }

    #[test]
    fn test_topo_order_detects_cycle() {
        let graph = ActionGraph::new([rule("//a:a", &["//b:b"]), rule("//b:b", &["//a:a"])]);
        assert!(matches!(
            graph.topo_order(&[]),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_unknown_dep_is_an_error() {
        let graph = ActionGraph::new([rule("//a:a", &["//missing:x"])]);
        assert!(matches!(
            graph.topo_order(&[]),
            Err(GraphError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_output_file_can_be_copied() {
        let mut r = rule("//a:a", &[]);
        assert!(!r.output_file_can_be_copied());
        r.outputs.push(PathBuf::from("a.out"));
        assert!(r.output_file_can_be_copied());
        r.outputs.push(PathBuf::from("a.map"));
        assert!(!r.output_file_can_be_copied());
    }
}
