//! Rule-key computation.
//!
//! Every rule in the action graph gets a deterministic content digest:
//! blake3 over the key seed, the rule's identity fields, the recorded
//! hash of every input file, and the rule's dependency names. Input
//! paths enter the digest cell-relative with forward slashes, so two
//! hosts with different checkout locations produce identical keys.

use crate::cells::{CellError, CellIndexer};
use crate::hash_cache::{FileHashLoader, HashCacheError};
use stampede_common::graph::{ActionGraph, BuildRule};
use stampede_common::paths;
use stampede_common::types::{BuildTarget, CellIndex, RuleKey};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;

#[derive(Debug, thiserror::Error)]
pub enum RuleKeyError {
    #[error(transparent)]
    Cell(#[from] CellError),
    #[error(transparent)]
    Hash(#[from] HashCacheError),
    #[error("rule key worker failed: {0}")]
    Worker(String),
    #[error("failed to write rule key log: {0}")]
    Log(#[from] std::io::Error),
}

/// Builds keys for rules of a single cell.
pub struct RuleKeyFactory {
    seed: u64,
    cell_root: PathBuf,
    cache: Arc<dyn FileHashLoader>,
}

impl RuleKeyFactory {
    fn new(seed: u64, cell_root: PathBuf, cache: Arc<dyn FileHashLoader>) -> Self {
        Self {
            seed,
            cell_root,
            cache,
        }
    }

    pub fn build(&self, rule: &BuildRule) -> Result<RuleKey, RuleKeyError> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        field(&mut hasher, b"target", rule.target.as_str().as_bytes());
        field(&mut hasher, b"rule_type", rule.rule_type.as_bytes());

        for (name, value) in &rule.fields {
            field(&mut hasher, name.as_bytes(), value.as_bytes());
        }

        let mut inputs = rule.inputs.clone();
        inputs.sort();
        for input in &inputs {
            let hash = self.cache.hash_file(input)?;
            field(&mut hasher, b"input", self.key_path(input).as_bytes());
            hasher.update(hash.as_bytes());
        }

        let mut deps: Vec<&BuildTarget> = rule.deps.iter().collect();
        deps.sort();
        for dep in deps {
            field(&mut hasher, b"dep", dep.as_str().as_bytes());
        }

        Ok(RuleKey::from_bytes(*hasher.finalize().as_bytes()))
    }

    fn key_path(&self, input: &Path) -> String {
        match paths::strip_root(&self.cell_root, input) {
            Some(rel) => paths::to_wire(&rel),
            None => paths::to_wire(input),
        }
    }
}

fn field(hasher: &mut blake3::Hasher, tag: &[u8], value: &[u8]) {
    hasher.update(tag);
    hasher.update(&[0]);
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value);
}

/// Length-prefixed binary log of computed rule keys
/// (`--rulekeys-log-path`). Record: u16 LE target length, target bytes,
/// 32 raw key bytes.
pub struct RuleKeyLogger {
    file: Mutex<std::fs::File>,
}

impl RuleKeyLogger {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: Mutex::new(std::fs::File::create(path)?),
        })
    }

    pub fn log(&self, target: &BuildTarget, key: &RuleKey) -> std::io::Result<()> {
        let name = target.as_str().as_bytes();
        let len = name.len().min(u16::MAX as usize) as u16;
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        file.write_all(&len.to_le_bytes())?;
        file.write_all(&name[..len as usize])?;
        file.write_all(key.as_bytes())?;
        Ok(())
    }
}

/// Computes the key of every rule in an action graph on a shared worker
/// pool, one lazily-built factory per cell.
pub struct RuleKeyComputer {
    seed: u64,
    cells: Arc<CellIndexer>,
    cache: Arc<dyn FileHashLoader>,
    factories: Mutex<HashMap<CellIndex, Arc<RuleKeyFactory>>>,
    logger: Option<Arc<RuleKeyLogger>>,
}

impl RuleKeyComputer {
    pub fn new(
        seed: u64,
        cells: Arc<CellIndexer>,
        cache: Arc<dyn FileHashLoader>,
        logger: Option<Arc<RuleKeyLogger>>,
    ) -> Self {
        Self {
            seed,
            cells,
            cache,
            factories: Mutex::new(HashMap::new()),
            logger,
        }
    }

    fn factory_for(&self, cell_root: &Path) -> Result<Arc<RuleKeyFactory>, RuleKeyError> {
        let index = self.cells.index_of(cell_root)?;
        let mut factories = self.factories.lock().unwrap_or_else(|e| e.into_inner());
        let factory = factories.entry(index).or_insert_with(|| {
            Arc::new(RuleKeyFactory::new(
                self.seed,
                cell_root.to_path_buf(),
                Arc::clone(&self.cache),
            ))
        });
        Ok(Arc::clone(factory))
    }

    /// Compute all keys. A single rule failure aborts the batch and
    /// discards partial results.
    pub async fn compute(
        &self,
        graph: &ActionGraph,
    ) -> Result<BTreeMap<BuildTarget, RuleKey>, RuleKeyError> {
        let mut workers: JoinSet<Result<(BuildTarget, RuleKey), RuleKeyError>> = JoinSet::new();
        for rule in graph.rules() {
            let factory = self.factory_for(&rule.cell_root)?;
            let rule = rule.clone();
            workers.spawn_blocking(move || {
                let key = factory.build(&rule)?;
                Ok((rule.target, key))
            });
        }

        let mut keys = BTreeMap::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok((target, key))) => {
                    if let Some(logger) = &self.logger {
                        logger.log(&target, &key)?;
                    }
                    keys.insert(target, key);
                }
                Ok(Err(err)) => {
                    workers.abort_all();
                    return Err(err);
                }
                Err(join_err) => {
                    workers.abort_all();
                    return Err(RuleKeyError::Worker(join_err.to_string()));
                }
            }
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cells::KnownCell;
    use crate::hash_cache::{FileHashRecorder, RecordingHashCache};
    use stampede_common::types::FileHash;

    struct FixedLoader(FileHash);

    impl FileHashLoader for FixedLoader {
        fn hash_file(&self, _path: &Path) -> Result<FileHash, HashCacheError> {
            Ok(self.0)
        }

        fn hash_archive_member(
            &self,
            _archive: &Path,
            _member: &Path,
        ) -> Result<FileHash, HashCacheError> {
            Ok(self.0)
        }
    }

    struct FailingLoader;

    impl FileHashLoader for FailingLoader {
        fn hash_file(&self, path: &Path) -> Result<FileHash, HashCacheError> {
            Err(HashCacheError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            })
        }

        fn hash_archive_member(
            &self,
            archive: &Path,
            _member: &Path,
        ) -> Result<FileHash, HashCacheError> {
            self.hash_file(archive)
        }
    }

    fn cells() -> Arc<CellIndexer> {
        Arc::new(CellIndexer::new(
            KnownCell {
                root: PathBuf::from("/repo"),
                name: String::new(),
                config_overrides: BTreeMap::new(),
            },
            vec![],
        ))
    }

    fn rule(name: &str, inputs: &[&str], deps: &[&str]) -> BuildRule {
        BuildRule {
            target: BuildTarget::new(name),
            rule_type: "cc_binary".to_string(),
            cell_root: PathBuf::from("/repo"),
            inputs: inputs.iter().map(PathBuf::from).collect(),
            deps: deps.iter().map(|d| BuildTarget::new(*d)).collect(),
            outputs: vec![],
            cacheable: true,
            fields: BTreeMap::new(),
        }
    }

    fn computer(loader: Arc<dyn FileHashLoader>) -> RuleKeyComputer {
        RuleKeyComputer::new(0, cells(), loader, None)
    }

    #[tokio::test]
    async fn test_identical_inputs_yield_identical_keys() {
        let loader: Arc<dyn FileHashLoader> = Arc::new(FixedLoader(FileHash::from_bytes(
            [0xaa; 32],
        )));
        let graph = ActionGraph::new([rule("//foo:bar", &["/repo/src/a.c"], &[])]);

        let first = computer(Arc::clone(&loader)).compute(&graph).await.unwrap();
        let second = computer(loader).compute(&graph).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_key_depends_on_file_hash() {
        let graph = ActionGraph::new([rule("//foo:bar", &["/repo/src/a.c"], &[])]);

        let with_aa = computer(Arc::new(FixedLoader(FileHash::from_bytes([0xaa; 32]))))
            .compute(&graph)
            .await
            .unwrap();
        let with_bb = computer(Arc::new(FixedLoader(FileHash::from_bytes([0xbb; 32]))))
            .compute(&graph)
            .await
            .unwrap();
        assert_ne!(
            with_aa[&BuildTarget::new("//foo:bar")],
            with_bb[&BuildTarget::new("//foo:bar")]
        );
    }

    #[tokio::test]
    async fn test_key_depends_on_seed() {
        let graph = ActionGraph::new([rule("//foo:bar", &[], &[])]);
        let loader: Arc<dyn FileHashLoader> =
            Arc::new(FixedLoader(FileHash::from_bytes([0xaa; 32])));

        let seed0 = RuleKeyComputer::new(0, cells(), Arc::clone(&loader), None)
            .compute(&graph)
            .await
            .unwrap();
        let seed1 = RuleKeyComputer::new(1, cells(), loader, None)
            .compute(&graph)
            .await
            .unwrap();
        assert_ne!(
            seed0[&BuildTarget::new("//foo:bar")],
            seed1[&BuildTarget::new("//foo:bar")]
        );
    }

    #[tokio::test]
    async fn test_input_order_does_not_change_the_key() {
        let loader: Arc<dyn FileHashLoader> =
            Arc::new(FixedLoader(FileHash::from_bytes([0xaa; 32])));
        let forward = ActionGraph::new([rule(
            "//foo:bar",
            &["/repo/a.c", "/repo/b.c"],
            &["//d:1", "//d:2"],
        )]);
        let reversed = ActionGraph::new([rule(
            "//foo:bar",
            &["/repo/b.c", "/repo/a.c"],
            &["//d:2", "//d:1"],
        )]);

        let first = computer(Arc::clone(&loader)).compute(&forward).await.unwrap();
        let second = computer(loader).compute(&reversed).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_recorded_hash_set_is_order_independent() {
        // Permute computation order; the serialized hash tables must
        // contain exactly the same (cell, path, hash) triples.
        let rules = vec![
            rule("//a:a", &["/repo/a.c", "/repo/shared.h"], &[]),
            rule("//b:b", &["/repo/b.c", "/repo/shared.h"], &[]),
            rule("//c:c", &["/repo/c.c"], &[]),
        ];

        let mut snapshots = Vec::new();
        for graph_rules in [rules.clone(), rules.iter().rev().cloned().collect()] {
            let recorder = Arc::new(FileHashRecorder::new(cells()));
            let recording = Arc::new(RecordingHashCache::new(
                Arc::new(FixedLoader(FileHash::from_bytes([0xcc; 32]))),
                Arc::clone(&recorder),
            ));
            let computer = RuleKeyComputer::new(0, cells(), recording, None);
            computer
                .compute(&ActionGraph::new(graph_rules))
                .await
                .unwrap();

            let mut triples: Vec<(u32, String, String)> = recorder
                .snapshot()
                .iter()
                .flat_map(|cell| {
                    cell.entries
                        .iter()
                        .map(|e| (cell.cell_index, e.path.clone(), e.hash.to_hex()))
                        .collect::<Vec<_>>()
                })
                .collect();
            triples.sort();
            snapshots.push(triples);
        }
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(snapshots[0].len(), 4);
    }

    #[tokio::test]
    async fn test_single_failure_discards_all_results() {
        let graph = ActionGraph::new([
            rule("//ok:1", &[], &[]),
            rule("//bad:1", &["/repo/missing.c"], &[]),
        ]);
        let result = computer(Arc::new(FailingLoader)).compute(&graph).await;
        assert!(matches!(result, Err(RuleKeyError::Hash(_))));
    }

    #[tokio::test]
    async fn test_rule_key_logger_writes_records() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("keys.bin");
        let logger = Arc::new(RuleKeyLogger::create(&log_path).unwrap());

        let loader: Arc<dyn FileHashLoader> =
            Arc::new(FixedLoader(FileHash::from_bytes([0xaa; 32])));
        let graph = ActionGraph::new([rule("//foo:bar", &[], &[])]);
        let keys = RuleKeyComputer::new(0, cells(), loader, Some(logger))
            .compute(&graph)
            .await
            .unwrap();

        let bytes = std::fs::read(&log_path).unwrap();
        let name = "//foo:bar".as_bytes();
        assert_eq!(bytes.len(), 2 + name.len() + 32);
        assert_eq!(u16::from_le_bytes([bytes[0], bytes[1]]) as usize, name.len());
        assert_eq!(&bytes[2..2 + name.len()], name);
        assert_eq!(
            &bytes[2 + name.len()..],
            keys[&BuildTarget::new("//foo:bar")].as_bytes()
        );
    }
}
