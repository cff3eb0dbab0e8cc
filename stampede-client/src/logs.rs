//! Build-slave log materialization.
//!
//! The coordinator exposes per-run-id log streams; this component copies
//! newly-available streams into the local log directory as the remote
//! build progresses. Materialization failures are logged and never fail
//! the build.

use crate::service::{CoordinatorService, ServiceError};
use stampede_common::protocol::RemoteLogBatch;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const FINAL_FETCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Copies remote log streams under `<log_dir>/remote/<run_id>/`.
pub struct LogMaterializer {
    service: Arc<dyn CoordinatorService>,
    log_dir: PathBuf,
    max_wait_for_logs: Duration,
    materialized: Mutex<BTreeSet<String>>,
}

impl LogMaterializer {
    pub fn new(
        service: Arc<dyn CoordinatorService>,
        log_dir: PathBuf,
        max_wait_for_logs: Duration,
    ) -> Self {
        Self {
            service,
            log_dir,
            max_wait_for_logs,
            materialized: Mutex::new(BTreeSet::new()),
        }
    }

    /// Fetch and write every run id not materialized yet. Returns the
    /// number of streams written; failures are non-fatal.
    pub async fn materialize_new(&self, run_ids: &[String]) -> usize {
        let pending: Vec<String> = {
            let seen = self.materialized.lock().unwrap_or_else(|e| e.into_inner());
            run_ids
                .iter()
                .filter(|id| !seen.contains(*id))
                .cloned()
                .collect()
        };
        if pending.is_empty() {
            return 0;
        }

        let batches = match self.service.fetch_logs(&pending).await {
            Ok(batches) => batches,
            Err(err) => {
                warn!("failed to fetch build slave logs: {err}");
                return 0;
            }
        };

        let mut written = 0;
        for batch in batches {
            match self.write_batch(&batch) {
                Ok(()) => {
                    self.materialized
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(batch.run_id.clone());
                    written += 1;
                }
                Err(err) => warn!("failed to materialize logs for {}: {err}", batch.run_id),
            }
        }
        written
    }

    /// After the remote build finishes, keep polling for any streams
    /// still missing, bounded by the configured wait.
    pub async fn wait_for_remaining(&self, expected: &[String]) -> Result<(), ServiceError> {
        let deadline = Instant::now() + self.max_wait_for_logs;
        loop {
            self.materialize_new(expected).await;
            let missing = {
                let seen = self.materialized.lock().unwrap_or_else(|e| e.into_inner());
                expected.iter().filter(|id| !seen.contains(*id)).count()
            };
            if missing == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                debug!("gave up waiting for {missing} build slave log stream(s)");
                return Ok(());
            }
            tokio::time::sleep(FINAL_FETCH_POLL_INTERVAL.min(self.max_wait_for_logs)).await;
        }
    }

    pub fn materialized_run_ids(&self) -> Vec<String> {
        self.materialized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn write_batch(&self, batch: &RemoteLogBatch) -> std::io::Result<()> {
        let dir = self.run_dir(&batch.run_id);
        std::fs::create_dir_all(&dir)?;
        for file in &batch.files {
            std::fs::write(dir.join(&file.name), &file.contents)?;
        }
        Ok(())
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.log_dir.join("remote").join(run_id)
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
