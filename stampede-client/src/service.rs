//! Coordinator service client.
//!
//! The wire transport is newline-delimited JSON over TCP: one request
//! line, one response line, one connection per call. The trait keeps the
//! transport swappable; tests script a deterministic in-memory
//! implementation.

use crate::retry::RetryableError;
use async_trait::async_trait;
use stampede_common::protocol::{
    BuildStatus, CoordinatorRequest, CoordinatorResponse, JobState, RemoteLogBatch,
    RuleKeyLogEntry,
};
use stampede_common::types::{DistBuildMode, RuleKey, StampedeId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("coordinator i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("coordinator protocol error: {0}")]
    Protocol(String),
    #[error("coordinator rejected request: {0}")]
    Rejected(String),
    #[error("remote build exceeded the configured deadline")]
    DeadlineExceeded,
}

impl RetryableError for ServiceError {
    fn is_retryable(&self) -> bool {
        // Transport hiccups retry; a rejection or a blown deadline will
        // not improve on its own.
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}

/// Logical operations of the remote coordinator.
#[async_trait]
pub trait CoordinatorService: Send + Sync {
    async fn start_build(
        &self,
        job: &JobState,
        mode: DistBuildMode,
        minions: u32,
        repository: &str,
        tenant: &str,
    ) -> Result<StampedeId, ServiceError>;

    async fn fetch_status(&self, stampede_id: &StampedeId) -> Result<BuildStatus, ServiceError>;

    async fn fetch_logs(&self, run_ids: &[String]) -> Result<Vec<RemoteLogBatch>, ServiceError>;

    async fn fetch_rule_key_logs(
        &self,
        rule_keys: &[RuleKey],
    ) -> Result<Vec<RuleKeyLogEntry>, ServiceError>;
}

/// TCP client speaking the newline-delimited JSON protocol.
pub struct JsonLineClient {
    address: String,
}

impl JsonLineClient {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    async fn round_trip(
        &self,
        request: &CoordinatorRequest,
    ) -> Result<CoordinatorResponse, ServiceError> {
        let stream = TcpStream::connect(&self.address).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(request)
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;
        write_half.shutdown().await?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        let read = reader.read_line(&mut response_line).await?;
        if read == 0 {
            return Err(ServiceError::Protocol(
                "coordinator closed the connection without a response".to_string(),
            ));
        }
        let response: CoordinatorResponse = serde_json::from_str(response_line.trim_end())
            .map_err(|e| ServiceError::Protocol(e.to_string()))?;
        if let CoordinatorResponse::Error { message } = response {
            return Err(ServiceError::Rejected(message));
        }
        Ok(response)
    }
}

#[async_trait]
impl CoordinatorService for JsonLineClient {
    async fn start_build(
        &self,
        job: &JobState,
        mode: DistBuildMode,
        minions: u32,
        repository: &str,
        tenant: &str,
    ) -> Result<StampedeId, ServiceError> {
        let request = CoordinatorRequest::StartBuild {
            job: Box::new(job.clone()),
            mode,
            minions,
            repository: repository.to_string(),
            tenant: tenant.to_string(),
        };
        match self.round_trip(&request).await? {
            CoordinatorResponse::Started { stampede_id } => Ok(stampede_id),
            other => Err(ServiceError::Protocol(format!(
                "unexpected response to start_build: {other:?}"
            ))),
        }
    }

    async fn fetch_status(&self, stampede_id: &StampedeId) -> Result<BuildStatus, ServiceError> {
        let request = CoordinatorRequest::FetchStatus {
            stampede_id: stampede_id.clone(),
        };
        match self.round_trip(&request).await? {
            CoordinatorResponse::Status { status } => Ok(status),
            other => Err(ServiceError::Protocol(format!(
                "unexpected response to fetch_status: {other:?}"
            ))),
        }
    }

    async fn fetch_logs(&self, run_ids: &[String]) -> Result<Vec<RemoteLogBatch>, ServiceError> {
        let request = CoordinatorRequest::FetchLogs {
            run_ids: run_ids.to_vec(),
        };
        match self.round_trip(&request).await? {
            CoordinatorResponse::Logs { batches } => Ok(batches),
            other => Err(ServiceError::Protocol(format!(
                "unexpected response to fetch_logs: {other:?}"
            ))),
        }
    }

    async fn fetch_rule_key_logs(
        &self,
        rule_keys: &[RuleKey],
    ) -> Result<Vec<RuleKeyLogEntry>, ServiceError> {
        let request = CoordinatorRequest::FetchRuleKeyLogs {
            rule_keys: rule_keys.to_vec(),
        };
        match self.round_trip(&request).await? {
            CoordinatorResponse::RuleKeyLogs { entries } => Ok(entries),
            other => Err(ServiceError::Protocol(format!(
                "unexpected response to fetch_rule_key_logs: {other:?}"
            ))),
        }
    }
}

/// Deterministic in-memory coordinator for tests: plays back a scripted
/// sequence of statuses and can inject transient failures.
pub mod scripted {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct ScriptedCoordinator {
        stampede_id: String,
        statuses: Mutex<VecDeque<BuildStatus>>,
        last_status: Mutex<Option<BuildStatus>>,
        logs: Mutex<HashMap<String, RemoteLogBatch>>,
        rule_key_logs: Mutex<Vec<RuleKeyLogEntry>>,
        start_failures: AtomicU32,
        status_failures: AtomicU32,
        pub started: AtomicU32,
        pub status_calls: AtomicU32,
        pub log_calls: AtomicU32,
    }

    impl ScriptedCoordinator {
        pub fn new(stampede_id: impl Into<String>) -> Self {
            Self {
                stampede_id: stampede_id.into(),
                ..Self::default()
            }
        }

        /// Append a status snapshot; the final one is replayed forever.
        pub fn push_status(&self, status: BuildStatus) -> &Self {
            self.statuses
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(status);
            self
        }

        pub fn add_log_batch(&self, batch: RemoteLogBatch) -> &Self {
            self.logs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(batch.run_id.clone(), batch);
            self
        }

        pub fn add_rule_key_log(&self, entry: RuleKeyLogEntry) -> &Self {
            self.rule_key_logs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(entry);
            self
        }

        /// Fail the next `n` start_build calls with a transient error.
        pub fn fail_starts(&self, n: u32) -> &Self {
            self.start_failures.store(n, Ordering::SeqCst);
            self
        }

        /// Fail the next `n` fetch_status calls with a transient error.
        pub fn fail_statuses(&self, n: u32) -> &Self {
            self.status_failures.store(n, Ordering::SeqCst);
            self
        }

        fn transient() -> ServiceError {
            ServiceError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "scripted transient failure",
            ))
        }

        fn take_failure(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl CoordinatorService for ScriptedCoordinator {
        async fn start_build(
            &self,
            _job: &JobState,
            _mode: DistBuildMode,
            _minions: u32,
            _repository: &str,
            _tenant: &str,
        ) -> Result<StampedeId, ServiceError> {
            if Self::take_failure(&self.start_failures) {
                return Err(Self::transient());
            }
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(StampedeId::new(self.stampede_id.clone()))
        }

        async fn fetch_status(
            &self,
            _stampede_id: &StampedeId,
        ) -> Result<BuildStatus, ServiceError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.status_failures) {
                return Err(Self::transient());
            }
            let mut queue = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
            let mut last = self.last_status.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(next) = queue.pop_front() {
                *last = Some(next.clone());
                return Ok(next);
            }
            last.clone().ok_or_else(|| {
                ServiceError::Protocol("scripted coordinator has no statuses".to_string())
            })
        }

        async fn fetch_logs(
            &self,
            run_ids: &[String],
        ) -> Result<Vec<RemoteLogBatch>, ServiceError> {
            self.log_calls.fetch_add(1, Ordering::SeqCst);
            let logs = self.logs.lock().unwrap_or_else(|e| e.into_inner());
            Ok(run_ids
                .iter()
                .filter_map(|id| logs.get(id).cloned())
                .collect())
        }

        async fn fetch_rule_key_logs(
            &self,
            rule_keys: &[RuleKey],
        ) -> Result<Vec<RuleKeyLogEntry>, ServiceError> {
            let entries = self.rule_key_logs.lock().unwrap_or_else(|e| e.into_inner());
            Ok(entries
                .iter()
                .filter(|e| rule_keys.contains(&e.rule_key))
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedCoordinator;
    use super::*;
    use stampede_common::protocol::{ClientVersion, RemoteBuildState};
    use std::sync::atomic::Ordering;

    fn empty_job() -> JobState {
        JobState {
            schema_version: stampede_common::protocol::JOB_STATE_SCHEMA_VERSION,
            cells: vec![],
            target_graph_nodes: vec![],
            top_level_targets: vec![],
            file_hashes: vec![],
            client_version: ClientVersion::Git("test".into()),
        }
    }

    fn status(state: RemoteBuildState) -> BuildStatus {
        BuildStatus {
            stampede_id: StampedeId::new("s-1"),
            state,
            finished_rules: vec![],
            log_run_ids: vec![],
            exit_code: None,
        }
    }

    #[test]
    fn test_io_and_protocol_errors_are_retryable() {
        let io = ServiceError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "t"));
        assert!(io.is_retryable());
        assert!(ServiceError::Protocol("p".into()).is_retryable());
        assert!(!ServiceError::Rejected("r".into()).is_retryable());
        assert!(!ServiceError::DeadlineExceeded.is_retryable());
    }

    #[tokio::test]
    async fn test_scripted_replays_statuses_then_repeats_last() {
        let coordinator = ScriptedCoordinator::new("s-1");
        coordinator.push_status(status(RemoteBuildState::Building));
        coordinator.push_status(status(RemoteBuildState::FinishedOk));

        let id = StampedeId::new("s-1");
        assert_eq!(
            coordinator.fetch_status(&id).await.unwrap().state,
            RemoteBuildState::Building
        );
        assert_eq!(
            coordinator.fetch_status(&id).await.unwrap().state,
            RemoteBuildState::FinishedOk
        );
        assert_eq!(
            coordinator.fetch_status(&id).await.unwrap().state,
            RemoteBuildState::FinishedOk
        );
    }

    #[tokio::test]
    async fn test_scripted_injects_transient_start_failures() {
        let coordinator = ScriptedCoordinator::new("s-2");
        coordinator.fail_starts(2);

        let job = empty_job();
        for _ in 0..2 {
            let err = coordinator
                .start_build(&job, DistBuildMode::RemoteBuild, 1, "", "")
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        let id = coordinator
            .start_build(&job, DistBuildMode::RemoteBuild, 1, "", "")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "s-2");
        assert_eq!(coordinator.started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_json_line_client_round_trip_against_tcp_stub() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.unwrap();
            let request: CoordinatorRequest = serde_json::from_str(line.trim_end()).unwrap();
            assert!(matches!(request, CoordinatorRequest::StartBuild { .. }));
            let response = CoordinatorResponse::Started {
                stampede_id: StampedeId::new("s-tcp"),
            };
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            write_half.write_all(out.as_bytes()).await.unwrap();
        });

        let client = JsonLineClient::new(address);
        let id = client
            .start_build(&empty_job(), DistBuildMode::RemoteBuild, 4, "repo", "tenant")
            .await
            .unwrap();
        assert_eq!(id.as_str(), "s-tcp");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_json_line_client_surfaces_coordinator_errors() {
        use tokio::io::AsyncWriteExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let response = CoordinatorResponse::Error {
                message: "unknown tenant".to_string(),
            };
            let mut out = serde_json::to_string(&response).unwrap();
            out.push('\n');
            stream.write_all(out.as_bytes()).await.unwrap();
        });

        let client = JsonLineClient::new(address);
        let err = client
            .fetch_status(&StampedeId::new("s-x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected(_)));
        assert!(!err.is_retryable());
    }
}
