//! Rendezvous between the local builder and remote progress.
//!
//! A registry of per-rule-key latches. The local build engine waits on a
//! key before touching a cacheable rule; the remote controller signals
//! keys as the coordinator reports them finished. Signals are monotonic
//! and terminal: once a key is `Available` or `NotBuilt` it never
//! changes, and signalling after `cancel` is a no-op.

use async_trait::async_trait;
use stampede_common::types::RuleKey;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// What a waiter observes for one rule key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The remote produced the artifact; the cache will serve it.
    Available,
    /// The remote will never produce this artifact.
    NotBuilt,
    /// The whole synchronizer was cancelled.
    Cancelled,
    /// The caller's timeout elapsed before any signal.
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Pending,
    Available,
    NotBuilt,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    /// Remote reached a terminal state: unsignalled keys are `NotBuilt`.
    Closed,
    /// Dead: every key reads `Cancelled`.
    Cancelled,
}

struct Inner {
    mode: Mode,
    latches: HashMap<RuleKey, watch::Sender<LatchState>>,
}

/// Per-key latch set. Latches are allocated on first `wait` or first
/// signal, whichever comes first, under the map lock.
pub struct RemoteBuildSynchronizer {
    inner: Mutex<Inner>,
}

impl RemoteBuildSynchronizer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                mode: Mode::Open,
                latches: HashMap::new(),
            }),
        }
    }

    fn subscribe(&self, key: &RuleKey) -> watch::Receiver<LatchState> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let initial = match inner.mode {
            Mode::Open => LatchState::Pending,
            Mode::Closed => LatchState::NotBuilt,
            Mode::Cancelled => LatchState::Cancelled,
        };
        inner
            .latches
            .entry(*key)
            .or_insert_with(|| watch::channel(initial).0)
            .subscribe()
    }

    fn signal(&self, key: &RuleKey, state: LatchState) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.mode != Mode::Open {
            return;
        }
        let sender = inner
            .latches
            .entry(*key)
            .or_insert_with(|| watch::channel(LatchState::Pending).0);
        sender.send_if_modified(|current| {
            if *current == LatchState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    /// Release every current and future waiter on `key` with `Available`.
    pub fn signal_available(&self, key: &RuleKey) {
        self.signal(key, LatchState::Available);
    }

    /// Terminal failure for `key`; waiters observe `NotBuilt`.
    pub fn signal_not_built(&self, key: &RuleKey) {
        self.signal(key, LatchState::NotBuilt);
    }

    /// Remote terminal state: broadcast `NotBuilt` to every unsignalled
    /// current and future key.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.mode != Mode::Open {
            return;
        }
        inner.mode = Mode::Closed;
        broadcast_pending(&inner.latches, LatchState::NotBuilt);
    }

    /// Kill the synchronizer: every unsignalled current and future key
    /// reads `Cancelled`. Idempotent.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.mode == Mode::Cancelled {
            return;
        }
        inner.mode = Mode::Cancelled;
        broadcast_pending(&inner.latches, LatchState::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).mode == Mode::Cancelled
    }

    /// Block until `key` reaches a terminal state, the synchronizer dies,
    /// or `timeout` elapses.
    pub async fn wait(&self, key: &RuleKey, timeout: Option<Duration>) -> WaitOutcome {
        let mut rx = self.subscribe(key);
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            match *rx.borrow_and_update() {
                LatchState::Available => return WaitOutcome::Available,
                LatchState::NotBuilt => return WaitOutcome::NotBuilt,
                LatchState::Cancelled => return WaitOutcome::Cancelled,
                LatchState::Pending => {}
            }
            let changed = match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => return WaitOutcome::TimedOut,
                },
                None => rx.changed().await,
            };
            // Sender gone means the synchronizer itself was dropped.
            if changed.is_err() {
                return WaitOutcome::Cancelled;
            }
        }
    }
}

impl Default for RemoteBuildSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

fn broadcast_pending(latches: &HashMap<RuleKey, watch::Sender<LatchState>>, state: LatchState) {
    for sender in latches.values() {
        sender.send_if_modified(|current| {
            if *current == LatchState::Pending {
                *current = state;
                true
            } else {
                false
            }
        });
    }
}

/// The seam the local build engine gates cacheable rules through.
#[async_trait]
pub trait RemoteRuleCompletionWaiter: Send + Sync {
    /// Whether cacheable rules must wait for remote completion at all.
    fn expects_remote_completion(&self) -> bool;

    async fn wait_for_rule(&self, key: &RuleKey, timeout: Option<Duration>) -> WaitOutcome;
}

/// Waiter for purely local builds: nothing is gated.
pub struct NoOpCompletionWaiter;

#[async_trait]
impl RemoteRuleCompletionWaiter for NoOpCompletionWaiter {
    fn expects_remote_completion(&self) -> bool {
        false
    }

    async fn wait_for_rule(&self, _key: &RuleKey, _timeout: Option<Duration>) -> WaitOutcome {
        WaitOutcome::Available
    }
}

#[async_trait]
impl RemoteRuleCompletionWaiter for RemoteBuildSynchronizer {
    fn expects_remote_completion(&self) -> bool {
        true
    }

    async fn wait_for_rule(&self, key: &RuleKey, timeout: Option<Duration>) -> WaitOutcome {
        self.wait(key, timeout).await
    }
}
