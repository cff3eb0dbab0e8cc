//! Event broadcast for build lifecycle and stats reporting.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

/// Names of the events the coordinator client emits.
pub mod names {
    pub const DIST_BUILD_STARTED: &str = "dist_build_started";
    pub const DIST_BUILD_FINISHED: &str = "dist_build_finished";
    pub const CLIENT_STATS: &str = "client_stats";
    pub const CONSOLE_WARNING: &str = "console_warning";
    pub const CONSOLE_ERROR: &str = "console_error";
    pub const CACHE_MISS_RULE_KEYS: &str = "cache_miss_rule_keys";
}

/// Broadcast channel for client events (JSON lines).
///
/// Listeners (console renderer, log file writer, test assertions)
/// subscribe; emission never blocks and drops are tolerated.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a new bus. The buffer is clamped up to a floor large
    /// enough that bursty phases (rule completion storms) do not lag
    /// slow subscribers immediately.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1).max(DEFAULT_BUFFER));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(line) => {
                let _ = self.sender.send(line);
            }
            Err(err) => warn!("failed to serialize event {event}: {err}"),
        }
    }

    /// Emit a console-facing warning line.
    pub fn console_warning(&self, message: impl AsRef<str>) {
        self.emit(names::CONSOLE_WARNING, &json!({ "message": message.as_ref() }));
    }

    /// Emit a console-facing error line.
    pub fn console_error(&self, message: impl AsRef<str>) {
        self.emit(names::CONSOLE_ERROR, &json!({ "message": message.as_ref() }));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{bus, drain};
    use super::*;

    #[tokio::test]
    async fn test_emit_carries_event_data_and_timestamp() {
        let events = bus();
        let mut rx = events.subscribe();
        events.emit("probe", &json!({ "answer": 42 }));

        let seen = drain(&mut rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["event"], "probe");
        assert_eq!(seen[0]["data"]["answer"], 42);
        let ts = seen[0]["timestamp"].as_str().expect("timestamp string");
        chrono::DateTime::parse_from_rfc3339(ts).expect("rfc3339 timestamp");
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_does_not_panic() {
        let events = bus();
        events.console_warning("nobody listening");
    }

    #[tokio::test]
    async fn test_console_error_event_name() {
        let events = bus();
        let mut rx = events.subscribe();
        events.console_error("boom");
        let seen = drain(&mut rx);
        assert_eq!(seen[0]["event"], names::CONSOLE_ERROR);
        assert_eq!(seen[0]["data"]["message"], "boom");
    }
}
