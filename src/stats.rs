//! # Stats Emission
//!
//! Optional per-operation telemetry. When a base is configured with a stats
//! stream, every public operation publishes one [`StatsEvent`] to
//! `<statsStream>.stats`. Publishing is best-effort: failures are logged
//! and swallowed, never surfaced to the caller.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::warn;

use crate::log::EventLog;
use crate::types::now_ms;

/// The operation an emitted stat describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatsOperation {
    Get,
    Query,
    Put,
    Delete,
    Keys,
    Subscribe,
    SubscribeEmit,
}

/// One telemetry record.
///
/// Wire shape (JSON, camelCase): `operation`, optional `id` / `pattern` /
/// `query` / `queryResultCount`, `timestamp` (epoch ms), `duration` (ms).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsEvent {
    pub operation: StatsOperation,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_result_count: Option<u64>,

    pub timestamp: i64,
    pub duration: u64,
}

impl StatsEvent {
    /// A stat for `operation`, stamped now, with the duration measured from
    /// `started`.
    pub fn finished(operation: StatsOperation, started: Instant) -> Self {
        Self {
            operation,
            id: None,
            pattern: None,
            query: None,
            query_result_count: None,
            timestamp: now_ms(),
            duration: started.elapsed().as_millis() as u64,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_pattern(mut self, pattern: Option<&str>) -> Self {
        self.pattern = pattern.map(str::to_string);
        self
    }

    pub fn with_query(mut self, query: &JsonValue) -> Self {
        self.query = Some(query.clone());
        self
    }

    pub fn with_result_count(mut self, count: u64) -> Self {
        self.query_result_count = Some(count);
        self
    }
}

/// Best-effort publisher of [`StatsEvent`]s onto a dedicated stream.
#[derive(Clone)]
pub struct StatsEmitter {
    log: Arc<dyn EventLog>,
    subject: String,
}

impl StatsEmitter {
    pub fn new(log: Arc<dyn EventLog>, stream_name: &str) -> Self {
        Self {
            log,
            subject: format!("{stream_name}.stats"),
        }
    }

    /// Publishes one stat. Never fails the calling operation.
    pub async fn emit(&self, event: StatsEvent) {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "stats event serialization failed");
                return;
            }
        };
        if let Err(e) = self.log.publish(&self.subject, payload).await {
            warn!(error = %e, subject = %self.subject, "stats publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogServer, MemoryLogServer};
    use crate::types::Seq;
    use serde_json::json;

    #[test]
    fn test_stats_event_wire_shape() {
        let event = StatsEvent::finished(StatsOperation::SubscribeEmit, Instant::now())
            .with_id("user1")
            .with_result_count(3);
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["operation"], "SUBSCRIBE_EMIT");
        assert_eq!(value["id"], "user1");
        assert_eq!(value["queryResultCount"], 3);
        assert!(value.get("pattern").is_none());
        assert!(value.get("query").is_none());
        assert!(value["timestamp"].is_i64());
        assert!(value["duration"].is_u64());
    }

    #[test]
    fn test_operation_names() {
        for (op, name) in [
            (StatsOperation::Get, "GET"),
            (StatsOperation::Query, "QUERY"),
            (StatsOperation::Put, "PUT"),
            (StatsOperation::Delete, "DELETE"),
            (StatsOperation::Keys, "KEYS"),
            (StatsOperation::Subscribe, "SUBSCRIBE"),
        ] {
            assert_eq!(serde_json::to_value(op).unwrap(), json!(name));
        }
    }

    #[tokio::test]
    async fn test_emit_publishes_to_stats_subject() {
        let server = MemoryLogServer::new();
        let log = server.open_stream("metrics").await.unwrap();
        let emitter = StatsEmitter::new(Arc::clone(&log), "metrics");

        emitter
            .emit(StatsEvent::finished(StatsOperation::Get, Instant::now()).with_id("k"))
            .await;

        let mut consumer = log.consume(Seq::from_raw(1)).await.unwrap();
        let entry = consumer.next().await.unwrap().unwrap();
        assert_eq!(entry.subject, "metrics.stats");
        let value: JsonValue = serde_json::from_slice(&entry.payload).unwrap();
        assert_eq!(value["operation"], "GET");
    }

    #[tokio::test]
    async fn test_emit_swallows_failures() {
        let server = MemoryLogServer::new();
        let log = server.open_stream("metrics").await.unwrap();
        let emitter = StatsEmitter::new(Arc::clone(&log), "metrics");

        log.delete_stream().await.unwrap();
        // Publishing onto a deleted stream fails internally; emit stays quiet.
        emitter
            .emit(StatsEvent::finished(StatsOperation::Put, Instant::now()))
            .await;
    }
}
