use std::sync::Arc;

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use super::types::LogEntry;
use crate::backend::{ExecutionBackend, JobRef, RawLogRecord};

const DEFAULT_LEVEL: &str = "INFO";

/// Keys that carry the human-readable line in structured payloads.
const MESSAGE_KEYS: &[&str] = &["message", "msg", "log"];

fn first_string<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
}

/// Pull a single message string out of a heterogeneous log record.
///
/// Order: bare string record, `textPayload`, top-level message keys,
/// `jsonPayload` message keys, string `jsonPayload`, then the JSON text of
/// `jsonPayload` / `protoPayload` / the whole record. `null` yields "".
pub fn extract_message(record: &RawLogRecord) -> String {
    match record {
        Value::Null => return String::new(),
        Value::String(s) => return s.clone(),
        _ => {}
    }

    if let Some(text) = first_string(record, &["textPayload"]) {
        return text.to_string();
    }
    if let Some(text) = first_string(record, MESSAGE_KEYS) {
        return text.to_string();
    }

    let json_payload = record.get("jsonPayload").filter(|p| !p.is_null());
    if let Some(payload) = json_payload {
        if let Some(s) = payload.as_str() {
            return s.to_string();
        }
        if let Some(text) = first_string(payload, MESSAGE_KEYS) {
            return text.to_string();
        }
    }

    let fallback = json_payload
        .or_else(|| record.get("protoPayload").filter(|p| !p.is_null()))
        .unwrap_or(record);
    serde_json::to_string(fallback).unwrap_or_default()
}

fn record_timestamp(record: &RawLogRecord) -> Option<DateTime<Utc>> {
    record
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Normalize one raw record. Records without a usable timestamp are stamped
/// with `now`.
pub fn normalize_record(record: &RawLogRecord, now: DateTime<Utc>) -> LogEntry {
    let timestamp = record_timestamp(record).unwrap_or(now);
    let time = timestamp.with_timezone(&Local).format("%H:%M:%S").to_string();
    let level = record
        .get("severity")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_LEVEL)
        .to_string();

    LogEntry {
        time,
        timestamp,
        level,
        message: extract_message(record),
    }
}

/// Fetches an execution's recent output and normalizes it into [`LogEntry`]s.
///
/// Log retrieval is best effort: backend failures are logged and yield an
/// empty list so they never fail the enclosing status check.
#[derive(Clone)]
pub struct LogRetriever {
    backend: Arc<dyn ExecutionBackend>,
    job: JobRef,
    page_size: usize,
}

impl LogRetriever {
    pub fn new(backend: Arc<dyn ExecutionBackend>, job: JobRef, page_size: usize) -> Self {
        Self { backend, job, page_size: page_size.max(1) }
    }

    /// Newest first, at most `page_size` entries.
    pub async fn fetch(&self, execution_id: &str, since: Option<DateTime<Utc>>) -> Vec<LogEntry> {
        let records = match self
            .backend
            .get_logs(&self.job, execution_id, since, self.page_size)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    backend = self.backend.name(),
                    execution_id = %execution_id,
                    "Log fetch failed: {}", e
                );
                return Vec::new();
            }
        };

        let now = Utc::now();
        let mut entries: Vec<LogEntry> = records.iter().map(|r| normalize_record(r, now)).collect();
        // Stable: entries with equal timestamps keep the backend's order.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(self.page_size);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionDescriptor;
    use crate::error::AppError;
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn test_message_field() {
        assert_eq!(extract_message(&json!({ "message": "hello" })), "hello");
    }

    #[test]
    fn test_plain_string_record() {
        assert_eq!(extract_message(&json!("world")), "world");
    }

    #[test]
    fn test_fallback_is_json_text() {
        let record = json!({ "severity": "INFO", "labels": { "a": "b" } });
        let message = extract_message(&record);
        assert!(!message.is_empty());
        let reparsed: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(reparsed, record);
    }

    #[test]
    fn test_text_payload_preferred() {
        let record = json!({ "textPayload": "Starting Stage 1", "jsonPayload": { "message": "other" } });
        assert_eq!(extract_message(&record), "Starting Stage 1");
    }

    #[test]
    fn test_json_payload_keys() {
        assert_eq!(extract_message(&json!({ "jsonPayload": { "msg": "m" } })), "m");
        assert_eq!(extract_message(&json!({ "jsonPayload": { "log": "l" } })), "l");
        assert_eq!(extract_message(&json!({ "jsonPayload": "s" })), "s");
    }

    #[test]
    fn test_structured_payload_without_message_serializes_payload() {
        let record = json!({ "jsonPayload": { "rows": 10 } });
        assert_eq!(extract_message(&record), r#"{"rows":10}"#);
        let proto = json!({ "protoPayload": { "method": "run" } });
        assert_eq!(extract_message(&proto), r#"{"method":"run"}"#);
    }

    #[test]
    fn test_null_record_is_empty() {
        assert_eq!(extract_message(&Value::Null), "");
    }

    #[test]
    fn test_normalize_defaults() {
        let now = Utc::now();
        let entry = normalize_record(&json!({ "textPayload": "x" }), now);
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.timestamp, now);
        assert_eq!(entry.time.len(), 8);

        let entry = normalize_record(
            &json!({ "textPayload": "x", "severity": "ERROR", "timestamp": "2026-01-02T10:00:00.5Z" }),
            now,
        );
        assert_eq!(entry.level, "ERROR");
        assert_eq!(entry.timestamp.to_rfc3339(), "2026-01-02T10:00:00.500+00:00");
        assert_eq!(entry.time.len(), 8);
    }

    struct FixedLogs(Result<Vec<RawLogRecord>, String>);

    #[async_trait]
    impl ExecutionBackend for FixedLogs {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn list_executions(&self, _job: &JobRef) -> Result<Vec<ExecutionDescriptor>, AppError> {
            Ok(vec![])
        }

        async fn get_logs(
            &self,
            _job: &JobRef,
            _execution_id: &str,
            _since: Option<DateTime<Utc>>,
            _limit: usize,
        ) -> Result<Vec<RawLogRecord>, AppError> {
            self.0.clone().map_err(AppError::Backend)
        }

        async fn run_job(&self, _job: &JobRef) -> Result<String, AppError> {
            Ok("op".into())
        }
    }

    fn job() -> JobRef {
        JobRef { project: "p".into(), region: "r".into(), name: "j".into() }
    }

    #[tokio::test]
    async fn test_fetch_degrades_to_empty_on_error() {
        let retriever = LogRetriever::new(Arc::new(FixedLogs(Err("boom".into()))), job(), 50);
        assert!(retriever.fetch("exec", None).await.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_orders_newest_first_and_caps() {
        let records = vec![
            json!({ "textPayload": "a", "timestamp": "2026-01-02T10:00:00Z" }),
            json!({ "textPayload": "c", "timestamp": "2026-01-02T10:02:00Z" }),
            json!({ "textPayload": "b", "timestamp": "2026-01-02T10:01:00Z" }),
        ];
        let retriever = LogRetriever::new(Arc::new(FixedLogs(Ok(records))), job(), 2);
        let logs = retriever.fetch("exec", None).await;
        let messages: Vec<_> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["c", "b"]);
    }
}
