//! Trace data model and lifecycle engine
//!
//! A [`Trace`] covers one unit of work end to end. [`Span`]s are completed
//! sub-operations appended to their trace in completion order. The
//! [`engine::TraceEngine`] drives the lifecycle; this module holds the
//! payload shapes it emits.
//!
//! Payloads serialize to JSON with trace attributes flattened to the top
//! level, so producer-supplied fields like `request_id` sit next to the
//! built-in ones.

pub mod engine;

pub use engine::{SpanGuard, TraceEngine};

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Service identity stamped onto every trace payload
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentMetadata {
    pub service: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub sdk: String,
}

impl EnvironmentMetadata {
    pub fn new(service: String, environment: String, hostname: Option<String>) -> Self {
        Self {
            service,
            environment,
            hostname,
            sdk: format!("kodama-telemetry/{}", crate::VERSION),
        }
    }
}

/// A completed sub-operation within a trace
///
/// Spans are immutable once closed. `ended_at` is derived from a monotonic
/// duration added to `started_at`, so it never precedes the start even when
/// the wall clock steps backwards mid-span.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub span_id: String,
    pub name: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, serde_json::Value>,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// One unit of work, from `start_trace` to `finish_trace`
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub trace_id: String,
    pub name: String,
    pub kind: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Completed spans in completion order
    pub spans: Vec<Span>,
    pub meta: EnvironmentMetadata,
    #[serde(flatten)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl Trace {
    pub fn new(
        trace_id: String,
        name: &str,
        kind: &str,
        attributes: HashMap<String, serde_json::Value>,
        meta: EnvironmentMetadata,
    ) -> Self {
        Self {
            trace_id,
            name: name.to_string(),
            kind: kind.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            error: false,
            error_class: None,
            error_message: None,
            parent_trace_id: None,
            parent_span_id: None,
            spans: Vec::new(),
            meta,
            attributes,
        }
    }

    /// Append a completed span
    pub fn push_span(&mut self, span: Span) {
        self.spans.push(span);
    }
}

/// Live trace plus the monotonic clock it was started on
#[derive(Debug)]
pub(crate) struct ActiveTrace {
    pub trace: Trace,
    pub started: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_meta() -> EnvironmentMetadata {
        EnvironmentMetadata::new("checkout".to_string(), "test".to_string(), None)
    }

    #[test]
    fn test_trace_serializes_attributes_at_top_level() {
        let trace = Trace::new(
            "0af7651916cd43dd8448eb211c80319c".to_string(),
            "orders.create",
            "request",
            HashMap::from([("request_id".to_string(), json!("req-1"))]),
            test_meta(),
        );

        let value = serde_json::to_value(&trace).unwrap();
        assert_eq!(value["trace_id"], "0af7651916cd43dd8448eb211c80319c");
        assert_eq!(value["request_id"], "req-1");
        assert_eq!(value["meta"]["service"], "checkout");
        assert!(value["meta"]["sdk"]
            .as_str()
            .unwrap()
            .starts_with("kodama-telemetry/"));
    }

    #[test]
    fn test_unset_optional_fields_are_omitted() {
        let trace = Trace::new(
            "0af7651916cd43dd8448eb211c80319c".to_string(),
            "orders.create",
            "request",
            HashMap::new(),
            test_meta(),
        );

        let value = serde_json::to_value(&trace).unwrap();
        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("ended_at"));
        assert!(!obj.contains_key("duration_ms"));
        assert!(!obj.contains_key("parent_trace_id"));
        assert!(!obj.contains_key("error_class"));
        assert_eq!(value["error"], false);
    }

    #[test]
    fn test_push_span_preserves_order() {
        let mut trace = Trace::new(
            "0af7651916cd43dd8448eb211c80319c".to_string(),
            "job.run",
            "job",
            HashMap::new(),
            test_meta(),
        );
        for name in ["db.query", "cache.set"] {
            let now = Utc::now();
            trace.push_span(Span {
                span_id: crate::propagation::generate_span_id(),
                name: name.to_string(),
                kind: "internal".to_string(),
                started_at: now,
                ended_at: now,
                duration_ms: 0,
                data: HashMap::new(),
                error: false,
                error_class: None,
                error_message: None,
            });
        }

        let names: Vec<&str> = trace.spans.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db.query", "cache.set"]);
    }
}
