//! Engine Scenario Tests
//!
//! Full unit-of-work scenarios through the trace engine and execution
//! context: distributed continuation, span recording, and the isolation
//! guarantees between sequential and concurrent units.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kodama_telemetry::buffer::{BufferEntry, Channel, DeliveryBuffer, FlushSink};
use kodama_telemetry::config::TelemetryConfig;
use kodama_telemetry::context::{ContextStore, ExecutionContext, UserInfo};
use kodama_telemetry::propagation::{self, PropagationContext, PropagationFormat};
use kodama_telemetry::trace::TraceEngine;

struct RecordingSink {
    batches: Mutex<Vec<Vec<BufferEntry>>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
        })
    }

    fn total_entries(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl FlushSink for RecordingSink {
    fn deliver(&self, _channel: Channel, batch: Vec<BufferEntry>) {
        self.batches.lock().unwrap().push(batch);
    }
}

fn test_engine() -> (TraceEngine, Arc<DeliveryBuffer>, Arc<RecordingSink>) {
    let sink = RecordingSink::new();
    let buffer = DeliveryBuffer::new(Channel::Traces, 100, Duration::ZERO, sink.clone());
    let mut config = TelemetryConfig::default();
    config.service_name = "checkout".to_string();
    config.environment = "test".to_string();
    let engine = TraceEngine::new(&config, buffer.clone());
    (engine, buffer, sink)
}

/// A request arrives with W3C headers, runs spans including a failing one,
/// and produces a payload continuing the caller's trace with context fields
/// merged in.
#[test]
fn test_full_unit_lifecycle_continues_inbound_trace() {
    let (engine, buffer, sink) = test_engine();

    // Upstream service injected these headers into its outgoing request.
    let upstream = PropagationContext::generate(true);
    let mut headers = HashMap::new();
    propagation::inject(&mut headers, &upstream, PropagationFormat::W3c);

    let ctx = ExecutionContext::default();
    let adopted = propagation::extract(&headers).unwrap();
    ctx.set_propagation(adopted);
    ctx.set_user(UserInfo::with_id("user-1"));
    ctx.set_tag("request_id", "req-55");

    let identity = engine
        .start_trace(&ctx, "orders.create", "request", HashMap::new())
        .unwrap();
    assert_eq!(identity.trace_id, upstream.trace_id);

    engine.span(&ctx, "db.query", "db", HashMap::new(), || {});
    let render: Result<(), std::fmt::Error> =
        engine.try_span(&ctx, "render", "template", HashMap::new(), || {
            Err(std::fmt::Error)
        });
    assert!(render.is_err());

    let payload = engine.finish_trace(&ctx, false, None, None).unwrap();
    assert_eq!(payload["trace_id"], upstream.trace_id.as_str());
    assert_eq!(payload["parent_trace_id"], upstream.trace_id.as_str());
    assert_eq!(payload["parent_span_id"], upstream.span_id.as_str());
    assert_eq!(payload["user_id"], "user-1");
    assert_eq!(payload["request_id"], "req-55");
    assert_eq!(payload["meta"]["service"], "checkout");
    assert_eq!(payload["meta"]["environment"], "test");

    let spans = payload["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0]["name"], "db.query");
    assert_eq!(spans[0]["error"], false);
    assert_eq!(spans[1]["name"], "render");
    assert_eq!(spans[1]["error"], true);

    buffer.flush();
    assert_eq!(sink.total_entries(), 1);
}

/// A checkout request with two timed sub-operations: the trace duration
/// covers both spans and a clean finish carries no error fields.
#[test]
fn test_checkout_scenario_times_spans_and_trace() {
    let (engine, _, _) = test_engine();
    let ctx = ExecutionContext::default();

    engine
        .start_trace(&ctx, "checkout", "request", HashMap::new())
        .unwrap();
    engine.span(&ctx, "db.query", "db", HashMap::new(), || {
        std::thread::sleep(Duration::from_millis(10));
    });
    engine.span(&ctx, "view.render", "template", HashMap::new(), || {
        std::thread::sleep(Duration::from_millis(5));
    });

    let payload = engine.finish_trace(&ctx, false, None, None).unwrap();
    assert_eq!(payload["name"], "checkout");
    assert!(payload["duration_ms"].as_u64().unwrap() >= 15);
    assert_eq!(payload["error"], false);
    assert!(payload.get("error_class").is_none());
    assert!(payload.get("error_message").is_none());

    let spans = payload["spans"].as_array().unwrap();
    assert_eq!(spans.len(), 2);
    assert_eq!(spans[0]["name"], "db.query");
    assert_eq!(spans[1]["name"], "view.render");
}

/// Two units run back to back on one pooled thread; clearing the thread
/// slot between them means nothing from the first leaks into the second.
#[test]
fn test_sequential_units_share_thread_without_leaking() {
    let (engine, _, _) = test_engine();

    let ctx = ContextStore::current();
    ctx.set_user(UserInfo::with_id("user-a"));
    ctx.set_tag("request_id", "req-a");
    engine.start_trace(&ctx, "unit.a", "job", HashMap::new());
    let first = engine.finish_trace(&ctx, false, None, None).unwrap();
    ContextStore::clear();

    let ctx = ContextStore::current();
    engine.start_trace(&ctx, "unit.b", "job", HashMap::new());
    let second = engine.finish_trace(&ctx, false, None, None).unwrap();
    ContextStore::clear();

    assert_eq!(first["user_id"], "user-a");
    assert_eq!(first["request_id"], "req-a");
    assert!(second.get("user_id").is_none());
    assert!(second.get("request_id").is_none());
    assert_ne!(first["trace_id"], second["trace_id"]);
}

/// Concurrent units on separate contexts get distinct traces with their own
/// spans, sharing one engine.
#[test]
fn test_concurrent_units_do_not_interfere() {
    let (engine, buffer, sink) = test_engine();

    let trace_ids: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = &engine;
                scope.spawn(move || {
                    let ctx = ExecutionContext::default();
                    engine.start_trace(&ctx, &format!("unit.{i}"), "job", HashMap::new());
                    for step in 0..3 {
                        engine.span(&ctx, &format!("step.{step}"), "internal", HashMap::new(), || {});
                    }
                    let payload = engine.finish_trace(&ctx, false, None, None).unwrap();
                    assert_eq!(payload["spans"].as_array().unwrap().len(), 3);
                    payload["trace_id"].as_str().unwrap().to_string()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let unique: std::collections::HashSet<&String> = trace_ids.iter().collect();
    assert_eq!(unique.len(), 4);

    buffer.flush();
    assert_eq!(sink.total_entries(), 4);
}

/// One unit fans work out to helper threads; their spans overlap freely and
/// all land on the unit's trace.
#[test]
fn test_overlapping_spans_from_helper_threads() {
    let (engine, _, _) = test_engine();
    let ctx = ExecutionContext::default();
    engine.start_trace(&ctx, "parallel.job", "job", HashMap::new());

    std::thread::scope(|scope| {
        for i in 0..3 {
            let (engine, ctx) = (&engine, &ctx);
            scope.spawn(move || {
                engine.span(ctx, &format!("worker.{i}"), "internal", HashMap::new(), || {
                    std::thread::sleep(Duration::from_millis(10));
                });
            });
        }
    });

    let payload = engine.finish_trace(&ctx, false, None, None).unwrap();
    let mut names: Vec<String> = payload["spans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["name"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["worker.0", "worker.1", "worker.2"]);
}

/// An error finish produces an error payload and the context is reusable
/// for a fresh trace afterwards.
#[test]
fn test_error_finish_then_reuse_context() {
    let (engine, _, _) = test_engine();
    let ctx = ExecutionContext::default();

    engine.start_trace(&ctx, "first", "job", HashMap::new());
    let failed = engine
        .finish_trace(&ctx, true, Some("JobTimeout"), Some("exceeded 30s budget"))
        .unwrap();
    assert_eq!(failed["error"], true);
    assert_eq!(failed["error_class"], "JobTimeout");
    assert_eq!(failed["error_message"], "exceeded 30s budget");

    let second = engine.start_trace(&ctx, "second", "job", HashMap::new());
    assert!(second.is_some());
    let payload = engine.finish_trace(&ctx, false, None, None).unwrap();
    assert_eq!(payload["error"], false);
    assert_eq!(payload["name"], "second");
}
