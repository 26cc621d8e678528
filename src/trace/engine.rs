//! Span/trace lifecycle engine
//!
//! Drives the unit-of-work state machine on top of an [`ExecutionContext`]:
//! at most one active trace per context, spans recorded against it in
//! completion order, and finished payloads handed to the traces buffer.
//!
//! All operations are best-effort. A span or trace that cannot be recorded
//! is dropped with a debug log; producer blocks always run exactly once and
//! producer errors and panics pass through unchanged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::buffer::{BufferEntry, DeliveryBuffer};
use crate::config::TelemetryConfig;
use crate::context::ExecutionContext;
use crate::propagation::{self, PropagationContext};

use super::{ActiveTrace, EnvironmentMetadata, Span, Trace};

/// Error class recorded when a span is unwound by a panic
const PANIC_CLASS: &str = "panic";

pub struct TraceEngine {
    enabled: bool,
    sample_rate: f64,
    meta: EnvironmentMetadata,
    traces: Arc<DeliveryBuffer>,
}

impl TraceEngine {
    pub fn new(config: &TelemetryConfig, traces: Arc<DeliveryBuffer>) -> Self {
        let hostname = config
            .hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok());
        Self {
            enabled: config.enabled,
            sample_rate: config.sample_rate,
            meta: EnvironmentMetadata::new(
                config.service_name.clone(),
                config.environment.clone(),
                hostname,
            ),
            traces,
        }
    }

    /// Begin the unit's trace
    ///
    /// If the context carries an inherited propagation context the new trace
    /// continues it: same trace id, caller's span id recorded as the parent,
    /// caller's sampling decision respected. Otherwise fresh ids are
    /// generated and the sampling rate decides.
    ///
    /// The unit's own propagation identity is stored on the context either
    /// way, so outgoing headers stay consistent even for unsampled units.
    /// Returns `None` when disabled, unsampled, or a trace is already
    /// active; only the first `start_trace` per context wins.
    pub fn start_trace(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: &str,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Option<PropagationContext> {
        if !self.enabled {
            return None;
        }
        if ctx.has_active_trace() {
            debug!(name, "start_trace ignored, context already has an active trace");
            return None;
        }

        let inherited = ctx.propagation();
        let identity = match &inherited {
            Some(parent) => propagation::child_context(parent),
            None => {
                let mut fresh = PropagationContext::generate(true);
                fresh.sampled = self.should_sample(&fresh.trace_id);
                fresh
            }
        };

        if !identity.sampled {
            ctx.set_propagation(identity.clone());
            debug!(trace_id = %identity.trace_id, name, "trace not sampled");
            return None;
        }

        let mut trace = Trace::new(
            identity.trace_id.clone(),
            name,
            kind,
            attributes,
            self.meta.clone(),
        );
        if inherited.is_some() {
            trace.parent_trace_id = Some(identity.trace_id.clone());
            trace.parent_span_id = identity.parent_span_id.clone();
        }

        let installed = ctx.install_trace(ActiveTrace {
            trace,
            started: Instant::now(),
        });
        if !installed {
            debug!(name, "lost start_trace race, keeping existing trace");
            return None;
        }
        ctx.set_propagation(identity.clone());
        debug!(trace_id = %identity.trace_id, name, kind, "trace started");
        Some(identity)
    }

    /// The context's propagation identity, creating one if absent
    ///
    /// Lets outgoing requests carry consistent ids before any trace has
    /// started; a later `start_trace` on the same context continues them.
    pub fn ensure_identity(&self, ctx: &ExecutionContext) -> Option<PropagationContext> {
        if !self.enabled {
            return None;
        }
        if let Some(existing) = ctx.propagation() {
            return Some(existing);
        }
        let mut fresh = PropagationContext::generate(true);
        fresh.sampled = self.should_sample(&fresh.trace_id);
        ctx.set_propagation(fresh.clone());
        Some(fresh)
    }

    /// Open a span and return its guard, or `None` when nothing records it
    ///
    /// The span completes when the guard is dropped or [`SpanGuard::finish`]
    /// is called. Guards may outlive each other in any order; spans land on
    /// the trace in completion order.
    pub fn start_span<'a>(
        &self,
        ctx: &'a ExecutionContext,
        name: &str,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> Option<SpanGuard<'a>> {
        if !self.enabled || !ctx.has_active_trace() {
            return None;
        }
        Some(SpanGuard {
            ctx,
            span_id: propagation::generate_span_id(),
            name: name.to_string(),
            kind: kind.to_string(),
            data,
            started_at: Utc::now(),
            started: Instant::now(),
            error: None,
            finished: false,
        })
    }

    /// Run `f` inside a span
    ///
    /// `f` runs exactly once whether or not a trace is active. A panic in
    /// `f` marks the span as a panic error and unwinds unchanged.
    pub fn span<T>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        let _guard = self.start_span(ctx, name, kind, data);
        f()
    }

    /// Run a fallible `f` inside a span
    ///
    /// An `Err` marks the span with the error's type and rendered message,
    /// then passes through to the caller unchanged.
    pub fn try_span<T, E>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
    {
        match self.start_span(ctx, name, kind, data) {
            Some(mut guard) => {
                let result = f();
                if let Err(error) = &result {
                    guard.record_error(std::any::type_name::<E>(), error.to_string());
                }
                result
            }
            None => f(),
        }
    }

    /// Close the unit's trace and enqueue its payload
    ///
    /// The active trace is removed from the context unconditionally, so a
    /// unit can never leak a stale trace regardless of what delivery does
    /// later. User id and request id from the context are merged into the
    /// payload when the trace did not already set them. Returns the payload
    /// that was enqueued, or `None` when no trace was active.
    pub fn finish_trace(
        &self,
        ctx: &ExecutionContext,
        error: bool,
        error_class: Option<&str>,
        error_message: Option<&str>,
    ) -> Option<serde_json::Value> {
        let active = ctx.take_active_trace()?;
        let mut trace = active.trace;
        let elapsed = active.started.elapsed();
        trace.ended_at = Some(end_time(trace.started_at, elapsed));
        trace.duration_ms = Some(elapsed.as_millis() as u64);
        trace.error = error;
        trace.error_class = error_class.map(str::to_string);
        trace.error_message = error_message.map(str::to_string);

        let spans = trace.spans.len();
        let trace_id = trace.trace_id.clone();
        let mut payload = match serde_json::to_value(&trace) {
            Ok(value) => value,
            Err(e) => {
                warn!(trace_id = %trace_id, error = %e, "failed to serialize trace payload");
                return None;
            }
        };
        merge_context_fields(ctx, &mut payload);
        self.traces.push(BufferEntry::new(payload.clone()));
        debug!(trace_id = %trace_id, spans, error, "trace finished");
        Some(payload)
    }

    fn should_sample(&self, trace_id: &str) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        // Deterministic per trace id: the leading 64 bits bucket the trace.
        let bucket = trace_id
            .get(..16)
            .and_then(|prefix| u64::from_str_radix(prefix, 16).ok())
            .unwrap_or(0);
        let threshold = (self.sample_rate * u64::MAX as f64) as u64;
        bucket <= threshold
    }
}

/// Open span tied to its context
///
/// Completes on drop. Holding the guard across a panic records the panic
/// on the span while the unwind continues unchanged.
pub struct SpanGuard<'a> {
    ctx: &'a ExecutionContext,
    span_id: String,
    name: String,
    kind: String,
    data: HashMap<String, serde_json::Value>,
    started_at: DateTime<Utc>,
    started: Instant,
    error: Option<(String, String)>,
    finished: bool,
}

impl SpanGuard<'_> {
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// Attach a data field to the span
    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Mark the span as failed
    pub fn record_error(&mut self, class: impl Into<String>, message: impl Into<String>) {
        self.error = Some((class.into(), message.into()));
    }

    /// Complete the span now instead of at end of scope
    pub fn finish(mut self) {
        self.complete();
    }

    fn complete(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        if self.error.is_none() && std::thread::panicking() {
            self.error = Some((PANIC_CLASS.to_string(), "span interrupted by panic".to_string()));
        }

        let elapsed = self.started.elapsed();
        let name = std::mem::take(&mut self.name);
        let (error_class, error_message) = match self.error.take() {
            Some((class, message)) => (Some(class), Some(message)),
            None => (None, None),
        };
        let span = Span {
            span_id: std::mem::take(&mut self.span_id),
            name: name.clone(),
            kind: std::mem::take(&mut self.kind),
            started_at: self.started_at,
            ended_at: end_time(self.started_at, elapsed),
            duration_ms: elapsed.as_millis() as u64,
            data: std::mem::take(&mut self.data),
            error: error_class.is_some(),
            error_class,
            error_message,
        };

        let appended = self.ctx.with_active_trace(|active| active.trace.push_span(span));
        if appended.is_none() {
            debug!(span = %name, "span finished after its trace, dropped");
        }
    }
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Wall-clock end derived from the monotonic duration, never before start
fn end_time(started_at: DateTime<Utc>, elapsed: std::time::Duration) -> DateTime<Utc> {
    started_at + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero())
}

fn merge_context_fields(ctx: &ExecutionContext, payload: &mut serde_json::Value) {
    let Some(obj) = payload.as_object_mut() else {
        return;
    };
    if !obj.contains_key("user_id") {
        if let Some(id) = ctx.user().and_then(|u| u.id) {
            obj.insert("user_id".to_string(), serde_json::Value::String(id));
        }
    }
    if !obj.contains_key("request_id") {
        if let Some(request_id) = ctx.tags().get("request_id") {
            obj.insert(
                "request_id".to_string(),
                serde_json::Value::String(request_id.clone()),
            );
        }
    }
}
