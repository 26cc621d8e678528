//! Telemetry pipeline
//!
//! The explicitly constructed object that owns the whole delivery chain:
//! trace engine, one delivery buffer per channel, and the shared transport
//! client. Hosts build one pipeline at startup, pass `&ExecutionContext`
//! handles through their units of work, and call [`TelemetryPipeline::shutdown`]
//! on exit. Dropping the pipeline shuts it down as a safety net.
//!
//! Nothing here returns an error after construction. Delivery problems are
//! logged, counted in [`DeliveryStats`], and otherwise invisible to the host.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::buffer::{BufferEntry, Channel, DeliveryBuffer, FlushSink};
use crate::config::{ConfigError, TelemetryConfig};
use crate::context::{Breadcrumb, BreadcrumbLevel, ExecutionContext};
use crate::propagation::{self, PropagationContext};
use crate::trace::{SpanGuard, TraceEngine};
use crate::transport::{DeliveryOutcome, TransportClient, TransportError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

/// Monotonic delivery counters shared across the pipeline
#[derive(Debug, Default)]
pub struct DeliveryStats {
    delivered_entries: AtomicU64,
    dropped_entries: AtomicU64,
    delivered_batches: AtomicU64,
    dropped_batches: AtomicU64,
}

impl DeliveryStats {
    fn record(&self, outcome: DeliveryOutcome, entries: u64) {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.delivered_entries.fetch_add(entries, Ordering::Relaxed);
                self.delivered_batches.fetch_add(1, Ordering::Relaxed);
            }
            DeliveryOutcome::Dropped(_) => {
                self.dropped_entries.fetch_add(entries, Ordering::Relaxed);
                self.dropped_batches.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Point-in-time view of the delivery counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Entries accepted into any buffer
    pub enqueued: u64,
    /// Entries rejected because the pipeline was already shut down
    pub discarded_after_shutdown: u64,
    pub delivered_entries: u64,
    pub dropped_entries: u64,
    pub delivered_batches: u64,
    pub dropped_batches: u64,
}

/// Flush sink that sends batches through the transport and counts outcomes
struct TransportSink {
    transport: TransportClient,
    stats: Arc<DeliveryStats>,
}

impl FlushSink for TransportSink {
    fn deliver(&self, channel: Channel, batch: Vec<BufferEntry>) {
        let entries = batch.len() as u64;
        let outcome = self.transport.send(channel, &batch);
        self.stats.record(outcome, entries);
    }
}

/// Owner of the full telemetry delivery chain
pub struct TelemetryPipeline {
    config: TelemetryConfig,
    engine: TraceEngine,
    logs: Arc<DeliveryBuffer>,
    traces: Arc<DeliveryBuffer>,
    metrics: Arc<DeliveryBuffer>,
    stats: Arc<DeliveryStats>,
    down: AtomicBool,
}

impl fmt::Debug for TelemetryPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPipeline")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .field("down", &self.down)
            .finish_non_exhaustive()
    }
}

impl TelemetryPipeline {
    /// Build and start a pipeline from a validated configuration
    ///
    /// Spawns one flush timer per channel when enabled. Fails only on
    /// invalid configuration or transport client construction.
    pub fn new(config: TelemetryConfig) -> Result<Self, PipelineError> {
        config.validate()?;

        let stats = Arc::new(DeliveryStats::default());
        let transport = TransportClient::new(&config)?;
        let sink: Arc<dyn FlushSink> = Arc::new(TransportSink {
            transport,
            stats: Arc::clone(&stats),
        });

        let interval = Duration::from_millis(config.buffer.flush_interval_millis);
        let threshold = config.buffer.size_threshold;
        let logs = DeliveryBuffer::new(Channel::Logs, threshold, interval, Arc::clone(&sink));
        let traces = DeliveryBuffer::new(Channel::Traces, threshold, interval, Arc::clone(&sink));
        let metrics = DeliveryBuffer::new(Channel::Metrics, threshold, interval, Arc::clone(&sink));
        if config.enabled {
            logs.spawn_timer();
            traces.spawn_timer();
            metrics.spawn_timer();
        }

        let engine = TraceEngine::new(&config, Arc::clone(&traces));
        info!(
            service = %config.service_name,
            environment = %config.environment,
            enabled = config.enabled,
            "telemetry pipeline started"
        );

        Ok(Self {
            config,
            engine,
            logs,
            traces,
            metrics,
            stats,
            down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Fresh execution context sized per this pipeline's configuration
    pub fn new_context(&self) -> ExecutionContext {
        ExecutionContext::new(self.config.buffer.max_breadcrumbs)
    }

    /// See [`TraceEngine::start_trace`]
    pub fn start_trace(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: &str,
        attributes: HashMap<String, serde_json::Value>,
    ) -> Option<PropagationContext> {
        self.engine.start_trace(ctx, name, kind, attributes)
    }

    /// See [`TraceEngine::finish_trace`]
    pub fn finish_trace(
        &self,
        ctx: &ExecutionContext,
        error: bool,
        error_class: Option<&str>,
        error_message: Option<&str>,
    ) -> Option<serde_json::Value> {
        self.engine.finish_trace(ctx, error, error_class, error_message)
    }

    /// See [`TraceEngine::span`]
    pub fn span<T>(
        &self,
        ctx: &ExecutionContext,
        name: &str,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
        f: impl FnOnce() -> T,
    ) -> T {
        self.engine.span(ctx, name, kind, data, f)
    }

    /// See [`TraceEngine::try_span`]
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
        self.engine.try_span(ctx, name, kind, data, f)
    }

    /// See [`TraceEngine::start_span`]
    pub fn start_span<'a>(
        &self,
        ctx: &'a ExecutionContext,
        name: &str,
        kind: &str,
        data: HashMap<String, serde_json::Value>,
    ) -> Option<SpanGuard<'a>> {
        self.engine.start_span(ctx, name, kind, data)
    }

    /// Write the unit's propagation headers into an outgoing header map
    ///
    /// Uses the configured `inject_format`. An identity is created and
    /// pinned on the context if the unit has none yet, so pre-trace calls
    /// and the eventual trace agree on ids.
    pub fn inject(&self, ctx: &ExecutionContext, headers: &mut HashMap<String, String>) {
        let Some(identity) = self.engine.ensure_identity(ctx) else {
            return;
        };
        propagation::inject(headers, &identity, self.config.propagation.inject_format);
    }

    /// Adopt a caller's propagation context from incoming headers
    ///
    /// On success the context is stored on `ctx`, so the next `start_trace`
    /// continues the caller's trace. Malformed or absent headers leave the
    /// context untouched and return `None`.
    pub fn extract(
        &self,
        ctx: &ExecutionContext,
        headers: &HashMap<String, String>,
    ) -> Option<PropagationContext> {
        if !self.config.enabled {
            return None;
        }
        let found = propagation::extract(headers)?;
        debug!(trace_id = %found.trace_id, "adopted inbound trace context");
        ctx.set_propagation(found.clone());
        Some(found)
    }

    /// Append a breadcrumb to the unit's trail
    pub fn add_breadcrumb(
        &self,
        ctx: &ExecutionContext,
        message: &str,
        category: &str,
        level: BreadcrumbLevel,
        data: HashMap<String, serde_json::Value>,
    ) {
        if !self.config.enabled {
            return;
        }
        let mut crumb = Breadcrumb::new(message, category, level);
        crumb.data = data;
        ctx.add_breadcrumb(crumb);
    }

    /// Enqueue a structured log payload
    pub fn deliver_log(&self, payload: serde_json::Value) {
        self.enqueue(Channel::Logs, payload);
    }

    /// Enqueue a metric payload
    pub fn deliver_metric(&self, payload: serde_json::Value) {
        self.enqueue(Channel::Metrics, payload);
    }

    fn enqueue(&self, channel: Channel, payload: serde_json::Value) {
        if !self.config.enabled {
            return;
        }
        self.buffer_for(channel).push(BufferEntry::new(payload));
    }

    fn buffer_for(&self, channel: Channel) -> &Arc<DeliveryBuffer> {
        match channel {
            Channel::Logs => &self.logs,
            Channel::Traces => &self.traces,
            Channel::Metrics => &self.metrics,
        }
    }

    /// Flush every channel synchronously
    pub fn flush(&self) {
        self.logs.flush();
        self.traces.flush();
        self.metrics.flush();
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.logs.pushed() + self.traces.pushed() + self.metrics.pushed(),
            discarded_after_shutdown: self.logs.discarded()
                + self.traces.discarded()
                + self.metrics.discarded(),
            delivered_entries: self.stats.delivered_entries.load(Ordering::Relaxed),
            dropped_entries: self.stats.dropped_entries.load(Ordering::Relaxed),
            delivered_batches: self.stats.delivered_batches.load(Ordering::Relaxed),
            dropped_batches: self.stats.dropped_batches.load(Ordering::Relaxed),
        }
    }

    /// Stop the timers and drain every buffer
    ///
    /// Idempotent; also runs on drop.
    pub fn shutdown(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("telemetry pipeline shutting down");
        self.logs.shutdown();
        self.traces.shutdown();
        self.metrics.shutdown();
        let stats = self.stats();
        info!(
            delivered = stats.delivered_entries,
            dropped = stats.dropped_entries,
            "telemetry pipeline stopped"
        );
    }
}

impl Drop for TelemetryPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
