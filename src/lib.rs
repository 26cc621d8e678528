//! Kodama Telemetry Library
//!
//! In-process telemetry SDK core: per-unit execution context, distributed
//! trace propagation, a span/trace engine, and batched best-effort delivery
//! over HTTP.
//!
//! # Features
//!
//! - **Never In The Way**: every operation is best-effort; failures are
//!   logged and counted, never raised into the host
//! - **One Buffering Discipline**: logs, traces, and metrics share the same
//!   size-plus-timer batch delivery path
//! - **W3C + B3 Propagation**: extracts both, injects either or both
//! - **Explicit Wiring**: one [`TelemetryPipeline`] object owns the engine,
//!   buffers, and transport; no hidden globals beyond the optional
//!   per-thread context slot
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use kodama_telemetry::{TelemetryConfig, TelemetryPipeline};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut config = TelemetryConfig::load("kodama.yaml")?;
//!     config.service_name = "checkout".to_string();
//!     let pipeline = TelemetryPipeline::new(config)?;
//!
//!     let ctx = pipeline.new_context();
//!     pipeline.start_trace(&ctx, "orders.create", "request", HashMap::new());
//!     pipeline.span(&ctx, "db.insert", "db", HashMap::new(), || {
//!         // host work
//!     });
//!     pipeline.finish_trace(&ctx, false, None, None);
//!
//!     pipeline.shutdown();
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod config;
pub mod context;
pub mod pipeline;
pub mod propagation;
pub mod trace;
pub mod transport;

// Re-export commonly used types
pub use config::TelemetryConfig;
pub use context::{Breadcrumb, BreadcrumbLevel, ContextStore, ExecutionContext, UserInfo};
pub use pipeline::{StatsSnapshot, TelemetryPipeline};
pub use propagation::{PropagationContext, PropagationFormat};
pub use trace::{SpanGuard, TraceEngine};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
