//! Kodama Telemetry - delivery diagnostics CLI
//!
//! Loads a config, runs one smoke trace through the full pipeline, and
//! reports whether the ingest endpoint accepted it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use kodama_telemetry::config::ConfigLoader;
use kodama_telemetry::{BreadcrumbLevel, TelemetryPipeline};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Kodama Telemetry - smoke-test a telemetry configuration end to end
#[derive(Parser, Debug)]
#[command(name = "kodama-telemetry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "kodama.yaml")]
    config: PathBuf,

    /// Override the ingest endpoint from the config file
    #[arg(long)]
    endpoint: Option<String>,

    /// Override the service key from the config file
    #[arg(long)]
    service_key: Option<String>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting Kodama Telemetry v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, apply overrides, then validate
    let mut config = ConfigLoader::load_unchecked(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(service_key) = args.service_key {
        config.service_key = service_key;
    }
    config.validate()?;
    info!("Loaded configuration from {:?}", args.config);

    if args.check {
        info!("Configuration OK");
        return Ok(());
    }
    if !config.enabled {
        bail!("telemetry is disabled in this configuration, nothing to probe");
    }

    let pipeline = TelemetryPipeline::new(config)?;

    // One smoke trace exercising spans, breadcrumbs, and a log entry
    let ctx = pipeline.new_context();
    pipeline.start_trace(&ctx, "kodama.smoke", "diagnostic", HashMap::new());
    pipeline.add_breadcrumb(
        &ctx,
        "smoke trace started",
        "diagnostic",
        BreadcrumbLevel::Info,
        HashMap::new(),
    );
    pipeline.span(&ctx, "probe.work", "internal", HashMap::new(), || {
        std::thread::sleep(Duration::from_millis(25));
    });
    let payload = pipeline.finish_trace(&ctx, false, None, None);
    let Some(payload) = payload else {
        bail!("no trace was produced; check sample_rate");
    };
    let trace_id = payload["trace_id"].as_str().unwrap_or_default().to_string();
    info!(trace_id = %trace_id, "smoke trace recorded");
    pipeline.deliver_log(json!({
        "level": "info",
        "message": "kodama smoke log",
        "trace_id": trace_id,
    }));

    pipeline.flush();
    let stats = pipeline.stats();
    info!(
        enqueued = stats.enqueued,
        delivered = stats.delivered_entries,
        dropped = stats.dropped_entries,
        "delivery finished"
    );
    pipeline.shutdown();

    if stats.delivered_entries == 0 {
        bail!("nothing was delivered; check endpoint and service key");
    }
    Ok(())
}
