//! Demo binary: exports a synthetic span and metric workload over OTLP/HTTP

use clap::Parser;
use otlp_batch_export::telemetry::{InstrumentationScope, KeyValue, Span, SpanEvent, SpanId, SpanKind, Status, TraceId};
use otlp_batch_export::{Config, ExportPipeline, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "otlp-batch-export", version, about = "Periodic OTLP/HTTP batch exporter")]
struct Cli {
    /// JSON configuration file; environment variables are used when absent
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// OTLP/HTTP receiver base URL
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    endpoint: Option<String>,

    #[arg(long)]
    service_name: Option<String>,

    /// Milliseconds between export cycles
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Milliseconds between synthetic spans
    #[arg(long, default_value_t = 250)]
    span_every_ms: u64,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing();

    let cli = Cli::parse();
    info!("Starting otlp-batch-export v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    if let Some(endpoint) = cli.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(service_name) = cli.service_name {
        config.service_name = service_name;
    }
    if let Some(interval_ms) = cli.interval_ms {
        config.export_interval_ms = interval_ms;
    }

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    info!(
        "Export configuration - Service: {}, Endpoint: {}, Interval: {}ms, Timeout: {}ms, Temporality: {}",
        config.service_name,
        config.endpoint,
        config.export_interval_ms,
        config.export_timeout_ms,
        config.temporality_preference
    );

    let pipeline = Arc::new(ExportPipeline::new(config)?);
    pipeline.start()?;

    let workload = tokio::spawn(generate_workload(
        Arc::clone(&pipeline),
        Duration::from_millis(cli.span_every_ms.max(1)),
    ));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }
    workload.abort();

    let shutdown_timeout = pipeline.config().export_timeout().unwrap_or(Duration::from_secs(30));
    let finished = tokio::task::spawn_blocking(move || pipeline.shutdown(shutdown_timeout))
        .await
        .unwrap_or(false);

    if finished {
        info!("Export pipeline shutdown complete");
    } else {
        error!("Export pipeline did not finish its final export in time");
    }
    Ok(())
}

/// Records one server span per tick, plus request count and latency metrics.
async fn generate_workload(pipeline: Arc<ExportPipeline>, every: Duration) {
    let scope = Arc::new(InstrumentationScope::new("demo.http").with_version(env!("CARGO_PKG_VERSION")));
    let meter = pipeline.meter();
    let requests = meter.counter(
        "http.server.requests",
        "Handled requests",
        "{request}",
        vec![KeyValue::new("http.route", "/orders")],
    );
    let latency = meter.histogram(
        "http.server.duration",
        "Request latency",
        "ms",
        vec![],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0],
    );
    let queue_depth = meter.gauge("span.queue.depth", "Spans waiting for export", "{span}", vec![]);

    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;

        let elapsed_ms = rand::random_range(1.0..200.0);
        let end = SystemTime::now();
        let start = end - Duration::from_secs_f64(elapsed_ms / 1000.0);
        let status = if elapsed_ms > 180.0 {
            Status::error("upstream timeout")
        } else {
            Status::Unset
        };

        let span = Span::new(TraceId::random(), SpanId::random(), "GET /orders")
            .with_kind(SpanKind::Server)
            .with_times(start, end)
            .with_status(status)
            .with_attribute("http.request.method", "GET")
            .with_attribute("http.response.status_code", 200_i64)
            .with_event(SpanEvent::new("cache.miss", start).with_attribute("cache.key", "orders"));

        pipeline.span_queue().push(&scope, span);
        requests.add(1);
        latency.record(elapsed_ms);
        queue_depth.record(pipeline.span_queue().len() as f64);
    }
}

/// Initialize structured logging
fn initialize_tracing() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .with_file(false)
        .with_line_number(false)
        .json();

    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
