//! Wires producers, writers, transports and schedulers for both signals

use crate::assembler::ProducerRegistry;
use crate::config::Config;
use crate::errors::Result;
use crate::exporter::{ExportResult, PipelineExporter};
use crate::otlp::{MetricWriter, TraceWriter};
use crate::producers::{Meter, SpanQueue};
use crate::scheduler::{PeriodicExportScheduler, SchedulerState};
use crate::telemetry::{InstrumentationScope, Resource, Temporality};
use crate::transport::{HttpTransport, MeteredTransport, Signal, Transport, TransportMetricsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Trace and metric export for one process, built from a [`Config`].
pub struct ExportPipeline {
    config: Config,
    instance_id: String,
    spans: Arc<SpanQueue>,
    meter: Arc<Meter>,
    trace_producers: Arc<ProducerRegistry<TraceWriter>>,
    metric_producers: Arc<ProducerRegistry<MetricWriter>>,
    trace_transport: Arc<MeteredTransport<HttpTransport>>,
    metric_transport: Arc<MeteredTransport<HttpTransport>>,
    traces: PeriodicExportScheduler,
    metrics: PeriodicExportScheduler,
}

impl ExportPipeline {
    pub fn new(config: Config) -> Result<Self> {
        let config = config.validated()?;
        let instance_id = Uuid::new_v4().to_string();

        let resource = Resource::default()
            .with_attribute("service.name", config.service_name.clone())
            .with_attribute("service.instance.id", instance_id.clone())
            .with_attribute("telemetry.sdk.name", env!("CARGO_PKG_NAME"))
            .with_attribute("telemetry.sdk.language", "rust")
            .with_attribute("telemetry.sdk.version", env!("CARGO_PKG_VERSION"));

        let trace_transport = Arc::new(MeteredTransport::new(transport(&config, Signal::Traces)?));
        let metric_transport = Arc::new(MeteredTransport::new(transport(&config, Signal::Metrics)?));
        let temporality: Temporality = config
            .temporality_preference
            .resolve(metric_transport.supports_delta());

        let spans = Arc::new(SpanQueue::new(
            "span-queue",
            config.max_queue_size,
            config.max_export_batch_size,
        ));
        let trace_producers = Arc::new(ProducerRegistry::<TraceWriter>::new());
        trace_producers.register(spans.clone());

        let meter = Arc::new(Meter::new(
            InstrumentationScope::new(env!("CARGO_PKG_NAME")).with_version(env!("CARGO_PKG_VERSION")),
            temporality,
        ));
        let metric_producers = Arc::new(ProducerRegistry::<MetricWriter>::new());
        metric_producers.register(meter.clone());

        let traces = PeriodicExportScheduler::from_config(
            PipelineExporter::new(
                "traces",
                TraceWriter::new(config.buffer_capacity),
                Arc::clone(&trace_producers),
                trace_transport.clone(),
                resource.clone(),
            ),
            &config,
        );
        let metrics = PeriodicExportScheduler::from_config(
            PipelineExporter::new(
                "metrics",
                MetricWriter::new(config.buffer_capacity, temporality),
                Arc::clone(&metric_producers),
                metric_transport.clone(),
                resource,
            ),
            &config,
        );

        Ok(Self {
            config,
            instance_id,
            spans,
            meter,
            trace_producers,
            metric_producers,
            trace_transport,
            metric_transport,
            traces,
            metrics,
        })
    }

    pub fn start(&self) -> Result<()> {
        info!(
            "Starting export pipeline {} for service {} to {}",
            self.instance_id, self.config.service_name, self.config.endpoint
        );
        self.traces.start()?;
        self.metrics.start()?;
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn span_queue(&self) -> &Arc<SpanQueue> {
        &self.spans
    }

    pub fn meter(&self) -> &Arc<Meter> {
        &self.meter
    }

    /// Registry for additional trace producers.
    pub fn trace_producers(&self) -> &Arc<ProducerRegistry<TraceWriter>> {
        &self.trace_producers
    }

    /// Registry for additional metric producers.
    pub fn metric_producers(&self) -> &Arc<ProducerRegistry<MetricWriter>> {
        &self.metric_producers
    }

    /// Exports both signals now, waiting up to `timeout` for each.
    pub fn force_flush(&self, timeout: Duration) -> (Option<ExportResult>, Option<ExportResult>) {
        (self.traces.force_flush(timeout), self.metrics.force_flush(timeout))
    }

    /// Blocks until both schedulers have run their final cycle or `timeout`
    /// passes for each.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        info!("Shutting down export pipeline {}", self.instance_id);
        let traces_done = self.traces.shutdown(timeout);
        let metrics_done = self.metrics.shutdown(timeout);

        let stats = self.stats();
        info!(
            "Final transport metrics - traces: {:.1}% success over {} submits, metrics: {:.1}% success over {} submits, {} spans dropped",
            stats.traces.success_rate,
            stats.traces.attempts,
            stats.metrics.success_rate,
            stats.metrics.attempts,
            stats.dropped_spans
        );
        traces_done && metrics_done
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            instance_id: self.instance_id.clone(),
            service_name: self.config.service_name.clone(),
            trace_state: self.traces.state(),
            metric_state: self.metrics.state(),
            queued_spans: self.spans.len(),
            dropped_spans: self.spans.dropped_count(),
            trace_cycles: self.traces.completed_cycles(),
            metric_cycles: self.metrics.completed_cycles(),
            traces: self.trace_transport.metrics(),
            metrics: self.metric_transport.metrics(),
        }
    }
}

fn transport(config: &Config, signal: Signal) -> Result<HttpTransport> {
    Ok(HttpTransport::new(
        &config.endpoint,
        signal,
        config.http_timeout(),
        config.max_retries,
        config.retry_backoff_ms,
    )?
    .with_delta_support(config.collector_supports_delta))
}

/// Point-in-time view of an [`ExportPipeline`]
#[derive(Debug, Clone)]
pub struct PipelineStats {
    pub instance_id: String,
    pub service_name: String,
    pub trace_state: SchedulerState,
    pub metric_state: SchedulerState,
    pub queued_spans: usize,
    pub dropped_spans: u64,
    pub trace_cycles: u64,
    pub metric_cycles: u64,
    pub traces: TransportMetricsSnapshot,
    pub metrics: TransportMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemporalityPreference;

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = Config {
            export_interval_ms: 0,
            ..Default::default()
        };
        assert!(ExportPipeline::new(config).is_err());
    }

    #[test]
    fn test_temporality_falls_back_without_delta_support() {
        let config = Config {
            temporality_preference: TemporalityPreference::Delta,
            collector_supports_delta: false,
            ..Default::default()
        };
        let pipeline = ExportPipeline::new(config).unwrap();
        assert_eq!(pipeline.meter().temporality(), Temporality::Cumulative);
    }

    #[test]
    fn test_unstarted_pipeline_shuts_down_immediately() {
        let pipeline = ExportPipeline::new(Config::default()).unwrap();
        let stats = pipeline.stats();
        assert_eq!(stats.trace_state, SchedulerState::NotStarted);
        assert_eq!(stats.queued_spans, 0);
        assert_eq!(pipeline.trace_producers().len(), 1);
        assert_eq!(pipeline.metric_producers().len(), 1);

        assert!(pipeline.shutdown(Duration::from_millis(100)));
        assert_eq!(pipeline.stats().metric_state, SchedulerState::ShutDown);
        assert!(!pipeline.instance_id().is_empty());
    }
}
