//! One export cycle: encode every producer into the writer and submit the bytes

use crate::assembler::{assemble_and_write, BatchSummary, ProducerRegistry};
use crate::errors::{ExportError, Result};
use crate::telemetry::Resource;
use crate::transport::Transport;
use crate::writer::BufferedWriter;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one export cycle
#[derive(Debug)]
pub enum ExportResult {
    Success { items: usize, bytes: usize },
    Failure(ExportError),
}

impl ExportResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExportResult::Success { .. })
    }

    pub fn error(&self) -> Option<&ExportError> {
        match self {
            ExportResult::Success { .. } => None,
            ExportResult::Failure(e) => Some(e),
        }
    }
}

/// Something the scheduler can run once per tick.
#[async_trait]
pub trait BatchExport: Send {
    /// Label used in logs and as the worker thread name.
    fn name(&self) -> &str;

    /// Runs one cycle. Must stop promptly once `cancel` fires.
    async fn export(&mut self, cancel: &CancellationToken) -> ExportResult;
}

/// Exports whatever the registered producers hold, through one reusable writer.
pub struct PipelineExporter<W> {
    name: String,
    writer: W,
    producers: Arc<ProducerRegistry<W>>,
    transport: Arc<dyn Transport>,
    resource: Resource,
}

impl<W: BufferedWriter> PipelineExporter<W> {
    pub fn new(
        name: impl Into<String>,
        writer: W,
        producers: Arc<ProducerRegistry<W>>,
        transport: Arc<dyn Transport>,
        resource: Resource,
    ) -> Self {
        Self {
            name: name.into(),
            writer,
            producers,
            transport,
            resource,
        }
    }

    pub fn producers(&self) -> &Arc<ProducerRegistry<W>> {
        &self.producers
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn encode(&mut self) -> Result<BatchSummary> {
        self.writer.reset();
        let producers = self.producers.snapshot();
        assemble_and_write(&self.resource, &producers, &mut self.writer)
    }
}

#[async_trait]
impl<W> BatchExport for PipelineExporter<W>
where
    W: BufferedWriter + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&mut self, cancel: &CancellationToken) -> ExportResult {
        let summary = match self.encode() {
            Ok(summary) => summary,
            Err(e) => {
                self.writer.reset();
                return ExportResult::Failure(e);
            }
        };

        if !summary.failed.is_empty() {
            warn!(
                "{}: {} producer(s) skipped this cycle: {}",
                self.name,
                summary.failed.len(),
                summary.failed.join(", ")
            );
        }

        if cancel.is_cancelled() {
            self.writer.reset();
            return ExportResult::Failure(ExportError::Cancelled);
        }

        let items = self.writer.item_count();
        if items == 0 {
            debug!("{}: nothing to export", self.name);
            return ExportResult::Success { items: 0, bytes: 0 };
        }

        let payload = self.writer.encoded();
        let bytes = payload.len();
        let submitted = tokio::select! {
            result = self.transport.submit(payload, cancel) => result,
            _ = cancel.cancelled() => Err(ExportError::Cancelled),
        };

        match submitted {
            Ok(()) => {
                debug!("{}: exported {} items in {} bytes", self.name, items, bytes);
                ExportResult::Success { items, bytes }
            }
            Err(e) => {
                self.writer.reset();
                ExportResult::Failure(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otlp::TraceWriter;
    use crate::telemetry::{InstrumentationScope, Span, SpanId, TraceId};
    use crate::writer::{BatchWriter, Producer, WriterState};
    use std::sync::Mutex;
    use std::time::{Duration, UNIX_EPOCH};

    #[derive(Default)]
    struct RecordingTransport {
        payloads: Mutex<Vec<Vec<u8>>>,
        reject: bool,
        stall: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn submit(&self, payload: &[u8], _cancel: &CancellationToken) -> Result<()> {
            if self.stall {
                // Ignores the token so only the exporter's own select can end it.
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if self.reject {
                return Err(ExportError::Transport("503 Service Unavailable".to_string()));
            }
            self.payloads.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }

    struct FixedSpans(usize);

    impl Producer<TraceWriter> for FixedSpans {
        fn write_to(&self, writer: &mut TraceWriter) -> Result<bool> {
            if self.0 == 0 {
                return Ok(false);
            }
            writer.begin_instrumentation_scope(&InstrumentationScope::new("fixed"))?;
            for i in 0..self.0 {
                let span = Span::new(TraceId([1; 16]), SpanId([i as u8 + 1; 8]), "op")
                    .with_times(UNIX_EPOCH + Duration::from_secs(1), UNIX_EPOCH + Duration::from_secs(2));
                writer.write_item(&span)?;
            }
            writer.end_instrumentation_scope()?;
            Ok(true)
        }
    }

    fn exporter(
        capacity: usize,
        spans: usize,
        transport: Arc<RecordingTransport>,
    ) -> PipelineExporter<TraceWriter> {
        let registry = Arc::new(ProducerRegistry::<TraceWriter>::new());
        registry.register(Arc::new(FixedSpans(spans)));
        PipelineExporter::new(
            "traces",
            TraceWriter::new(capacity),
            registry,
            transport,
            Resource::default().with_attribute("service.name", "test"),
        )
    }

    #[tokio::test]
    async fn test_cycle_submits_encoded_batch() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(4096, 3, transport.clone());

        let result = exporter.export(&CancellationToken::new()).await;
        let (items, bytes) = match result {
            ExportResult::Success { items, bytes } => (items, bytes),
            other => panic!("expected success, got {:?}", other),
        };
        assert_eq!(items, 3);

        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), bytes);
        assert_eq!(payloads[0].as_slice(), exporter.writer().encoded());
        assert_eq!(exporter.writer().state(), WriterState::Idle);
    }

    #[tokio::test]
    async fn test_consecutive_cycles_produce_identical_bytes() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(4096, 2, transport.clone());

        assert!(exporter.export(&CancellationToken::new()).await.is_success());
        assert!(exporter.export(&CancellationToken::new()).await.is_success());

        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0], payloads[1]);
    }

    #[tokio::test]
    async fn test_empty_cycle_skips_transport() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(4096, 0, transport.clone());

        let result = exporter.export(&CancellationToken::new()).await;
        assert!(matches!(result, ExportResult::Success { items: 0, bytes: 0 }));
        assert!(transport.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_fault_fails_cycle_without_submitting() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(64, 50, transport.clone());

        let result = exporter.export(&CancellationToken::new()).await;
        assert!(matches!(result.error(), Some(e) if e.is_capacity()));
        assert!(transport.payloads.lock().unwrap().is_empty());
        assert!(exporter.writer().encoded().is_empty());
        assert_eq!(exporter.writer().state(), WriterState::Idle);
    }

    struct HalfWritten;

    impl Producer<TraceWriter> for HalfWritten {
        fn name(&self) -> &str {
            "half-written"
        }

        fn write_to(&self, writer: &mut TraceWriter) -> Result<bool> {
            writer.begin_instrumentation_scope(&InstrumentationScope::new("broken"))?;
            panic!("instrumentation bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_producer_fails_cycle_and_resets_writer() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(4096, 1, transport.clone());
        exporter.producers().register(Arc::new(HalfWritten));

        let result = exporter.export(&CancellationToken::new()).await;
        assert!(matches!(result, ExportResult::Failure(ExportError::Panicked { .. })));
        assert!(transport.payloads.lock().unwrap().is_empty());
        assert!(exporter.writer().encoded().is_empty());
        assert_eq!(exporter.writer().state(), WriterState::Idle);

        assert!(exporter.producers().unregister("half-written"));
        let result = exporter.export(&CancellationToken::new()).await;
        assert!(matches!(result, ExportResult::Success { items: 1, .. }));
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_resets_writer() {
        let transport = Arc::new(RecordingTransport {
            reject: true,
            ..Default::default()
        });
        let mut exporter = exporter(4096, 1, transport);

        let result = exporter.export(&CancellationToken::new()).await;
        assert!(matches!(result, ExportResult::Failure(ExportError::Transport(_))));
        assert!(exporter.writer().encoded().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_submit() {
        let transport = Arc::new(RecordingTransport::default());
        let mut exporter = exporter(4096, 1, transport.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = exporter.export(&cancel).await;
        assert!(matches!(result, ExportResult::Failure(ExportError::Cancelled)));
        assert!(transport.payloads.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stalled_transport() {
        let transport = Arc::new(RecordingTransport {
            stall: true,
            ..Default::default()
        });
        let mut exporter = exporter(4096, 1, transport);

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(2), exporter.export(&cancel))
            .await
            .expect("cancellation should end the cycle");
        assert!(matches!(result, ExportResult::Failure(ExportError::Cancelled)));
    }
}
