//! Periodic OTLP batch export
//!
//! Producers write spans and metrics through the [`writer::BatchWriter`]
//! protocol into a single reusable scratch buffer. A
//! [`scheduler::PeriodicExportScheduler`] drives one export cycle per interval
//! on its own thread and hands the encoded request to a [`transport::Transport`].

pub mod assembler;
pub mod buffer;
pub mod cancellation;
pub mod config;
pub mod encoder;
pub mod errors;
pub mod exporter;
pub mod otlp;
pub mod pipeline;
pub mod producers;
pub mod scheduler;
pub mod telemetry;
pub mod transport;
pub mod writer;

pub use assembler::{assemble_and_write, BatchSummary, ProducerRegistry};
pub use config::{Config, TemporalityPreference};
pub use errors::{ExportError, Result};
pub use exporter::{BatchExport, ExportResult, PipelineExporter};
pub use otlp::{MetricWriter, TraceWriter};
pub use pipeline::{ExportPipeline, PipelineStats};
pub use producers::{Meter, SpanQueue};
pub use scheduler::{PeriodicExportScheduler, SchedulerState};
pub use transport::{HttpTransport, Transport};
pub use writer::{BatchWriter, BufferedWriter, Producer, WriterState};
