//! Drives registered producers through one batch

use crate::errors::{ExportError, Result};
use crate::telemetry::Resource;
use crate::writer::{BatchWriter, Producer};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, warn};

/// What happened to each producer during one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub producers: usize,
    pub with_data: usize,
    pub empty: usize,
    /// Names of producers whose `write_to` failed and was skipped.
    pub failed: Vec<String>,
}

/// Registered producers for one signal, in registration order.
pub struct ProducerRegistry<W> {
    producers: RwLock<Vec<Arc<dyn Producer<W>>>>,
}

impl<W: BatchWriter> ProducerRegistry<W> {
    pub fn new() -> Self {
        Self {
            producers: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, producer: Arc<dyn Producer<W>>) {
        let mut producers = self.producers.write().unwrap_or_else(PoisonError::into_inner);
        debug!("Registered producer {}", producer.name());
        producers.push(producer);
    }

    /// Removes every producer registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let mut producers = self.producers.write().unwrap_or_else(PoisonError::into_inner);
        let before = producers.len();
        producers.retain(|p| p.name() != name);
        producers.len() != before
    }

    pub fn len(&self) -> usize {
        self.producers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current producer list so a batch is unaffected by concurrent
    /// registration.
    pub fn snapshot(&self) -> Vec<Arc<dyn Producer<W>>> {
        self.producers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<W: BatchWriter> Default for ProducerRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes one batch: `begin_batch`, every producer in order, `end_batch`.
///
/// A producer that returns an error is logged and skipped; the rest of the batch
/// still runs and `end_batch` is called exactly once. Producers are trusted to
/// leave the writer `InBatch` even when they fail.
///
/// Running out of buffer is different: the writer is stuck mid-record, so the
/// batch is abandoned and the error returned for the caller to discard it. A
/// producer that panics is treated the same way, since it may have left a
/// record open.
pub fn assemble_and_write<W: BatchWriter>(
    resource: &Resource,
    producers: &[Arc<dyn Producer<W>>],
    writer: &mut W,
) -> Result<BatchSummary> {
    writer.begin_batch(resource)?;

    let mut summary = BatchSummary {
        producers: producers.len(),
        ..Default::default()
    };

    for producer in producers {
        let written = match panic::catch_unwind(AssertUnwindSafe(|| producer.write_to(writer))) {
            Ok(written) => written,
            Err(payload) => {
                let err = ExportError::panicked(producer.name(), payload.as_ref());
                error!("{}, abandoning batch", err);
                return Err(err);
            }
        };

        match written {
            Ok(true) => summary.with_data += 1,
            Ok(false) => summary.empty += 1,
            Err(e) if e.is_capacity() => {
                error!(
                    "Producer {} exhausted the scratch buffer, abandoning batch: {}",
                    producer.name(),
                    e
                );
                return Err(e);
            }
            Err(e) => {
                warn!("Producer {} failed, skipping it for this batch: {}", producer.name(), e);
                summary.failed.push(producer.name().to_string());
            }
        }
    }

    writer.end_batch()?;

    debug!(
        "Assembled batch from {} producers ({} with data, {} empty, {} failed)",
        summary.producers,
        summary.with_data,
        summary.empty,
        summary.failed.len()
    );
    Ok(summary)
}
