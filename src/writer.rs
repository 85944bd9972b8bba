//! Batch writer protocol shared by producers and encoders
//!
//! Producers describe *what* goes into a batch by calling the protocol methods in
//! order; a [`BatchWriter`] decides *how* that is encoded. The required ordering is
//! a small state machine:
//!
//! ```text
//! Idle --begin_batch--> InBatch --begin_instrumentation_scope--> InScope
//! InScope --write_item*--> InScope --end_instrumentation_scope--> InBatch
//! InBatch --end_batch--> Idle
//! ```
//!
//! Calling a method out of order is a bug in the caller, not a runtime condition:
//! concrete writers panic rather than emit a structurally broken stream.

use crate::errors::Result;
use crate::telemetry::{InstrumentationScope, Resource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterState {
    Idle,
    InBatch,
    InScope,
}

pub trait BatchWriter {
    type Item: ?Sized;

    fn begin_batch(&mut self, _resource: &Resource) -> Result<()> {
        Ok(())
    }

    /// May be called several times per batch, one scope at a time.
    fn begin_instrumentation_scope(&mut self, _scope: &InstrumentationScope) -> Result<()> {
        Ok(())
    }

    fn write_item(&mut self, item: &Self::Item) -> Result<()>;

    fn end_instrumentation_scope(&mut self) -> Result<()> {
        Ok(())
    }

    fn end_batch(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A writer that encodes into an owned buffer reused across export cycles.
pub trait BufferedWriter: BatchWriter {
    /// Rewinds the buffer and forgets any open records. Required between cycles.
    fn reset(&mut self);

    /// Bytes written since the last reset. Only meaningful once `end_batch` ran.
    fn encoded(&self) -> &[u8];

    /// Items written since the last reset.
    fn item_count(&self) -> usize;

    fn state(&self) -> WriterState;
}

/// Supplies items to a batch through the writer protocol.
///
/// `write_to` runs while the writer is `InBatch` and must leave it `InBatch`,
/// including on early return: every scope it opens, it closes.
pub trait Producer<W: ?Sized>: Send + Sync {
    /// Identity used in logs when the producer fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Writes this producer's data. `Ok(false)` means there was nothing to write.
    fn write_to(&self, writer: &mut W) -> Result<bool>;
}
