//! OTLP protobuf batch writers
//!
//! Both signals share the same envelope:
//!
//! ```text
//! Export*ServiceRequest
//!   resource_* (1)        <- patched at end_batch
//!     resource (1)        <- written and patched in begin_batch
//!     scope_* (2)         <- patched at end_instrumentation_scope
//!       scope (1)         <- written and patched in begin_instrumentation_scope
//!       spans/metrics (2) <- one record per write_item
//! ```
//!
//! Every record length is unknown until its content is written, so each one gets a
//! 4-byte placeholder that is back-patched once the record closes. Patches for
//! records opened and closed inside one call live on the stack; only the batch and
//! scope patches outlive a call and are kept on [`OtlpFraming`].

pub mod fields;
pub mod metrics;
pub mod trace;

pub use metrics::MetricWriter;
pub use trace::TraceWriter;

use crate::buffer::ScratchBuffer;
use crate::encoder::{self, LengthPatch};
use crate::errors::Result;
use crate::telemetry::{unix_nanos, AttributeValue, InstrumentationScope, KeyValue, Resource};
use crate::writer::WriterState;
use fields::{common, envelope};
use std::time::SystemTime;

/// Envelope bookkeeping shared by [`TraceWriter`] and [`MetricWriter`].
#[derive(Debug)]
pub struct OtlpFraming {
    scratch: ScratchBuffer,
    batch: Option<LengthPatch>,
    scope: Option<LengthPatch>,
    items: usize,
}

impl OtlpFraming {
    pub fn new(capacity: usize) -> Self {
        Self {
            scratch: ScratchBuffer::new(capacity),
            batch: None,
            scope: None,
            items: 0,
        }
    }

    pub fn state(&self) -> WriterState {
        match (self.batch, self.scope) {
            (None, _) => WriterState::Idle,
            (Some(_), None) => WriterState::InBatch,
            (Some(_), Some(_)) => WriterState::InScope,
        }
    }

    pub fn scratch(&mut self) -> &mut ScratchBuffer {
        &mut self.scratch
    }

    pub fn encoded(&self) -> &[u8] {
        self.scratch.as_slice()
    }

    pub fn item_count(&self) -> usize {
        self.items
    }

    pub fn capacity(&self) -> usize {
        self.scratch.capacity()
    }

    pub fn reset(&mut self) {
        self.scratch.reset();
        self.batch = None;
        self.scope = None;
        self.items = 0;
    }

    pub fn begin_batch(&mut self, resource: &Resource) -> Result<()> {
        assert!(
            self.batch.is_none(),
            "begin_batch called while a batch is already open"
        );
        self.batch = Some(self.scratch.reserve_length(envelope::REQUEST_RESOURCE)?);

        let resource_patch = self.scratch.reserve_length(envelope::RESOURCE)?;
        write_attributes(&mut self.scratch, common::RESOURCE_ATTRIBUTES, &resource.attributes)?;
        self.scratch.close_length(resource_patch);
        Ok(())
    }

    pub fn begin_scope(&mut self, scope: &InstrumentationScope) -> Result<()> {
        assert!(
            self.batch.is_some(),
            "begin_instrumentation_scope called outside a batch"
        );
        assert!(self.scope.is_none(), "instrumentation scopes cannot nest");
        self.scope = Some(self.scratch.reserve_length(envelope::RESOURCE_SCOPE)?);

        let scope_patch = self.scratch.reserve_length(envelope::SCOPE)?;
        self.scratch
            .write(|b, p| encoder::write_string_with_tag(b, p, common::SCOPE_NAME, &scope.name))?;
        if let Some(version) = &scope.version {
            self.scratch
                .write(|b, p| encoder::write_string_with_tag(b, p, common::SCOPE_VERSION, version))?;
        }
        write_attributes(&mut self.scratch, common::SCOPE_ATTRIBUTES, &scope.attributes)?;
        self.scratch.close_length(scope_patch);
        Ok(())
    }

    /// Opens the record for one span or metric.
    pub fn begin_item(&mut self) -> Result<LengthPatch> {
        assert!(
            self.scope.is_some(),
            "write_item called outside an instrumentation scope"
        );
        self.scratch.reserve_length(envelope::SCOPE_ITEM)
    }

    pub fn end_item(&mut self, patch: LengthPatch) {
        self.scratch.close_length(patch);
        self.items += 1;
    }

    pub fn end_scope(&mut self) {
        let Some(patch) = self.scope.take() else {
            panic!("end_instrumentation_scope called without an open scope");
        };
        self.scratch.close_length(patch);
    }

    pub fn end_batch(&mut self) {
        assert!(
            self.scope.is_none(),
            "end_batch called while an instrumentation scope is still open"
        );
        let Some(patch) = self.batch.take() else {
            panic!("end_batch called without an open batch");
        };
        self.scratch.close_length(patch);
    }
}

pub(crate) fn write_attributes(
    scratch: &mut ScratchBuffer,
    field: u32,
    attributes: &[KeyValue],
) -> Result<()> {
    for attribute in attributes {
        let patch = scratch.reserve_length(field)?;
        scratch.write(|b, p| encoder::write_string_with_tag(b, p, common::KEY_VALUE_KEY, &attribute.key))?;
        write_any_value(scratch, common::KEY_VALUE_VALUE, &attribute.value)?;
        scratch.close_length(patch);
    }
    Ok(())
}

fn write_any_value(scratch: &mut ScratchBuffer, field: u32, value: &AttributeValue) -> Result<()> {
    let patch = scratch.reserve_length(field)?;
    match value {
        AttributeValue::String(v) => {
            scratch.write(|b, p| encoder::write_string_with_tag(b, p, common::ANY_VALUE_STRING, v))?
        }
        AttributeValue::Bool(v) => {
            scratch.write(|b, p| encoder::write_bool_with_tag(b, p, common::ANY_VALUE_BOOL, *v))?
        }
        AttributeValue::Int(v) => scratch
            .write(|b, p| encoder::write_varint_with_tag(b, p, common::ANY_VALUE_INT, *v as u64))?,
        AttributeValue::Double(v) => {
            scratch.write(|b, p| encoder::write_double_with_tag(b, p, common::ANY_VALUE_DOUBLE, *v))?
        }
        AttributeValue::Bytes(v) => {
            scratch.write(|b, p| encoder::write_bytes_with_tag(b, p, common::ANY_VALUE_BYTES, v))?
        }
        AttributeValue::Array(values) => {
            let array = scratch.reserve_length(common::ANY_VALUE_ARRAY)?;
            for value in values {
                write_any_value(scratch, common::ARRAY_VALUE_VALUES, value)?;
            }
            scratch.close_length(array);
        }
    }
    scratch.close_length(patch);
    Ok(())
}

pub(crate) fn write_time(scratch: &mut ScratchBuffer, field: u32, time: SystemTime) -> Result<()> {
    scratch.write(|b, p| encoder::write_fixed64_with_tag(b, p, field, unix_nanos(time)))
}

/// Proto3 leaves zero counts off the wire.
pub(crate) fn write_count(scratch: &mut ScratchBuffer, field: u32, count: u32) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    scratch.write(|b, p| encoder::write_varint_with_tag(b, p, field, u64::from(count)))
}
