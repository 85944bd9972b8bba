//! OTLP trace writer

use super::fields::trace;
use super::{write_attributes, write_count, write_time, OtlpFraming};
use crate::buffer::{ScratchBuffer, DEFAULT_CAPACITY};
use crate::encoder::{self, WireType};
use crate::errors::Result;
use crate::telemetry::{InstrumentationScope, Resource, Span, SpanEvent, SpanLink, Status};
use crate::writer::{BatchWriter, BufferedWriter, WriterState};

/// Encodes spans as an `ExportTraceServiceRequest` into one reusable buffer.
#[derive(Debug)]
pub struct TraceWriter {
    framing: OtlpFraming,
}

impl TraceWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            framing: OtlpFraming::new(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.framing.capacity()
    }
}

impl Default for TraceWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BatchWriter for TraceWriter {
    type Item = Span;

    fn begin_batch(&mut self, resource: &Resource) -> Result<()> {
        self.framing.begin_batch(resource)
    }

    fn begin_instrumentation_scope(&mut self, scope: &InstrumentationScope) -> Result<()> {
        self.framing.begin_scope(scope)
    }

    fn write_item(&mut self, span: &Span) -> Result<()> {
        let patch = self.framing.begin_item()?;
        write_span(self.framing.scratch(), span)?;
        self.framing.end_item(patch);
        Ok(())
    }

    fn end_instrumentation_scope(&mut self) -> Result<()> {
        self.framing.end_scope();
        Ok(())
    }

    fn end_batch(&mut self) -> Result<()> {
        self.framing.end_batch();
        Ok(())
    }
}

impl BufferedWriter for TraceWriter {
    fn reset(&mut self) {
        self.framing.reset();
    }

    fn encoded(&self) -> &[u8] {
        self.framing.encoded()
    }

    fn item_count(&self) -> usize {
        self.framing.item_count()
    }

    fn state(&self) -> WriterState {
        self.framing.state()
    }
}

fn write_span(scratch: &mut ScratchBuffer, span: &Span) -> Result<()> {
    scratch.write(|b, p| write_id(b, p, trace::SPAN_TRACE_ID, &span.trace_id.0))?;
    scratch.write(|b, p| write_id(b, p, trace::SPAN_SPAN_ID, &span.span_id.0))?;
    if let Some(trace_state) = span.trace_state.as_deref().filter(|s| !s.is_empty()) {
        scratch.write(|b, p| encoder::write_string_with_tag(b, p, trace::SPAN_TRACE_STATE, trace_state))?;
    }
    if span.parent_span_id.is_valid() {
        scratch.write(|b, p| write_id(b, p, trace::SPAN_PARENT_SPAN_ID, &span.parent_span_id.0))?;
    }
    let flags = span_flags(span.trace_flags, span.parent_is_remote);
    scratch.write(|b, p| encoder::write_fixed32_with_tag(b, p, trace::SPAN_FLAGS, flags))?;
    scratch.write(|b, p| encoder::write_string_with_tag(b, p, trace::SPAN_NAME, &span.name))?;
    if let Some(kind) = span.kind {
        scratch.write(|b, p| encoder::write_enum_with_tag(b, p, trace::SPAN_KIND, kind as i32 + 1))?;
    }
    write_time(scratch, trace::SPAN_START_TIME, span.start_time)?;
    write_time(scratch, trace::SPAN_END_TIME, span.end_time)?;

    write_attributes(scratch, trace::SPAN_ATTRIBUTES, &span.attributes)?;
    write_count(scratch, trace::SPAN_DROPPED_ATTRIBUTES_COUNT, span.dropped_attributes_count)?;

    for event in &span.events {
        write_event(scratch, event)?;
    }
    write_count(scratch, trace::SPAN_DROPPED_EVENTS_COUNT, span.dropped_events_count)?;

    for link in &span.links {
        write_link(scratch, link)?;
    }
    write_count(scratch, trace::SPAN_DROPPED_LINKS_COUNT, span.dropped_links_count)?;

    write_status(scratch, &span.status)
}

/// Identifier lengths are fixed, so the length byte is written directly instead
/// of going through a placeholder.
fn write_id(buf: &mut [u8], pos: usize, field: u32, id: &[u8]) -> Result<usize> {
    let pos = encoder::write_tag(buf, pos, field, WireType::Len)?;
    let pos = encoder::write_bytes(buf, pos, &[id.len() as u8])?;
    encoder::write_bytes(buf, pos, id)
}

fn span_flags(trace_flags: u8, is_remote: bool) -> u32 {
    let mut flags = u32::from(trace_flags) | trace::FLAGS_CONTEXT_HAS_IS_REMOTE;
    if is_remote {
        flags |= trace::FLAGS_CONTEXT_IS_REMOTE;
    }
    flags
}

fn write_event(scratch: &mut ScratchBuffer, event: &SpanEvent) -> Result<()> {
    let patch = scratch.reserve_length(trace::SPAN_EVENTS)?;
    write_time(scratch, trace::EVENT_TIME, event.timestamp)?;
    scratch.write(|b, p| encoder::write_string_with_tag(b, p, trace::EVENT_NAME, &event.name))?;
    write_attributes(scratch, trace::EVENT_ATTRIBUTES, &event.attributes)?;
    write_count(scratch, trace::EVENT_DROPPED_ATTRIBUTES_COUNT, event.dropped_attributes_count)?;
    scratch.close_length(patch);
    Ok(())
}

fn write_link(scratch: &mut ScratchBuffer, link: &SpanLink) -> Result<()> {
    let patch = scratch.reserve_length(trace::SPAN_LINKS)?;
    scratch.write(|b, p| write_id(b, p, trace::LINK_TRACE_ID, &link.trace_id.0))?;
    scratch.write(|b, p| write_id(b, p, trace::LINK_SPAN_ID, &link.span_id.0))?;
    if let Some(trace_state) = link.trace_state.as_deref().filter(|s| !s.is_empty()) {
        scratch.write(|b, p| encoder::write_string_with_tag(b, p, trace::LINK_TRACE_STATE, trace_state))?;
    }
    write_attributes(scratch, trace::LINK_ATTRIBUTES, &link.attributes)?;
    write_count(scratch, trace::LINK_DROPPED_ATTRIBUTES_COUNT, link.dropped_attributes_count)?;
    let flags = span_flags(link.trace_flags, link.is_remote);
    scratch.write(|b, p| encoder::write_fixed32_with_tag(b, p, trace::LINK_FLAGS, flags))?;
    scratch.close_length(patch);
    Ok(())
}

/// Status holds at most a message and a code, so its size is known up front and
/// it takes a plain varint length instead of a placeholder. Unset is left off
/// the wire entirely.
fn write_status(scratch: &mut ScratchBuffer, status: &Status) -> Result<()> {
    let (code, description) = match status {
        Status::Unset => return Ok(()),
        Status::Ok => (trace::STATUS_CODE_OK, ""),
        Status::Error { description } => (trace::STATUS_CODE_ERROR, description.as_str()),
    };

    let mut len = encoder::tag_len(trace::STATUS_CODE) + encoder::varint_len(code as u64);
    if !description.is_empty() {
        len += encoder::len_field_len(trace::STATUS_MESSAGE, description.len());
    }

    scratch.write(|b, p| {
        let p = encoder::write_tag(b, p, trace::SPAN_STATUS, WireType::Len)?;
        let mut p = encoder::write_varint(b, p, len as u64)?;
        if !description.is_empty() {
            p = encoder::write_string_with_tag(b, p, trace::STATUS_MESSAGE, description)?;
        }
        encoder::write_enum_with_tag(b, p, trace::STATUS_CODE, code)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{SpanId, SpanKind, TraceId};
    use std::time::{Duration, UNIX_EPOCH};

    fn scenario_span() -> Span {
        let mut trace_id = [0u8; 16];
        for (i, b) in trace_id.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut span_id = [0u8; 8];
        for (i, b) in span_id.iter_mut().enumerate() {
            *b = 0x10 + i as u8;
        }
        Span::new(TraceId(trace_id), SpanId(span_id), "op")
            .with_kind(SpanKind::Server)
            .with_times(
                UNIX_EPOCH + Duration::from_nanos(1_000),
                UNIX_EPOCH + Duration::from_nanos(2_000),
            )
    }

    /// Writes `spans` under a single scope and returns the bytes of the span records.
    fn encode_items(writer: &mut TraceWriter, spans: &[Span]) -> Vec<u8> {
        writer.begin_batch(&Resource::default()).unwrap();
        writer
            .begin_instrumentation_scope(&InstrumentationScope::new("test"))
            .unwrap();
        let start = writer.encoded().len();
        for span in spans {
            writer.write_item(span).unwrap();
        }
        let items = writer.encoded()[start..].to_vec();
        writer.end_instrumentation_scope().unwrap();
        writer.end_batch().unwrap();
        items
    }

    #[test]
    fn test_minimal_server_span_layout() {
        let mut writer = TraceWriter::new(1024);
        let item = encode_items(&mut writer, &[scenario_span()]);

        let mut expected = vec![0x12, 0xBA, 0x80, 0x80, 0x00]; // spans, 58 bytes
        expected.extend_from_slice(&[0x0A, 0x10]);
        expected.extend(0u8..16);
        expected.extend_from_slice(&[0x12, 0x08]);
        expected.extend(0x10u8..0x18);
        expected.extend_from_slice(&[0x85, 0x01, 0x00, 0x01, 0x00, 0x00]); // flags
        expected.extend_from_slice(&[0x2A, 0x02, b'o', b'p']);
        expected.extend_from_slice(&[0x30, 0x02]); // kind = Server + 1
        expected.push(0x39);
        expected.extend_from_slice(&1_000u64.to_le_bytes());
        expected.push(0x41);
        expected.extend_from_slice(&2_000u64.to_le_bytes());

        assert_eq!(item, expected);
        assert_eq!(item.len() - 5, 58);
        assert_eq!(writer.item_count(), 1);
    }

    #[test]
    fn test_parent_and_remote_flags() {
        let mut span = scenario_span().with_parent(SpanId([9; 8]));
        span.parent_is_remote = true;
        span.trace_flags = 0x01;

        let mut writer = TraceWriter::new(1024);
        let item = encode_items(&mut writer, &[span]);

        let parent = [0x22, 0x08, 9, 9, 9, 9, 9, 9, 9, 9];
        assert!(item.windows(parent.len()).any(|w| w == parent));
        let flags = [0x85, 0x01, 0x01, 0x03, 0x00, 0x00];
        assert!(item.windows(flags.len()).any(|w| w == flags));
    }

    #[test]
    fn test_status_sizes_are_precomputed() {
        let mut writer = TraceWriter::new(1024);
        let item = encode_items(
            &mut writer,
            &[scenario_span().with_status(Status::error("bad"))],
        );
        // status{message "bad", code ERROR}
        let tail = [0x7A, 0x07, 0x12, 0x03, b'b', b'a', b'd', 0x18, 0x02];
        assert_eq!(&item[item.len() - tail.len()..], &tail);

        writer.reset();
        let item = encode_items(&mut writer, &[scenario_span().with_status(Status::Ok)]);
        assert_eq!(&item[item.len() - 4..], &[0x7A, 0x02, 0x18, 0x01]);

        writer.reset();
        let item = encode_items(&mut writer, &[scenario_span().with_status(Status::error(""))]);
        assert_eq!(&item[item.len() - 4..], &[0x7A, 0x02, 0x18, 0x02]);
    }

    #[test]
    fn test_reset_reproduces_identical_bytes() {
        let span = scenario_span()
            .with_attribute("db.system", "postgresql")
            .with_event(SpanEvent::new("retry", UNIX_EPOCH).with_attribute("attempt", 2i64))
            .with_link(SpanLink::new(TraceId([7; 16]), SpanId([8; 8])));

        let mut writer = TraceWriter::new(4096);
        encode_items(&mut writer, &[span.clone(), span.clone()]);
        let first = writer.encoded().to_vec();

        writer.reset();
        assert_eq!(writer.state(), WriterState::Idle);
        encode_items(&mut writer, &[span.clone(), span]);
        assert_eq!(writer.encoded(), first.as_slice());
    }

    #[test]
    fn test_exhaustion_surfaces_as_error() {
        let mut writer = TraceWriter::new(64);
        writer.begin_batch(&Resource::default()).unwrap();
        writer
            .begin_instrumentation_scope(&InstrumentationScope::new("test"))
            .unwrap();
        let err = writer.write_item(&scenario_span()).unwrap_err();
        assert!(err.is_capacity());
        assert!(writer.encoded().len() <= writer.capacity());
    }
}
