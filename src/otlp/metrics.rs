//! OTLP metric writer

use super::fields::metrics as field;
use super::{write_attributes, write_time, OtlpFraming};
use crate::buffer::{ScratchBuffer, DEFAULT_CAPACITY};
use crate::encoder::{self, WireType};
use crate::errors::Result;
use crate::telemetry::{
    HistogramDataPoint, InstrumentationScope, Metric, MetricData, NumberDataPoint, NumberValue,
    Resource, Temporality,
};
use crate::writer::{BatchWriter, BufferedWriter, WriterState};

/// Encodes metrics as an `ExportMetricsServiceRequest` into one reusable buffer.
///
/// Sums and histograms that leave their temporality unset are written with the
/// writer's temporality, normally resolved from configuration.
#[derive(Debug)]
pub struct MetricWriter {
    framing: OtlpFraming,
    temporality: Temporality,
}

impl MetricWriter {
    pub fn new(capacity: usize, temporality: Temporality) -> Self {
        Self {
            framing: OtlpFraming::new(capacity),
            temporality,
        }
    }

    pub fn temporality(&self) -> Temporality {
        self.temporality
    }
}

impl Default for MetricWriter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, Temporality::Cumulative)
    }
}

impl BatchWriter for MetricWriter {
    type Item = Metric;

    fn begin_batch(&mut self, resource: &Resource) -> Result<()> {
        self.framing.begin_batch(resource)
    }

    fn begin_instrumentation_scope(&mut self, scope: &InstrumentationScope) -> Result<()> {
        self.framing.begin_scope(scope)
    }

    fn write_item(&mut self, metric: &Metric) -> Result<()> {
        let patch = self.framing.begin_item()?;
        let temporality = self.temporality;
        write_metric(self.framing.scratch(), metric, temporality)?;
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

impl BufferedWriter for MetricWriter {
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

fn temporality_value(temporality: Temporality) -> i32 {
    match temporality {
        Temporality::Delta => field::TEMPORALITY_DELTA,
        Temporality::Cumulative => field::TEMPORALITY_CUMULATIVE,
    }
}

fn write_metric(scratch: &mut ScratchBuffer, metric: &Metric, default: Temporality) -> Result<()> {
    scratch.write(|b, p| encoder::write_string_with_tag(b, p, field::METRIC_NAME, &metric.name))?;
    if !metric.description.is_empty() {
        scratch.write(|b, p| {
            encoder::write_string_with_tag(b, p, field::METRIC_DESCRIPTION, &metric.description)
        })?;
    }
    if !metric.unit.is_empty() {
        scratch.write(|b, p| encoder::write_string_with_tag(b, p, field::METRIC_UNIT, &metric.unit))?;
    }

    match &metric.data {
        MetricData::Gauge(points) => {
            let patch = scratch.reserve_length(field::METRIC_GAUGE)?;
            for point in points {
                write_number_point(scratch, field::GAUGE_DATA_POINTS, point)?;
            }
            scratch.close_length(patch);
        }
        MetricData::Sum {
            points,
            temporality,
            monotonic,
        } => {
            let patch = scratch.reserve_length(field::METRIC_SUM)?;
            for point in points {
                write_number_point(scratch, field::SUM_DATA_POINTS, point)?;
            }
            let temporality = temporality_value(temporality.unwrap_or(default));
            scratch.write(|b, p| {
                encoder::write_enum_with_tag(b, p, field::SUM_AGGREGATION_TEMPORALITY, temporality)
            })?;
            if *monotonic {
                scratch.write(|b, p| encoder::write_bool_with_tag(b, p, field::SUM_IS_MONOTONIC, true))?;
            }
            scratch.close_length(patch);
        }
        MetricData::Histogram {
            points,
            temporality,
        } => {
            let patch = scratch.reserve_length(field::METRIC_HISTOGRAM)?;
            for point in points {
                write_histogram_point(scratch, point)?;
            }
            let temporality = temporality_value(temporality.unwrap_or(default));
            scratch.write(|b, p| {
                encoder::write_enum_with_tag(b, p, field::HISTOGRAM_AGGREGATION_TEMPORALITY, temporality)
            })?;
            scratch.close_length(patch);
        }
    }
    Ok(())
}

fn write_number_point(scratch: &mut ScratchBuffer, field_number: u32, point: &NumberDataPoint) -> Result<()> {
    let patch = scratch.reserve_length(field_number)?;
    write_time(scratch, field::NUMBER_START_TIME, point.start_time)?;
    write_time(scratch, field::NUMBER_TIME, point.time)?;
    match point.value {
        NumberValue::Double(v) => {
            scratch.write(|b, p| encoder::write_double_with_tag(b, p, field::NUMBER_AS_DOUBLE, v))?
        }
        NumberValue::Int(v) => {
            scratch.write(|b, p| encoder::write_sfixed64_with_tag(b, p, field::NUMBER_AS_INT, v))?
        }
    }
    write_attributes(scratch, field::NUMBER_ATTRIBUTES, &point.attributes)?;
    if point.flags != 0 {
        scratch.write(|b, p| {
            encoder::write_varint_with_tag(b, p, field::NUMBER_FLAGS, u64::from(point.flags))
        })?;
    }
    scratch.close_length(patch);
    Ok(())
}

fn write_histogram_point(scratch: &mut ScratchBuffer, point: &HistogramDataPoint) -> Result<()> {
    debug_assert!(
        point.bucket_counts.is_empty() || point.bucket_counts.len() == point.explicit_bounds.len() + 1,
        "histogram needs one more bucket than bounds"
    );

    let patch = scratch.reserve_length(field::HISTOGRAM_DATA_POINTS)?;
    write_time(scratch, field::HISTOGRAM_START_TIME, point.start_time)?;
    write_time(scratch, field::HISTOGRAM_TIME, point.time)?;
    scratch.write(|b, p| encoder::write_fixed64_with_tag(b, p, field::HISTOGRAM_COUNT, point.count))?;
    if let Some(sum) = point.sum {
        scratch.write(|b, p| encoder::write_double_with_tag(b, p, field::HISTOGRAM_SUM, sum))?;
    }
    if !point.bucket_counts.is_empty() {
        scratch.write(|b, p| {
            write_packed(b, p, field::HISTOGRAM_BUCKET_COUNTS, point.bucket_counts.iter().copied())
        })?;
    }
    if !point.explicit_bounds.is_empty() {
        scratch.write(|b, p| {
            write_packed(
                b,
                p,
                field::HISTOGRAM_EXPLICIT_BOUNDS,
                point.explicit_bounds.iter().map(|bound| bound.to_bits()),
            )
        })?;
    }
    write_attributes(scratch, field::HISTOGRAM_ATTRIBUTES, &point.attributes)?;
    if point.flags != 0 {
        scratch.write(|b, p| {
            encoder::write_varint_with_tag(b, p, field::HISTOGRAM_FLAGS, u64::from(point.flags))
        })?;
    }
    if let Some(min) = point.min {
        scratch.write(|b, p| encoder::write_double_with_tag(b, p, field::HISTOGRAM_MIN, min))?;
    }
    if let Some(max) = point.max {
        scratch.write(|b, p| encoder::write_double_with_tag(b, p, field::HISTOGRAM_MAX, max))?;
    }
    scratch.close_length(patch);
    Ok(())
}

/// Packed repeated 64-bit field. Element width is fixed, so the length is known
/// before writing and no placeholder is needed.
fn write_packed<I>(buf: &mut [u8], pos: usize, field_number: u32, values: I) -> Result<usize>
where
    I: ExactSizeIterator<Item = u64>,
{
    let len = values.len() * 8;
    let pos = encoder::write_tag(buf, pos, field_number, WireType::Len)?;
    let mut pos = encoder::write_varint(buf, pos, len as u64)?;
    for value in values {
        pos = encoder::write_fixed64(buf, pos, value)?;
    }
    Ok(pos)
}
