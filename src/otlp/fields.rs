//! OTLP protobuf field numbers
//!
//! Reference: https://github.com/open-telemetry/opentelemetry-proto

/// Fields shared by the trace and metric envelopes.
///
/// `ExportTraceServiceRequest`/`ExportMetricsServiceRequest`, `ResourceSpans`/
/// `ResourceMetrics` and `ScopeSpans`/`ScopeMetrics` use identical numbering, so one
/// framing layer serves both signals.
pub mod envelope {
    /// Export*ServiceRequest.resource_spans / resource_metrics
    pub const REQUEST_RESOURCE: u32 = 1;
    /// Resource*.resource
    pub const RESOURCE: u32 = 1;
    /// Resource*.scope_spans / scope_metrics
    pub const RESOURCE_SCOPE: u32 = 2;
    /// Scope*.scope
    pub const SCOPE: u32 = 1;
    /// Scope*.spans / metrics
    pub const SCOPE_ITEM: u32 = 2;
}

pub mod common {
    pub const ANY_VALUE_STRING: u32 = 1;
    pub const ANY_VALUE_BOOL: u32 = 2;
    pub const ANY_VALUE_INT: u32 = 3;
    pub const ANY_VALUE_DOUBLE: u32 = 4;
    pub const ANY_VALUE_ARRAY: u32 = 5;
    pub const ANY_VALUE_BYTES: u32 = 7;

    pub const ARRAY_VALUE_VALUES: u32 = 1;

    pub const KEY_VALUE_KEY: u32 = 1;
    pub const KEY_VALUE_VALUE: u32 = 2;

    pub const RESOURCE_ATTRIBUTES: u32 = 1;

    pub const SCOPE_NAME: u32 = 1;
    pub const SCOPE_VERSION: u32 = 2;
    pub const SCOPE_ATTRIBUTES: u32 = 3;
}

pub mod trace {
    pub const SPAN_TRACE_ID: u32 = 1;
    pub const SPAN_SPAN_ID: u32 = 2;
    pub const SPAN_TRACE_STATE: u32 = 3;
    pub const SPAN_PARENT_SPAN_ID: u32 = 4;
    pub const SPAN_NAME: u32 = 5;
    pub const SPAN_KIND: u32 = 6;
    pub const SPAN_START_TIME: u32 = 7;
    pub const SPAN_END_TIME: u32 = 8;
    pub const SPAN_ATTRIBUTES: u32 = 9;
    pub const SPAN_DROPPED_ATTRIBUTES_COUNT: u32 = 10;
    pub const SPAN_EVENTS: u32 = 11;
    pub const SPAN_DROPPED_EVENTS_COUNT: u32 = 12;
    pub const SPAN_LINKS: u32 = 13;
    pub const SPAN_DROPPED_LINKS_COUNT: u32 = 14;
    pub const SPAN_STATUS: u32 = 15;
    pub const SPAN_FLAGS: u32 = 16;

    pub const EVENT_TIME: u32 = 1;
    pub const EVENT_NAME: u32 = 2;
    pub const EVENT_ATTRIBUTES: u32 = 3;
    pub const EVENT_DROPPED_ATTRIBUTES_COUNT: u32 = 4;

    pub const LINK_TRACE_ID: u32 = 1;
    pub const LINK_SPAN_ID: u32 = 2;
    pub const LINK_TRACE_STATE: u32 = 3;
    pub const LINK_ATTRIBUTES: u32 = 4;
    pub const LINK_DROPPED_ATTRIBUTES_COUNT: u32 = 5;
    pub const LINK_FLAGS: u32 = 6;

    pub const STATUS_MESSAGE: u32 = 2;
    pub const STATUS_CODE: u32 = 3;

    pub const STATUS_CODE_OK: i32 = 1;
    pub const STATUS_CODE_ERROR: i32 = 2;

    /// Set whenever flags are recorded, so a zero trace-flags byte is
    /// distinguishable from no flags at all.
    pub const FLAGS_CONTEXT_HAS_IS_REMOTE: u32 = 0x100;
    pub const FLAGS_CONTEXT_IS_REMOTE: u32 = 0x200;
}

pub mod metrics {
    pub const METRIC_NAME: u32 = 1;
    pub const METRIC_DESCRIPTION: u32 = 2;
    pub const METRIC_UNIT: u32 = 3;
    pub const METRIC_GAUGE: u32 = 5;
    pub const METRIC_SUM: u32 = 7;
    pub const METRIC_HISTOGRAM: u32 = 9;

    pub const GAUGE_DATA_POINTS: u32 = 1;

    pub const SUM_DATA_POINTS: u32 = 1;
    pub const SUM_AGGREGATION_TEMPORALITY: u32 = 2;
    pub const SUM_IS_MONOTONIC: u32 = 3;

    pub const HISTOGRAM_DATA_POINTS: u32 = 1;
    pub const HISTOGRAM_AGGREGATION_TEMPORALITY: u32 = 2;

    pub const NUMBER_START_TIME: u32 = 2;
    pub const NUMBER_TIME: u32 = 3;
    pub const NUMBER_AS_DOUBLE: u32 = 4;
    pub const NUMBER_AS_INT: u32 = 6;
    pub const NUMBER_ATTRIBUTES: u32 = 7;
    pub const NUMBER_FLAGS: u32 = 8;

    pub const HISTOGRAM_START_TIME: u32 = 2;
    pub const HISTOGRAM_TIME: u32 = 3;
    pub const HISTOGRAM_COUNT: u32 = 4;
    pub const HISTOGRAM_SUM: u32 = 5;
    pub const HISTOGRAM_BUCKET_COUNTS: u32 = 6;
    pub const HISTOGRAM_EXPLICIT_BOUNDS: u32 = 7;
    pub const HISTOGRAM_ATTRIBUTES: u32 = 9;
    pub const HISTOGRAM_FLAGS: u32 = 10;
    pub const HISTOGRAM_MIN: u32 = 11;
    pub const HISTOGRAM_MAX: u32 = 12;

    pub const TEMPORALITY_DELTA: i32 = 1;
    pub const TEMPORALITY_CUMULATIVE: i32 = 2;
}
