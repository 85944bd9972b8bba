//! In-process telemetry sources that feed the batch writers

use crate::errors::{ExportError, Result};
use crate::telemetry::{
    HistogramDataPoint, InstrumentationScope, KeyValue, Metric, MetricData, NumberDataPoint, NumberValue, Span,
    Temporality,
};
use crate::writer::{BatchWriter, Producer};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Bounded queue of finished spans, drained into each trace batch.
///
/// When full, the oldest span is dropped to make room. Spans leave the queue
/// when a batch is assembled, so a cycle that later fails loses them.
#[derive(Debug)]
pub struct SpanQueue {
    name: String,
    spans: Mutex<VecDeque<(Arc<InstrumentationScope>, Span)>>,
    max_size: usize,
    batch_size: usize,
    dropped: AtomicU64,
}

impl SpanQueue {
    pub fn new(name: impl Into<String>, max_size: usize, batch_size: usize) -> Self {
        Self {
            name: name.into(),
            spans: Mutex::new(VecDeque::new()),
            max_size: max_size.max(1),
            batch_size: batch_size.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queues a span; returns `false` if an older span had to be dropped.
    pub fn push(&self, scope: &Arc<InstrumentationScope>, span: Span) -> bool {
        let mut spans = self.spans.lock().unwrap_or_else(PoisonError::into_inner);

        let mut kept_all = true;
        if spans.len() >= self.max_size {
            spans.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Span queue {} full, dropping oldest span", self.name);
            kept_all = false;
        }

        spans.push_back((Arc::clone(scope), span));
        kept_all
    }

    pub fn len(&self) -> usize {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spans dropped on overflow since creation.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn utilization(&self) -> f64 {
        (self.len() as f64 / self.max_size as f64) * 100.0
    }

    pub fn clear(&self) {
        self.spans.lock().unwrap_or_else(PoisonError::into_inner).clear();
        debug!("Cleared span queue {}", self.name);
    }

    /// Takes up to one batch worth of spans, grouped by scope in first-seen order.
    fn drain_grouped(&self) -> Result<Vec<(Arc<InstrumentationScope>, Vec<Span>)>> {
        let drained: Vec<_> = {
            let mut spans = self
                .spans
                .lock()
                .map_err(|_| ExportError::producer(&self.name, "span queue lock poisoned"))?;
            let count = self.batch_size.min(spans.len());
            spans.drain(..count).collect()
        };

        let mut groups: Vec<(Arc<InstrumentationScope>, Vec<Span>)> = Vec::new();
        for (scope, span) in drained {
            match groups.iter_mut().find(|(s, _)| Arc::ptr_eq(s, &scope) || **s == *scope) {
                Some((_, spans)) => spans.push(span),
                None => groups.push((scope, vec![span])),
            }
        }
        Ok(groups)
    }
}

impl<W> Producer<W> for SpanQueue
where
    W: BatchWriter<Item = Span>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn write_to(&self, writer: &mut W) -> Result<bool> {
        let groups = self.drain_grouped()?;
        if groups.is_empty() {
            return Ok(false);
        }

        for (scope, spans) in &groups {
            writer.begin_instrumentation_scope(scope)?;
            for span in spans {
                writer.write_item(span)?;
            }
            writer.end_instrumentation_scope()?;
        }
        Ok(true)
    }
}

#[derive(Debug, Clone)]
struct InstrumentInfo {
    name: String,
    description: String,
    unit: String,
    attributes: Vec<KeyValue>,
}

impl InstrumentInfo {
    fn metric(&self, data: MetricData) -> Metric {
        Metric::new(self.name.clone(), data)
            .with_description(self.description.clone())
            .with_unit(self.unit.clone())
    }
}

#[derive(Debug)]
struct CounterCell {
    info: InstrumentInfo,
    total: AtomicU64,
    /// Total at the previous collection, and when it happened.
    reported: Mutex<(u64, SystemTime)>,
    created: SystemTime,
}

#[derive(Debug)]
struct GaugeCell {
    info: InstrumentInfo,
    value: Mutex<Option<f64>>,
}

#[derive(Debug)]
struct HistogramCell {
    info: InstrumentInfo,
    bounds: Vec<f64>,
    state: Mutex<HistogramState>,
}

#[derive(Debug, Clone)]
struct HistogramState {
    start: SystemTime,
    count: u64,
    sum: f64,
    min: Option<f64>,
    max: Option<f64>,
    bucket_counts: Vec<u64>,
}

impl HistogramState {
    fn new(buckets: usize, start: SystemTime) -> Self {
        Self {
            start,
            count: 0,
            sum: 0.0,
            min: None,
            max: None,
            bucket_counts: vec![0; buckets],
        }
    }
}

#[derive(Debug, Clone)]
enum Instrument {
    Counter(Arc<CounterCell>),
    Gauge(Arc<GaugeCell>),
    Histogram(Arc<HistogramCell>),
}

/// Monotonic counter handle
#[derive(Debug, Clone)]
pub struct Counter(Arc<CounterCell>);

impl Counter {
    pub fn add(&self, value: u64) {
        self.0.total.fetch_add(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.total.load(Ordering::Relaxed)
    }
}

/// Last-value gauge handle
#[derive(Debug, Clone)]
pub struct Gauge(Arc<GaugeCell>);

impl Gauge {
    pub fn record(&self, value: f64) {
        *self.0.value.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }
}

/// Explicit-bucket histogram handle
#[derive(Debug, Clone)]
pub struct Histogram(Arc<HistogramCell>);

impl Histogram {
    pub fn record(&self, value: f64) {
        let bucket = self.0.bounds.iter().position(|bound| value <= *bound).unwrap_or(self.0.bounds.len());
        let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.count += 1;
        state.sum += value;
        state.min = Some(state.min.map_or(value, |m| m.min(value)));
        state.max = Some(state.max.map_or(value, |m| m.max(value)));
        state.bucket_counts[bucket] += 1;
    }
}

/// Creates instruments for one scope and reports them with a fixed temporality.
///
/// Delta sums and histograms report what was recorded since the previous
/// collection and skip instruments that saw nothing; cumulative ones report
/// running totals since the instrument was created. Gauges always report the
/// last recorded value.
#[derive(Debug)]
pub struct Meter {
    scope: InstrumentationScope,
    temporality: Temporality,
    instruments: Mutex<Vec<Instrument>>,
}

impl Meter {
    pub fn new(scope: InstrumentationScope, temporality: Temporality) -> Self {
        Self {
            scope,
            temporality,
            instruments: Mutex::new(Vec::new()),
        }
    }

    pub fn temporality(&self) -> Temporality {
        self.temporality
    }

    pub fn counter(&self, name: &str, description: &str, unit: &str, attributes: Vec<KeyValue>) -> Counter {
        let now = SystemTime::now();
        let cell = Arc::new(CounterCell {
            info: info(name, description, unit, attributes),
            total: AtomicU64::new(0),
            reported: Mutex::new((0, now)),
            created: now,
        });
        self.register(Instrument::Counter(Arc::clone(&cell)));
        Counter(cell)
    }

    pub fn gauge(&self, name: &str, description: &str, unit: &str, attributes: Vec<KeyValue>) -> Gauge {
        let cell = Arc::new(GaugeCell {
            info: info(name, description, unit, attributes),
            value: Mutex::new(None),
        });
        self.register(Instrument::Gauge(Arc::clone(&cell)));
        Gauge(cell)
    }

    /// `bounds` are sorted and deduplicated before use.
    pub fn histogram(
        &self,
        name: &str,
        description: &str,
        unit: &str,
        attributes: Vec<KeyValue>,
        mut bounds: Vec<f64>,
    ) -> Histogram {
        bounds.retain(|b| b.is_finite());
        bounds.sort_by(|a, b| a.total_cmp(b));
        bounds.dedup();
        let cell = Arc::new(HistogramCell {
            info: info(name, description, unit, attributes),
            state: Mutex::new(HistogramState::new(bounds.len() + 1, SystemTime::now())),
            bounds,
        });
        self.register(Instrument::Histogram(Arc::clone(&cell)));
        Histogram(cell)
    }

    fn register(&self, instrument: Instrument) {
        self.instruments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(instrument);
    }

    /// Reads every instrument once, advancing delta state.
    pub fn collect(&self) -> Vec<Metric> {
        let instruments = self.instruments.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let now = SystemTime::now();
        instruments
            .iter()
            .filter_map(|instrument| match instrument {
                Instrument::Counter(cell) => self.collect_counter(cell, now),
                Instrument::Gauge(cell) => collect_gauge(cell, now),
                Instrument::Histogram(cell) => self.collect_histogram(cell, now),
            })
            .collect()
    }

    fn collect_counter(&self, cell: &CounterCell, now: SystemTime) -> Option<Metric> {
        let total = cell.total.load(Ordering::Relaxed);
        let mut reported = cell.reported.lock().unwrap_or_else(PoisonError::into_inner);
        let (value, start_time) = match self.temporality {
            Temporality::Cumulative => (total, cell.created),
            Temporality::Delta => {
                let delta = total.saturating_sub(reported.0);
                if delta == 0 {
                    return None;
                }
                (delta, reported.1)
            }
        };
        *reported = (total, now);

        let point = NumberDataPoint {
            attributes: cell.info.attributes.clone(),
            start_time,
            time: now,
            value: NumberValue::Int(i64::try_from(value).unwrap_or(i64::MAX)),
            flags: 0,
        };
        Some(cell.info.metric(MetricData::Sum {
            points: vec![point],
            temporality: Some(self.temporality),
            monotonic: true,
        }))
    }

    fn collect_histogram(&self, cell: &HistogramCell, now: SystemTime) -> Option<Metric> {
        let mut state = cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = match self.temporality {
            Temporality::Delta => {
                if state.count == 0 {
                    state.start = now;
                    return None;
                }
                std::mem::replace(&mut *state, HistogramState::new(cell.bounds.len() + 1, now))
            }
            Temporality::Cumulative => state.clone(),
        };
        drop(state);

        let point = HistogramDataPoint {
            attributes: cell.info.attributes.clone(),
            start_time: snapshot.start,
            time: now,
            count: snapshot.count,
            sum: Some(snapshot.sum),
            bucket_counts: snapshot.bucket_counts,
            explicit_bounds: cell.bounds.clone(),
            min: snapshot.min,
            max: snapshot.max,
            flags: 0,
        };
        Some(cell.info.metric(MetricData::Histogram {
            points: vec![point],
            temporality: Some(self.temporality),
        }))
    }
}

fn collect_gauge(cell: &GaugeCell, now: SystemTime) -> Option<Metric> {
    let value = (*cell.value.lock().unwrap_or_else(PoisonError::into_inner))?;
    let point = NumberDataPoint {
        attributes: cell.info.attributes.clone(),
        start_time: now,
        time: now,
        value: NumberValue::Double(value),
        flags: 0,
    };
    Some(cell.info.metric(MetricData::Gauge(vec![point])))
}

fn info(name: &str, description: &str, unit: &str, attributes: Vec<KeyValue>) -> InstrumentInfo {
    InstrumentInfo {
        name: name.to_string(),
        description: description.to_string(),
        unit: unit.to_string(),
        attributes,
    }
}

impl<W> Producer<W> for Meter
where
    W: BatchWriter<Item = Metric>,
{
    fn name(&self) -> &str {
        &self.scope.name
    }

    fn write_to(&self, writer: &mut W) -> Result<bool> {
        let metrics = self.collect();
        if metrics.is_empty() {
            return Ok(false);
        }

        writer.begin_instrumentation_scope(&self.scope)?;
        for metric in &metrics {
            writer.write_item(metric)?;
        }
        writer.end_instrumentation_scope()?;
        Ok(true)
    }
}
