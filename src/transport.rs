//! Transmission boundary: hands finished batches to a collector

use crate::errors::{ExportError, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Which OTLP/HTTP route a transport posts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Traces,
    Metrics,
}

impl Signal {
    pub fn path(&self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
        }
    }
}

/// Receives encoded export requests.
///
/// The payload borrows the exporter's scratch buffer, so an implementation must
/// copy whatever it keeps past the call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn submit(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()>;

    /// Whether the receiving end accepts delta temporality.
    fn supports_delta(&self) -> bool {
        true
    }
}

/// Outcome of one POST, split by whether another attempt could help.
enum AttemptError {
    Retryable(ExportError),
    Fatal(ExportError),
}

/// OTLP/HTTP protobuf transport with bounded retry
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    timeout: Duration,
    max_retries: u32,
    retry_backoff_ms: u64,
    supports_delta: bool,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        signal: Signal,
        http_timeout: Duration,
        max_retries: u32,
        retry_backoff_ms: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(http_timeout)
            .user_agent(format!("otlp-batch-export/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(ExportError::Http)?;

        Ok(Self {
            client,
            url: format!("{}{}", endpoint.trim_end_matches('/'), signal.path()),
            timeout: http_timeout,
            max_retries,
            retry_backoff_ms,
            supports_delta: true,
        })
    }

    /// Declares that the collector behind this endpoint only takes cumulative data.
    pub fn with_delta_support(mut self, supports_delta: bool) -> Self {
        self.supports_delta = supports_delta;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }

    async fn send_attempt(&self, payload: &[u8]) -> std::result::Result<(), AttemptError> {
        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
            .body(payload.to_vec())
            .send();

        let response = match timeout(self.timeout, request).await {
            Err(_) => {
                return Err(AttemptError::Retryable(ExportError::Transport(
                    "Request timeout".to_string(),
                )));
            }
            Ok(Err(e)) if e.is_timeout() || e.is_connect() => {
                return Err(AttemptError::Retryable(ExportError::Http(e)));
            }
            Ok(Err(e)) => return Err(AttemptError::Fatal(ExportError::Http(e))),
            Ok(Ok(response)) => response,
        };

        self.handle_response(response).await
    }

    async fn handle_response(&self, response: Response) -> std::result::Result<(), AttemptError> {
        let status = response.status();

        if status.is_success() {
            debug!("Collector at {} accepted batch", self.url);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());

        let message = match status.as_u16() {
            400 => format!("Collector rejected batch as malformed: {}", body),
            401 => format!("Unauthorized: {}", body),
            403 => format!("Forbidden: {}", body),
            404 => format!("No OTLP receiver at {}: {}", self.url, body),
            413 => format!("Batch too large for collector: {}", body),
            429 => format!("Rate limited by collector: {}", body),
            500..=599 => format!("Collector server error {}: {}", status, body),
            _ => format!("Unexpected response {}: {}", status, body),
        };

        let err = ExportError::Transport(message);
        if is_retryable_status(status) {
            Err(AttemptError::Retryable(err))
        } else {
            Err(AttemptError::Fatal(err))
        }
    }
}

/// Throttling and server-side faults are worth another attempt; other client
/// errors will fail the same way again.
fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        debug!("Submitting {} bytes to {}", payload.len(), self.url);

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ExportError::Cancelled);
            }
            let outcome = tokio::select! {
                outcome = self.send_attempt(payload) => outcome,
                _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            };

            let err = match outcome {
                Ok(()) => {
                    if attempt > 0 {
                        info!("Submitted batch to {} on attempt {}", self.url, attempt + 1);
                    }
                    return Ok(());
                }
                Err(AttemptError::Fatal(e)) => {
                    error!("Collector at {} refused batch, not retrying: {}", self.url, e);
                    return Err(e);
                }
                Err(AttemptError::Retryable(e)) => e,
            };

            attempt += 1;
            if attempt > self.max_retries {
                error!(
                    "Failed to submit batch to {} after {} attempts: {}",
                    self.url,
                    self.max_retries + 1,
                    err
                );
                return Err(err);
            }

            let backoff = self.backoff(attempt);
            warn!(
                "Submit to {} failed (attempt {}), retrying in {}ms: {}",
                self.url,
                attempt,
                backoff.as_millis(),
                err
            );
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            }
        }
    }

    fn supports_delta(&self) -> bool {
        self.supports_delta
    }
}

/// Wraps a transport and keeps submit statistics.
pub struct MeteredTransport<T> {
    inner: T,
    metrics: TransportMetrics,
}

impl<T: Transport> MeteredTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            metrics: TransportMetrics::default(),
        }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn metrics(&self) -> TransportMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.metrics.reset();
    }
}

#[async_trait]
impl<T: Transport> Transport for MeteredTransport<T> {
    async fn submit(&self, payload: &[u8], cancel: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        let result = self.inner.submit(payload, cancel).await;
        self.metrics.record(&result, payload.len(), started.elapsed());
        result
    }

    fn supports_delta(&self) -> bool {
        self.inner.supports_delta()
    }
}

#[derive(Debug, Default)]
struct TransportMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cancelled: AtomicU64,
    bytes_sent: AtomicU64,
    durations: Mutex<DurationStats>,
}

#[derive(Debug, Default, Clone, Copy)]
struct DurationStats {
    total: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
}

impl TransportMetrics {
    fn record(&self, result: &Result<()>, bytes: usize, duration: Duration) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
            }
            Err(e) if e.is_cancellation() => {
                self.cancelled.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut stats = self.durations.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total += duration;
        stats.min = Some(stats.min.map_or(duration, |m| m.min(duration)));
        stats.max = Some(stats.max.map_or(duration, |m| m.max(duration)));
    }

    fn snapshot(&self) -> TransportMetricsSnapshot {
        let attempts = self.attempts.load(Ordering::Relaxed);
        let successes = self.successes.load(Ordering::Relaxed);
        let stats = *self.durations.lock().unwrap_or_else(PoisonError::into_inner);

        let success_rate = if attempts > 0 {
            (successes as f64 / attempts as f64) * 100.0
        } else {
            0.0
        };

        let avg_duration = if attempts > 0 {
            stats.total / attempts as u32
        } else {
            Duration::ZERO
        };

        TransportMetricsSnapshot {
            attempts,
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            success_rate,
            avg_duration_ms: avg_duration.as_millis() as u64,
            min_duration_ms: stats.min.map(|d| d.as_millis() as u64),
            max_duration_ms: stats.max.map(|d| d.as_millis() as u64),
        }
    }

    fn reset(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        *self.durations.lock().unwrap_or_else(PoisonError::into_inner) = DurationStats::default();
    }
}

/// Point-in-time copy of [`MeteredTransport`] statistics
#[derive(Debug, Clone)]
pub struct TransportMetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub bytes_sent: u64,
    pub success_rate: f64,
    pub avg_duration_ms: u64,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
}
