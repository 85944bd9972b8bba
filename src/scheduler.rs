//! Periodic export on a dedicated background thread
//!
//! Lifecycle, stored in one atomic and advanced with compare-and-swap:
//!
//! ```text
//! NotStarted --start--> Running --shutdown--> ShutdownRequested --final cycle--> ShutDown --drop--> Disposed
//! ```
//!
//! The worker thread owns a current-thread tokio runtime, so export futures and
//! their timers never depend on the caller's executor.

use crate::cancellation::ExportDeadline;
use crate::config::Config;
use crate::errors::{ExportError, Result};
use crate::exporter::{BatchExport, ExportResult};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const SHUTDOWN_REQUESTED: u8 = 2;
const SHUT_DOWN: u8 = 3;
const DISPOSED: u8 = 4;

/// Upper bound on how long `Drop` waits for the final cycle.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const MIN_POLL: Duration = Duration::from_millis(1);
const MAX_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running,
    ShutdownRequested,
    ShutDown,
    Disposed,
}

impl SchedulerState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            NOT_STARTED => SchedulerState::NotStarted,
            RUNNING => SchedulerState::Running,
            SHUTDOWN_REQUESTED => SchedulerState::ShutdownRequested,
            SHUT_DOWN => SchedulerState::ShutDown,
            _ => SchedulerState::Disposed,
        }
    }
}

enum Command {
    /// Run a cycle now; the result goes to the sender if one is waiting.
    Flush(Option<SyncSender<ExportResult>>),
    Shutdown,
}

/// Counters shared with the worker thread.
#[derive(Debug, Default)]
struct CycleStats {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Runs a [`BatchExport`] every `interval` until shut down.
pub struct PeriodicExportScheduler {
    name: String,
    interval: Duration,
    timeout: Option<Duration>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    exporter: Mutex<Option<Box<dyn BatchExport>>>,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: Arc<OnceLock<ThreadId>>,
    stats: Arc<CycleStats>,
}

impl PeriodicExportScheduler {
    /// `interval` is clamped to at least 1ms. `timeout` of `None` leaves cycles
    /// bounded only by the scheduler's cancellation token.
    pub fn new(exporter: impl BatchExport + 'static, interval: Duration, timeout: Option<Duration>) -> Self {
        Self {
            name: exporter.name().to_string(),
            interval: interval.max(Duration::from_millis(1)),
            timeout,
            state: Arc::new(AtomicU8::new(NOT_STARTED)),
            cancel: CancellationToken::new(),
            exporter: Mutex::new(Some(Box::new(exporter))),
            commands: Mutex::new(None),
            worker: Mutex::new(None),
            worker_id: Arc::new(OnceLock::new()),
            stats: Arc::new(CycleStats::default()),
        }
    }

    pub fn from_config(exporter: impl BatchExport + 'static, config: &Config) -> Self {
        Self::new(exporter, config.export_interval(), config.export_timeout())
    }

    /// Links every cycle to `token`: cancelling it cancels the cycle in flight
    /// and every later one.
    pub fn with_cancellation(mut self, token: &CancellationToken) -> Self {
        self.cancel = token.child_token();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn completed_cycles(&self) -> u64 {
        self.stats.completed.load(Ordering::Relaxed)
    }

    pub fn failed_cycles(&self) -> u64 {
        self.stats.failed.load(Ordering::Relaxed)
    }

    /// Starts the worker thread. Returns `Ok(false)` if the scheduler was
    /// already started or shut down.
    pub fn start(&self) -> Result<bool> {
        if self
            .state
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        let Some(exporter) = self.exporter.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            self.state.store(SHUT_DOWN, Ordering::Release);
            return Err(ExportError::SchedulerState(format!(
                "{}: exporter already consumed",
                self.name
            )));
        };

        let (tx, rx) = mpsc::unbounded_channel();
        *self.commands.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let worker = Worker {
            name: self.name.clone(),
            exporter,
            commands: rx,
            state: Arc::clone(&self.state),
            cancel: self.cancel.clone(),
            interval: self.interval,
            timeout: self.timeout,
            stats: Arc::clone(&self.stats),
            waiting: None,
            final_cycle_started: false,
        };
        let worker_id = Arc::clone(&self.worker_id);

        let spawned = thread::Builder::new()
            .name(format!("otlp-export-{}", self.name))
            .spawn(move || {
                let _ = worker_id.set(thread::current().id());
                worker.run();
            });

        match spawned {
            Ok(handle) => {
                let _ = self.worker_id.set(handle.thread().id());
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
                info!(
                    "Started export scheduler {} (interval {}ms, timeout {:?})",
                    self.name,
                    self.interval.as_millis(),
                    self.timeout
                );
                Ok(true)
            }
            Err(e) => {
                self.state.store(SHUT_DOWN, Ordering::Release);
                error!("Failed to spawn export thread for {}: {}", self.name, e);
                Err(ExportError::Io(e))
            }
        }
    }

    /// Wakes the worker for an immediate cycle without waiting for it.
    pub fn flush(&self) -> bool {
        self.send(Command::Flush(None))
    }

    /// Runs a cycle now and waits up to `timeout` for its result.
    ///
    /// Returns `None` if the scheduler is not running, the wait timed out, or
    /// this is called from the export thread itself.
    pub fn force_flush(&self, timeout: Duration) -> Option<ExportResult> {
        if self.on_worker_thread() {
            warn!("force_flush called from inside an export on {}, ignoring", self.name);
            return None;
        }

        let (reply, result) = sync_channel(1);
        if !self.send(Command::Flush(Some(reply))) {
            return None;
        }
        result.recv_timeout(timeout).ok()
    }

    /// Stops the scheduler after one final cycle. Returns `true` once the
    /// worker has finished, `false` if `timeout` elapsed first.
    ///
    /// Safe to call repeatedly and from any thread. Called from inside an
    /// export it only requests shutdown and returns `false` immediately.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        match self
            .state
            .compare_exchange(RUNNING, SHUTDOWN_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!("Shutdown requested for export scheduler {}", self.name);
                self.send(Command::Shutdown);
            }
            Err(NOT_STARTED) => {
                if self
                    .state
                    .compare_exchange(NOT_STARTED, SHUT_DOWN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return true;
                }
            }
            Err(_) => {}
        }

        if self.on_worker_thread() {
            return false;
        }

        if !self.wait_for_shutdown(timeout) {
            warn!(
                "Export scheduler {} did not stop within {}ms, cancelling in-flight export",
                self.name,
                timeout.as_millis()
            );
            self.cancel.cancel();
            return false;
        }

        if let Some(handle) = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take() {
            if handle.join().is_err() {
                error!("Export thread for {} panicked", self.name);
            }
            info!("Export scheduler {} shut down", self.name);
        }
        true
    }

    fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut poll = MIN_POLL;
        loop {
            if self.state.load(Ordering::Acquire) >= SHUT_DOWN {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL);
        }
    }

    fn send(&self, command: Command) -> bool {
        if self.state.load(Ordering::Acquire) > SHUTDOWN_REQUESTED {
            return false;
        }
        match self.commands.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(tx) => tx.send(command).is_ok(),
            None => false,
        }
    }

    fn on_worker_thread(&self) -> bool {
        self.worker_id.get() == Some(&thread::current().id())
    }
}

impl Drop for PeriodicExportScheduler {
    fn drop(&mut self) {
        if self.state.load(Ordering::Acquire) < SHUT_DOWN {
            self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
        }
        self.state.store(DISPOSED, Ordering::Release);
    }
}

/// Everything the export thread owns.
struct Worker {
    name: String,
    exporter: Box<dyn BatchExport>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
    cancel: CancellationToken,
    interval: Duration,
    timeout: Option<Duration>,
    stats: Arc<CycleStats>,
    /// Reply channel of the `force_flush` whose cycle is in flight.
    waiting: Option<SyncSender<ExportResult>>,
    final_cycle_started: bool,
}

/// Publishes `SHUT_DOWN` when the export thread exits, including by unwinding.
struct Stopped(Arc<AtomicU8>);

impl Drop for Stopped {
    fn drop(&mut self) {
        self.0.fetch_max(SHUT_DOWN, Ordering::AcqRel);
    }
}

impl Worker {
    fn run(mut self) {
        let _stopped = Stopped(Arc::clone(&self.state));
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build export runtime: {}", e);
                return;
            }
        };

        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(self.run_loop()))) {
                Ok(()) => break,
                Err(payload) => {
                    let err = ExportError::panicked(self.name.as_str(), payload.as_ref());
                    self.stats.completed.fetch_add(1, Ordering::Relaxed);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!("{}: export cycle failed: {}", self.name, err);
                    if let Some(reply) = self.waiting.take() {
                        let _ = reply.try_send(ExportResult::Failure(err));
                    }
                    if self.final_cycle_started {
                        self.reject_pending();
                        break;
                    }
                }
            }
        }
    }

    async fn run_loop(&mut self) {
        if !self.final_cycle_started {
            let mut next_cycle = tokio::time::Instant::now() + self.interval;

            while self.state.load(Ordering::Acquire) == RUNNING {
                let command = tokio::select! {
                    _ = tokio::time::sleep_until(next_cycle) => None,
                    command = self.commands.recv() => Some(command.unwrap_or(Command::Shutdown)),
                };

                self.waiting = match command {
                    Some(Command::Shutdown) => break,
                    Some(Command::Flush(reply)) => reply,
                    None => None,
                };

                let started = tokio::time::Instant::now();
                let result = self.cycle().await;
                next_cycle = started + self.interval;
                if let Some(reply) = self.waiting.take() {
                    let _ = reply.try_send(result);
                }
            }

            debug!("{}: running final export cycle", self.name);
            self.final_cycle_started = true;
            self.cycle().await;
        }
        self.reject_pending();
    }

    /// Fails every queued `force_flush` once no more cycles will run.
    fn reject_pending(&mut self) {
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Flush(Some(reply)) = command {
                let _ = reply.try_send(ExportResult::Failure(ExportError::SchedulerState(
                    "scheduler shut down".to_string(),
                )));
            }
        }
    }

    async fn cycle(&mut self) -> ExportResult {
        let deadline = ExportDeadline::link(Some(&self.cancel), self.timeout);
        let token = deadline.token().clone();

        let result = tokio::select! {
            result = self.exporter.export(&token) => result,
            _ = token.cancelled() => ExportResult::Failure(ExportError::Cancelled),
        };

        let result = match result {
            ExportResult::Failure(e) if e.is_cancellation() => {
                ExportResult::Failure(deadline.cause().unwrap_or(e))
            }
            other => other,
        };

        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        match &result {
            ExportResult::Success { items: 0, .. } => debug!("{}: export cycle had nothing to send", self.name),
            ExportResult::Success { items, bytes } => {
                info!("{}: exported {} items ({} bytes)", self.name, items, bytes)
            }
            ExportResult::Failure(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!("{}: export cycle failed: {}", self.name, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl BatchExport for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn export(&mut self, _cancel: &CancellationToken) -> ExportResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                ExportResult::Failure(ExportError::Transport("collector down".to_string()))
            } else {
                ExportResult::Success { items: 0, bytes: 0 }
            }
        }
    }

    fn counting(fail: bool) -> (Counting, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                calls: Arc::clone(&calls),
                fail,
            },
            calls,
        )
    }

    /// Never finishes unless cancelled.
    struct Stuck;

    #[async_trait]
    impl BatchExport for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn export(&mut self, _cancel: &CancellationToken) -> ExportResult {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ExportResult::Success { items: 0, bytes: 0 }
        }
    }

    #[test]
    fn test_runs_cycles_on_interval() {
        let (exporter, calls) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_millis(50), None);
        assert!(scheduler.start().unwrap());

        let cycles = 6;
        thread::sleep(Duration::from_millis(50 * cycles + 150));
        assert!(
            calls.load(Ordering::SeqCst) >= cycles as usize - 1,
            "only {} cycles ran",
            calls.load(Ordering::SeqCst)
        );
        assert!(scheduler.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn test_start_twice_is_noop() {
        let (exporter, _) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_secs(60), None);
        assert_eq!(scheduler.state(), SchedulerState::NotStarted);
        assert!(scheduler.start().unwrap());
        assert!(!scheduler.start().unwrap());
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(scheduler.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn test_shutdown_runs_final_cycle_and_is_idempotent() {
        let (exporter, calls) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_secs(60), None);
        scheduler.start().unwrap();

        assert!(scheduler.shutdown(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);

        assert!(scheduler.shutdown(Duration::from_secs(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.flush());
        assert!(!scheduler.start().unwrap());
    }

    #[test]
    fn test_shutdown_before_start() {
        let (exporter, calls) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_millis(10), None);
        assert!(scheduler.shutdown(Duration::from_millis(10)));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);
        assert!(!scheduler.start().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_flush_wakes_worker_early() {
        let (exporter, calls) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_secs(60), None);
        assert!(!scheduler.flush());
        scheduler.start().unwrap();

        assert!(scheduler.flush());
        thread::sleep(Duration::from_millis(200));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let result = scheduler.force_flush(Duration::from_secs(2));
        assert!(matches!(result, Some(ExportResult::Success { .. })));
        assert_eq!(scheduler.completed_cycles(), 2);
        scheduler.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_failed_cycles_do_not_stop_scheduler() {
        let (exporter, calls) = counting(true);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_millis(20), None);
        scheduler.start().unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(scheduler.failed_cycles() >= 3);
        scheduler.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_export_timeout_cancels_cycle() {
        let scheduler = PeriodicExportScheduler::new(Stuck, Duration::from_secs(60), Some(Duration::from_millis(50)));
        scheduler.start().unwrap();

        let started = Instant::now();
        let result = scheduler.force_flush(Duration::from_secs(2));
        assert!(matches!(result, Some(ExportResult::Failure(ExportError::TimedOut))));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(scheduler.shutdown(Duration::from_secs(2)));
    }

    #[test]
    fn test_external_cancellation_is_reported_as_cancelled() {
        let token = CancellationToken::new();
        let scheduler = PeriodicExportScheduler::new(Stuck, Duration::from_secs(60), Some(Duration::from_secs(30)))
            .with_cancellation(&token);
        scheduler.start().unwrap();

        let canceller = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let result = scheduler.force_flush(Duration::from_secs(2));
        assert!(matches!(result, Some(ExportResult::Failure(ExportError::Cancelled))));
        assert!(scheduler.shutdown(Duration::from_secs(2)));
    }

    struct ShutsDownItself {
        scheduler: Arc<OnceLock<Arc<PeriodicExportScheduler>>>,
        returned_in: Arc<Mutex<Option<Duration>>>,
    }

    #[async_trait]
    impl BatchExport for ShutsDownItself {
        fn name(&self) -> &str {
            "self-stopping"
        }

        async fn export(&mut self, _cancel: &CancellationToken) -> ExportResult {
            if let Some(scheduler) = self.scheduler.get() {
                let started = Instant::now();
                let finished = scheduler.shutdown(Duration::from_secs(10));
                assert!(!finished);
                self.returned_in.lock().unwrap().get_or_insert(started.elapsed());
            }
            ExportResult::Success { items: 0, bytes: 0 }
        }
    }

    #[test]
    fn test_shutdown_from_inside_export_does_not_deadlock() {
        let slot = Arc::new(OnceLock::new());
        let returned_in = Arc::new(Mutex::new(None));
        let exporter = ShutsDownItself {
            scheduler: Arc::clone(&slot),
            returned_in: Arc::clone(&returned_in),
        };

        let scheduler = Arc::new(PeriodicExportScheduler::new(exporter, Duration::from_millis(10), None));
        let _ = slot.set(Arc::clone(&scheduler));
        scheduler.start().unwrap();

        assert!(scheduler.shutdown(Duration::from_secs(2)));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);

        let returned_in = returned_in.lock().unwrap().expect("export should have run");
        assert!(returned_in < Duration::from_secs(1));
    }

    /// Panics on every other call, starting with the first.
    struct Flaky {
        calls: Arc<AtomicUsize>,
        every_call: bool,
    }

    #[async_trait]
    impl BatchExport for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn export(&mut self, _cancel: &CancellationToken) -> ExportResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.every_call || call % 2 == 0 {
                panic!("export {} blew up", call);
            }
            ExportResult::Success { items: 0, bytes: 0 }
        }
    }

    #[test]
    fn test_panicking_cycle_fails_without_stopping_scheduler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exporter = Flaky {
            calls: Arc::clone(&calls),
            every_call: false,
        };
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_secs(60), None);
        scheduler.start().unwrap();

        match scheduler.force_flush(Duration::from_secs(2)) {
            Some(ExportResult::Failure(ExportError::Panicked { source, message })) => {
                assert_eq!(source, "flaky");
                assert_eq!(message, "export 0 blew up");
            }
            other => panic!("expected a panicked cycle, got {:?}", other),
        }
        assert_eq!(scheduler.state(), SchedulerState::Running);

        let result = scheduler.force_flush(Duration::from_secs(2));
        assert!(matches!(result, Some(ExportResult::Success { .. })));
        assert_eq!(scheduler.completed_cycles(), 2);
        assert_eq!(scheduler.failed_cycles(), 1);

        // The final cycle panics too.
        assert!(scheduler.shutdown(Duration::from_secs(2)));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.failed_cycles(), 2);
    }

    #[test]
    fn test_always_panicking_export_still_shuts_down_promptly() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exporter = Flaky {
            calls: Arc::clone(&calls),
            every_call: true,
        };
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_millis(10), None);
        scheduler.start().unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert!(scheduler.failed_cycles() >= 2);
        assert!(matches!(
            scheduler.force_flush(Duration::from_secs(2)),
            Some(ExportResult::Failure(ExportError::Panicked { .. }))
        ));

        let started = Instant::now();
        assert!(scheduler.shutdown(Duration::from_secs(2)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.state(), SchedulerState::ShutDown);
        assert_eq!(scheduler.completed_cycles(), calls.load(Ordering::SeqCst) as u64);
    }

    #[test]
    fn test_drop_shuts_down() {
        let (exporter, calls) = counting(false);
        let scheduler = PeriodicExportScheduler::new(exporter, Duration::from_secs(60), None);
        scheduler.start().unwrap();
        drop(scheduler);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
