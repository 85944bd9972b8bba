//! Per-cycle cancellation: an export timeout linked with a caller token

use crate::errors::ExportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cancellation scope for one export cycle.
///
/// The token fires when either the caller's token is cancelled or the timeout
/// elapses, whichever happens first. Dropping the deadline stops its timer, so
/// nothing leaks into the next cycle.
#[derive(Debug)]
pub struct ExportDeadline {
    token: CancellationToken,
    timed_out: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl ExportDeadline {
    /// Links `external` (if any) with a timer of `timeout` (if any).
    ///
    /// The timer is spawned on the current tokio runtime, so this must be called
    /// from within one when `timeout` is set.
    pub fn link(external: Option<&CancellationToken>, timeout: Option<Duration>) -> Self {
        let token = match external {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let timed_out = Arc::new(AtomicBool::new(false));

        let timer = timeout.map(|timeout| {
            let token = token.clone();
            let timed_out = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if !token.is_cancelled() {
                    timed_out.store(true, Ordering::Release);
                    token.cancel();
                }
            })
        });

        Self {
            token,
            timed_out,
            timer,
        }
    }

    /// Token to hand to the export; it observes both triggers.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Which trigger fired, or `None` while the cycle may still run.
    pub fn cause(&self) -> Option<ExportError> {
        if !self.token.is_cancelled() {
            return None;
        }
        if self.timed_out.load(Ordering::Acquire) {
            Some(ExportError::TimedOut)
        } else {
            Some(ExportError::Cancelled)
        }
    }
}

impl Drop for ExportDeadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
