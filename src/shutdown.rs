//! Termination authority for a soak run.
//!
//! Every exit path (completed budget, user interrupt, burst abort,
//! unrecoverable reconnect) funnels through [`StopController`], which releases
//! the relay, closes both ports, flushes the logs and prints the summary.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::cycle::{BurstReport, CycleError};
use crate::serial::{DeviceEndpoint, RelayActuator};
use crate::telemetry::{EntryKind, StatsRecorder};

/// Lifecycle of the stop controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Running,
    /// A stop was requested; the controller will stop at the next boundary.
    Requested,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Normal completion or user interrupt.
    Shutdown,
    /// Burst, unrecoverable reconnect or relay fault.
    Abort,
}

/// Result of the single termination performed by [`StopController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub kind: StopKind,
    pub reason: String,
    /// Set when a rule burst triggered the abort.
    pub burst: Option<BurstReport>,
    pub summary: String,
    /// Whether the final release command was written successfully.
    pub relay_released: bool,
}

impl StopOutcome {
    pub fn exit_code(&self) -> u8 {
        match self.kind {
            StopKind::Shutdown => 0,
            StopKind::Abort => 1,
        }
    }
}

/// Coordinates the one-time, fail-safe teardown of a session.
pub struct StopController {
    relay: Arc<RelayActuator>,
    stats: Arc<StatsRecorder>,
    cancel: CancellationToken,
    state: Mutex<StopState>,
    outcome: tokio::sync::Mutex<Option<StopOutcome>>,
}

impl StopController {
    pub fn new(relay: Arc<RelayActuator>, stats: Arc<StatsRecorder>) -> Self {
        Self {
            relay,
            stats,
            cancel: CancellationToken::new(),
            state: Mutex::new(StopState::Running),
            outcome: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> StopState {
        *self.state.lock()
    }

    /// Ask the cycle loop to stop at its next state boundary.
    pub fn request_stop(&self) {
        {
            let mut state = self.state.lock();
            if *state == StopState::Running {
                *state = StopState::Requested;
            }
        }
        if !self.cancel.is_cancelled() {
            tracing::warn!("stop requested, finishing current phase");
            self.cancel.cancel();
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled by [`request_stop`](Self::request_stop).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Fatal termination. Exit code 1.
    pub async fn abort(&self, error: &CycleError, device: &mut dyn DeviceEndpoint) -> StopOutcome {
        let burst = match error {
            CycleError::Burst(report) => Some(report.clone()),
            _ => None,
        };
        self.finish(StopKind::Abort, error.to_string(), burst, device).await
    }

    /// Graceful termination. Exit code 0.
    pub async fn shutdown(&self, reason: &str, device: &mut dyn DeviceEndpoint) -> StopOutcome {
        self.finish(StopKind::Shutdown, reason.to_string(), None, device).await
    }

    async fn finish(
        &self,
        kind: StopKind,
        reason: String,
        burst: Option<BurstReport>,
        device: &mut dyn DeviceEndpoint,
    ) -> StopOutcome {
        let mut recorded = self.outcome.lock().await;
        if let Some(outcome) = recorded.as_ref() {
            tracing::debug!(requested = ?kind, "session already stopped");
            return outcome.clone();
        }
        *self.state.lock() = StopState::Stopping;

        let relay_released = match self.relay.set_power(false).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "final relay release failed, check DUT power manually");
                self.stats.note(EntryKind::Critical, &format!("final relay release failed: {e}"));
                false
            }
        };
        device.close().await;
        self.relay.close().await;

        match kind {
            StopKind::Abort => {
                tracing::error!(%reason, "session aborted");
                self.stats.mark_aborted(&reason);
                self.stats.note(EntryKind::Critical, &format!("ABORT: {reason}"));
            }
            StopKind::Shutdown => {
                tracing::info!(%reason, "session stopped");
                self.stats.note(EntryKind::Info, &format!("STOP: {reason}"));
            }
        }

        let summary = self.stats.summary();
        self.stats.note(EntryKind::Info, &format!("summary: {summary}"));
        if let Err(e) = self.stats.flush() {
            tracing::error!(error = %e, "final log flush failed");
        }
        tracing::info!(%summary, "session summary");

        let outcome = StopOutcome {
            kind,
            reason,
            burst,
            summary,
            relay_released,
        };
        *recorded = Some(outcome.clone());
        *self.state.lock() = StopState::Stopped;
        outcome
    }
}
