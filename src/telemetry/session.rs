//! Session-wide counters.

use serde::Serialize;

use crate::cycle::CycleOutcome;

/// Aggregate outcome of a soak run. Reset only by restarting the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestSession {
    pub total: u64,
    pub success: u64,
    pub failure: u64,
    /// Running tally of Exception matches, independent of cycle outcome.
    pub exception_count: u64,
    pub disconnect_count: u64,
    /// Lines that contained undecodable bytes.
    pub decode_losses: u64,
    pub aborted: bool,
    pub abort_reason: Option<String>,
}

impl TestSession {
    pub fn count_outcome(&mut self, outcome: CycleOutcome) {
        self.total += 1;
        match outcome {
            CycleOutcome::Success => self.success += 1,
            CycleOutcome::Failure => self.failure += 1,
            CycleOutcome::Aborted => {
                self.failure += 1;
                self.aborted = true;
            }
        }
    }

    /// Success ratio in `0.0..=1.0`; zero before the first cycle.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "total={} success={} failure={} exceptions={} disconnects={} decode_losses={} success_rate={}/{} ({:.1}%)",
            self.total,
            self.success,
            self.failure,
            self.exception_count,
            self.disconnect_count,
            self.decode_losses,
            self.success,
            self.total,
            self.success_rate() * 100.0,
        );
        if let Some(reason) = &self.abort_reason {
            out.push_str(&format!(" aborted: {reason}"));
        }
        out
    }
}
