//! Per-cycle state and the errors that end a session.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::rules::{RuleCategory, RuleId, Verdict};
use crate::serial::{LogLine, PortError, RelayError};

/// Phase of one power cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    PowerOn,
    Monitoring,
    PowerOff,
    Analyzing,
    /// Final for the process.
    Aborted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PowerOn => "power_on",
            Self::Monitoring => "monitoring",
            Self::PowerOff => "power_off",
            Self::Analyzing => "analyzing",
            Self::Aborted => "aborted",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_advance_to(self, next: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, next),
            (Idle, PowerOn)
                | (PowerOn, Monitoring | PowerOff)
                | (Monitoring, PowerOff)
                | (PowerOff, Analyzing)
                | (Analyzing, Idle)
                | (Idle | PowerOn | Monitoring | PowerOff | Analyzing, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Success,
    Failure,
    Aborted,
}

impl CycleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How Success-category markers decide a cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessMode {
    /// At least one Success marker appeared.
    #[default]
    Any,
    /// Every Success rule matched at least once.
    All,
}

/// The rule and window count behind an abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurstReport {
    pub rule: RuleId,
    pub pattern: String,
    pub category: RuleCategory,
    pub count: usize,
    pub threshold: usize,
    pub window: Duration,
}

impl fmt::Display for BurstReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} burst on \"{}\": {} matches within {:.1}s (threshold {})",
            self.category,
            self.pattern,
            self.count,
            self.window.as_secs_f64(),
            self.threshold
        )
    }
}

/// Conditions that move the state machine to `Aborted`.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{0}")]
    Burst(BurstReport),

    #[error("device reconnect failed {attempts} times in a row: {last}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        last: PortError,
    },

    #[error("relay left in unknown state: {0}")]
    RelayFault(#[from] RelayError),
}

/// One power cycle, owned by the controller until it is recorded.
#[derive(Debug)]
pub struct Cycle {
    pub index: u32,
    pub on_duration: Duration,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub state: CycleState,
    /// Lines seen this cycle; cleared when the cycle finishes.
    pub lines: Vec<LogLine>,
    pub line_count: usize,
    pub outcome: Option<CycleOutcome>,
    pub disconnects: u32,
    pub reconnect_failed: bool,
    pub relay_failed: bool,
    pub exceptions: u32,
    pub lossy_lines: u32,
    pub success_rules: BTreeSet<RuleId>,
    pub burst: Option<BurstReport>,
}

impl Cycle {
    pub fn new(index: u32, on_duration: Duration, started_at: Instant) -> Self {
        Self {
            index,
            on_duration,
            started_at,
            ended_at: None,
            state: CycleState::Idle,
            lines: Vec::new(),
            line_count: 0,
            outcome: None,
            disconnects: 0,
            reconnect_failed: false,
            relay_failed: false,
            exceptions: 0,
            lossy_lines: 0,
            success_rules: BTreeSet::new(),
            burst: None,
        }
    }

    pub fn advance(&mut self, next: CycleState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal cycle transition {} -> {}",
            self.state.as_str(),
            next.as_str()
        );
        tracing::trace!(index = self.index, from = self.state.as_str(), to = next.as_str(), "cycle transition");
        self.state = next;
    }

    /// Fold a classified line into the cycle tallies.
    pub fn observe(&mut self, line: LogLine, verdict: &Verdict) {
        if line.lossy {
            self.lossy_lines += 1;
        }
        for hit in &verdict.hits {
            match hit.category {
                RuleCategory::Exception => self.exceptions += 1,
                RuleCategory::Success => {
                    self.success_rules.insert(hit.rule);
                }
                _ => {}
            }
        }
        self.line_count += 1;
        self.lines.push(line);
    }

    /// Success/Failure per the success mode. Any disconnect fails the cycle.
    pub fn evaluate(&self, mode: SuccessMode, success_rules: &[RuleId]) -> CycleOutcome {
        if self.disconnects > 0 || self.reconnect_failed || self.relay_failed {
            return CycleOutcome::Failure;
        }
        let passed = match mode {
            SuccessMode::Any => !self.success_rules.is_empty(),
            SuccessMode::All => {
                !success_rules.is_empty() && success_rules.iter().all(|id| self.success_rules.contains(id))
            }
        };
        if passed {
            CycleOutcome::Success
        } else {
            CycleOutcome::Failure
        }
    }

    pub fn finish(&mut self, outcome: CycleOutcome, now: Instant) {
        self.outcome = Some(outcome);
        self.ended_at = Some(now);
        self.lines.clear();
    }

    pub fn elapsed(&self) -> Duration {
        self.ended_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }
}
