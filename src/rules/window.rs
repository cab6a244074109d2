//! Sliding-window rate detector shared by every windowed rule.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use super::rule::RuleId;

#[derive(Debug)]
struct Window {
    span: Duration,
    events: VecDeque<Instant>,
}

/// Counts rule events inside a per-rule trailing time window.
///
/// Timestamps are kept oldest-first. Eviction is lazy and happens on each
/// [`add`](Self::add); an event exactly `span` old is evicted.
#[derive(Debug, Default)]
pub struct SlidingWindowDetector {
    windows: HashMap<RuleId, Window>,
}

impl SlidingWindowDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule with its window span. Re-registering resets the rule.
    pub fn register(&mut self, rule: RuleId, span: Duration) {
        self.windows.insert(
            rule,
            Window {
                span,
                events: VecDeque::new(),
            },
        );
    }

    /// Record an event at `now` and return the number of events in the window.
    ///
    /// Unregistered rules get a zero-length window: only events sharing the
    /// same instant are counted together.
    pub fn add(&mut self, rule: RuleId, now: Instant) -> usize {
        let window = self.windows.entry(rule).or_insert_with(|| Window {
            span: Duration::ZERO,
            events: VecDeque::new(),
        });

        window.events.push_back(now);
        while let Some(&oldest) = window.events.front() {
            if oldest == now || now.saturating_duration_since(oldest) < window.span {
                break;
            }
            window.events.pop_front();
        }
        window.events.len()
    }

    /// Current count without recording an event.
    pub fn count(&self, rule: RuleId) -> usize {
        self.windows.get(&rule).map_or(0, |w| w.events.len())
    }

    /// Forget all events for one rule.
    pub fn clear(&mut self, rule: RuleId) {
        if let Some(window) = self.windows.get_mut(&rule) {
            window.events.clear();
        }
    }

    /// Forget all events for every rule.
    pub fn clear_all(&mut self) {
        for window in self.windows.values_mut() {
            window.events.clear();
        }
    }
}
