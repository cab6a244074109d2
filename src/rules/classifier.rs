//! Log line classification against the keyword rule table.
//!
//! Lines are normalized (ANSI escapes stripped, lowercased, whitespace
//! removed) and matched against every rule at once with an Aho-Corasick
//! automaton. Windowed rules consult the [`SlidingWindowDetector`].

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tokio::time::Instant;

use super::rule::{KeywordRuleSet, RuleCategory, RuleId};
use super::window::SlidingWindowDetector;
use crate::serial::LogLine;

fn ansi_escape() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("static ANSI pattern is valid")
    })
}

/// Remove ANSI escape sequences, leaving the printable text intact.
pub fn strip_ansi(text: &str) -> String {
    ansi_escape().replace_all(text, "").into_owned()
}

/// Normalize text for keyword matching: strip ANSI, lowercase, drop whitespace.
pub fn normalize(text: &str) -> String {
    strip_ansi(text)
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Severity of a classification result, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VerdictKind {
    Unmatched,
    Info,
    Success,
    /// Error or Critical match below its burst threshold.
    Match,
    Exception,
    ErrorBurst,
    CriticalBurst,
}

impl VerdictKind {
    pub const fn is_burst(self) -> bool {
        matches!(self, Self::ErrorBurst | Self::CriticalBurst)
    }
}

/// One rule that matched a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleHit {
    pub rule: RuleId,
    pub category: RuleCategory,
    /// Events inside the rule's window after this hit (1 for non-windowed rules).
    pub count: usize,
    pub kind: VerdictKind,
}

/// Classification result for a single line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub kind: VerdictKind,
    /// The hit that determined `kind`.
    pub top: Option<RuleHit>,
    /// Every rule that matched, in rule order.
    pub hits: Vec<RuleHit>,
}

impl Verdict {
    fn unmatched() -> Self {
        Self {
            kind: VerdictKind::Unmatched,
            top: None,
            hits: Vec::new(),
        }
    }

    pub fn is_burst(&self) -> bool {
        self.kind.is_burst()
    }

    /// True when any matching rule has the given category.
    pub fn matched(&self, category: RuleCategory) -> bool {
        self.hits.iter().any(|h| h.category == category)
    }

    pub fn matched_rule(&self, rule: RuleId) -> bool {
        self.hits.iter().any(|h| h.rule == rule)
    }
}

/// Classifies log lines, owning the detector state for windowed rules.
pub struct LineClassifier {
    rules: Arc<KeywordRuleSet>,
    detector: SlidingWindowDetector,
}

impl LineClassifier {
    pub fn new(rules: Arc<KeywordRuleSet>) -> Self {
        let mut detector = SlidingWindowDetector::new();
        for rule in rules.iter().filter(|r| r.category.is_windowed()) {
            detector.register(rule.id, rule.window);
        }

        Self { rules, detector }
    }

    pub fn rules(&self) -> &Arc<KeywordRuleSet> {
        &self.rules
    }

    /// Clear every sliding window so a new monitoring phase starts from zero.
    pub fn reset(&mut self) {
        self.detector.clear_all();
    }

    /// Current window count of a rule.
    pub fn window_count(&self, rule: RuleId) -> usize {
        self.detector.count(rule)
    }

    pub fn classify(&mut self, line: &LogLine) -> Verdict {
        self.classify_normalized(&line.cleaned, line.received_at)
    }

    /// Classify raw text received at `at`.
    pub fn classify_text(&mut self, text: &str, at: Instant) -> Verdict {
        let cleaned = normalize(text);
        self.classify_normalized(&cleaned, at)
    }

    fn classify_normalized(&mut self, cleaned: &str, at: Instant) -> Verdict {
        if cleaned.is_empty() {
            return Verdict::unmatched();
        }

        let mut matched: Vec<RuleId> = self
            .rules
            .matcher()
            .find_overlapping_iter(cleaned)
            .map(|m| m.pattern().as_usize())
            .collect();
        if matched.is_empty() {
            return Verdict::unmatched();
        }
        matched.sort_unstable();
        matched.dedup();

        let mut verdict = Verdict::unmatched();
        for id in matched {
            let Some(rule) = self.rules.get(id) else {
                continue;
            };

            let (count, kind) = match rule.category {
                RuleCategory::Info => (1, VerdictKind::Info),
                RuleCategory::Success => (1, VerdictKind::Success),
                RuleCategory::Exception => (1, VerdictKind::Exception),
                RuleCategory::Error | RuleCategory::Critical => {
                    let count = self.detector.add(id, at);
                    let kind = match (count >= rule.threshold, rule.category) {
                        (true, RuleCategory::Critical) => VerdictKind::CriticalBurst,
                        (true, _) => VerdictKind::ErrorBurst,
                        (false, _) => VerdictKind::Match,
                    };
                    (count, kind)
                }
            };

            let hit = RuleHit {
                rule: id,
                category: rule.category,
                count,
                kind,
            };
            if kind > verdict.kind {
                verdict.kind = kind;
                verdict.top = Some(hit);
            }
            verdict.hits.push(hit);
        }

        verdict
    }
}
