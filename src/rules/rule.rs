//! Declarative keyword rule table.
//!
//! Rules are loaded once at startup and never mutated. Patterns are stored in
//! normalized form (lowercase, whitespace removed) so they can be matched
//! against normalized log lines by plain substring containment.

use std::fmt;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};

use super::classifier::normalize;

/// Index of a rule inside its [`KeywordRuleSet`].
pub type RuleId = usize;

/// What a keyword match means for the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    /// Logged only.
    Info,
    /// Marker proving the DUT booted or shut down correctly.
    Success,
    /// Counted in the session tally, never aborts.
    Exception,
    /// Aborts the session when `threshold` matches land inside `window`.
    Error,
    /// Like `Error`, with a separate and usually tighter budget.
    Critical,
}

impl RuleCategory {
    /// Categories that feed the sliding-window detector.
    pub const fn is_windowed(self) -> bool {
        matches!(self, Self::Error | Self::Critical)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Success => "success",
            Self::Exception => "exception",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Config-file shape of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub pattern: String,
    pub category: RuleCategory,
    /// Sliding window length in seconds (Error/Critical only).
    #[serde(default)]
    pub window_secs: f64,
    /// Matches within the window that constitute a burst (Error/Critical only).
    #[serde(default = "default_threshold")]
    pub threshold: usize,
}

fn default_threshold() -> usize {
    1
}

impl RuleSpec {
    pub fn new(pattern: &str, category: RuleCategory) -> Self {
        Self {
            pattern: pattern.to_string(),
            category,
            window_secs: 0.0,
            threshold: 1,
        }
    }

    pub fn windowed(pattern: &str, category: RuleCategory, window_secs: f64, threshold: usize) -> Self {
        Self {
            pattern: pattern.to_string(),
            category,
            window_secs,
            threshold,
        }
    }
}

/// A compiled, immutable keyword rule.
#[derive(Debug, Clone, PartialEq)]
pub struct KeywordRule {
    pub id: RuleId,
    /// Pattern as written in the configuration.
    pub label: String,
    /// Normalized pattern used for matching.
    pub pattern: String,
    pub category: RuleCategory,
    pub window: Duration,
    pub threshold: usize,
}

/// Errors raised while compiling the rule table.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("rule table is empty")]
    Empty,
    #[error("rule {index}: pattern is empty after normalization")]
    EmptyPattern { index: usize },
    #[error("rule {index} ({pattern}): window must be positive, got {window_secs}s")]
    InvalidWindow { index: usize, pattern: String, window_secs: f64 },
    #[error("rule {index} ({pattern}): threshold must be at least 1")]
    InvalidThreshold { index: usize, pattern: String },
    #[error("failed to build keyword matcher: {0}")]
    Matcher(String),
}

/// The static table of keyword rules.
#[derive(Debug, Clone)]
pub struct KeywordRuleSet {
    rules: Vec<KeywordRule>,
    matcher: AhoCorasick,
}

impl KeywordRuleSet {
    /// Compile rule specs into a rule set, normalizing every pattern.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, RuleError> {
        if specs.is_empty() {
            return Err(RuleError::Empty);
        }

        let mut rules = Vec::with_capacity(specs.len());
        for (index, spec) in specs.iter().enumerate() {
            let pattern = normalize(&spec.pattern);
            if pattern.is_empty() {
                return Err(RuleError::EmptyPattern { index });
            }

            let (window, threshold) = if spec.category.is_windowed() {
                if !(spec.window_secs.is_finite() && spec.window_secs > 0.0) {
                    return Err(RuleError::InvalidWindow {
                        index,
                        pattern: spec.pattern.clone(),
                        window_secs: spec.window_secs,
                    });
                }
                if spec.threshold == 0 {
                    return Err(RuleError::InvalidThreshold {
                        index,
                        pattern: spec.pattern.clone(),
                    });
                }
                (Duration::from_secs_f64(spec.window_secs), spec.threshold)
            } else {
                (Duration::ZERO, 1)
            };

            rules.push(KeywordRule {
                id: index,
                label: spec.pattern.clone(),
                pattern,
                category: spec.category,
                window,
                threshold,
            });
        }

        let matcher = AhoCorasick::new(rules.iter().map(|r| r.pattern.as_str()))
            .map_err(|e| RuleError::Matcher(e.to_string()))?;
        Ok(Self { rules, matcher })
    }

    /// Automaton over the normalized patterns; pattern index equals [`RuleId`].
    pub fn matcher(&self) -> &AhoCorasick {
        &self.matcher
    }

    pub fn get(&self, id: RuleId) -> Option<&KeywordRule> {
        self.rules.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &KeywordRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules of the Success category.
    pub fn success_rules(&self) -> impl Iterator<Item = &KeywordRule> {
        self.rules.iter().filter(|r| r.category == RuleCategory::Success)
    }
}

/// Rule table used when no `[[rules]]` are configured.
///
/// Matches the firmware log vocabulary of the motor-controller DUT.
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec::windowed("[E/motor] reg_addr(00) is unviald", RuleCategory::Critical, 1.0, 3),
        RuleSpec::windowed("param is invalid", RuleCategory::Error, 3.0, 3),
        RuleSpec::new("assertion failed at function", RuleCategory::Exception),
        RuleSpec::new("motorpoweron", RuleCategory::Success),
        RuleSpec::new("pm_acc_tim", RuleCategory::Success),
        RuleSpec::new("power_off_system", RuleCategory::Success),
        RuleSpec::new("voice_msgnum", RuleCategory::Info),
        RuleSpec::new("voice_msgcutoff", RuleCategory::Info),
        RuleSpec::new("ui_pm_acc", RuleCategory::Info),
    ]
}
