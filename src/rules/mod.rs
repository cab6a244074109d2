//! Keyword rules, sliding-window rate detection and line classification.

pub mod classifier;
pub mod rule;
pub mod window;

pub use classifier::{normalize, strip_ansi, LineClassifier, RuleHit, Verdict, VerdictKind};
pub use rule::{default_rule_specs, KeywordRule, KeywordRuleSet, RuleCategory, RuleError, RuleId, RuleSpec};
pub use window::SlidingWindowDetector;
