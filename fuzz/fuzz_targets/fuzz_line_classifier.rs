//! Fuzz target for log line classification.
//!
//! Arbitrary text must never panic the normalizer or the classifier,
//! and verdicts must stay consistent with their hits.

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use relay_soak::rules::{default_rule_specs, normalize, strip_ansi, KeywordRuleSet, LineClassifier, VerdictKind};
use tokio::time::Instant;

fuzz_target!(|data: &str| {
    let rules = match KeywordRuleSet::compile(&default_rule_specs()) {
        Ok(rules) => Arc::new(rules),
        Err(_) => return,
    };
    let mut classifier = LineClassifier::new(rules);

    let stripped = strip_ansi(data);
    assert!(stripped.len() <= data.len(), "stripping grew the line");

    let cleaned = normalize(data);
    assert!(!cleaned.chars().any(char::is_whitespace), "whitespace survived normalize");

    let verdict = classifier.classify_text(data, Instant::now());
    match verdict.top {
        None => {
            assert_eq!(verdict.kind, VerdictKind::Unmatched);
            assert!(verdict.hits.is_empty());
        }
        Some(top) => {
            assert_eq!(top.kind, verdict.kind);
            assert!(verdict.hits.iter().all(|h| h.kind <= verdict.kind));
        }
    }
});
