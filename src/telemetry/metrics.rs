//! Counters and gauges published through the `metrics` facade.
//!
//! No exporter is installed by the harness itself; an embedding process may
//! install one before calling [`init_metrics`].

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::cycle::CycleOutcome;
use crate::rules::RuleCategory;

/// Register metric descriptions. Safe to call more than once.
pub fn init_metrics() {
    describe_counter!("relay_soak_cycles_total", "Completed power cycles by outcome");
    describe_counter!("relay_soak_rule_matches_total", "Keyword rule matches by category");
    describe_counter!("relay_soak_disconnects_total", "Device port disconnects");
    describe_counter!("relay_soak_relay_faults_total", "Failed relay command writes");
    describe_counter!("relay_soak_decode_losses_total", "Lines with undecodable bytes");
    describe_gauge!("relay_soak_success_rate", "Running success ratio (0..1)");
    describe_histogram!("relay_soak_cycle_seconds", "Wall time per cycle");
}

pub fn record_cycle(outcome: CycleOutcome, seconds: f64) {
    counter!("relay_soak_cycles_total", "outcome" => outcome.as_str()).increment(1);
    histogram!("relay_soak_cycle_seconds").record(seconds);
}

pub fn record_rule_match(category: RuleCategory) {
    counter!("relay_soak_rule_matches_total", "category" => category.as_str()).increment(1);
}

pub fn record_disconnect() {
    counter!("relay_soak_disconnects_total").increment(1);
}

pub fn record_relay_fault() {
    counter!("relay_soak_relay_faults_total").increment(1);
}

pub fn record_decode_loss() {
    counter!("relay_soak_decode_losses_total").increment(1);
}

pub fn record_success_rate(rate: f64) {
    gauge!("relay_soak_success_rate").set(rate);
}
