//! Line classification throughput benchmarks.

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::time::Instant;

use relay_soak::rules::{default_rule_specs, normalize, KeywordRuleSet, LineClassifier, RuleCategory, RuleSpec};

/// A boot log mix: mostly noise, a few markers and errors.
fn boot_log(lines: usize) -> Vec<String> {
    let templates = [
        "[I/sys] clock init done, hclk=168000000",
        "\x1b[32m[I/app] motor power on\x1b[0m",
        "[D/voice] voice_msgnum=12",
        "[W/app] param is invalid, fallback to default",
        "[I/pm] pm_acc_tim=3021",
        "[E/app] assertion failed at function motor_ctrl_step",
        "[I/sys] power_off_system",
    ];
    (0..lines).map(|i| templates[i % templates.len()].to_string()).collect()
}

/// Default rules plus `extra` filler rules that never match.
fn rule_set(extra: usize) -> Arc<KeywordRuleSet> {
    let mut specs = default_rule_specs();
    specs.extend((0..extra).map(|i| RuleSpec::new(&format!("never_seen_keyword_{i}"), RuleCategory::Info)));
    Arc::new(KeywordRuleSet::compile(&specs).expect("bench rules compile"))
}

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify_text");
    let lines = boot_log(1_000);
    group.throughput(Throughput::Elements(lines.len() as u64));

    for extra in [0usize, 50, 500] {
        let rules = rule_set(extra);
        group.bench_with_input(BenchmarkId::new("rules", rules.len()), &lines, |b, lines| {
            let mut classifier = LineClassifier::new(rules.clone());
            let start = Instant::now();
            b.iter(|| {
                classifier.reset();
                for (i, line) in lines.iter().enumerate() {
                    let at = start + Duration::from_millis(i as u64 * 5);
                    black_box(classifier.classify_text(black_box(line), at));
                }
            })
        });
    }

    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    let long = "[D/trace] 0123456789abcdef ".repeat(16);
    for (name, text) in [
        ("plain", "[I/sys] clock init done, hclk=168000000"),
        ("ansi", "\x1b[31m[E/motor] reg_addr(00) is unviald\x1b[0m"),
        ("long", long.as_str()),
    ] {
        group.throughput(Throughput::Bytes(text.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &text, |b, text| {
            b.iter(|| normalize(black_box(text)))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify, bench_normalize);
criterion_main!(benches);
