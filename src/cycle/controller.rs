//! The power-cycle loop.
//!
//! One [`CycleController`] owns the device endpoint and the classifier and
//! drives every cycle through `Idle -> PowerOn -> Monitoring -> PowerOff ->
//! Analyzing`. Burst verdicts, exhausted reconnects and relay faults end the
//! session through the [`StopController`].

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;

use super::state::{BurstReport, Cycle, CycleError, CycleOutcome, CycleState, SuccessMode};
use crate::codec::{RegisterProbe, RegisterRequest};
use crate::rules::{KeywordRuleSet, LineClassifier, RuleHit, RuleId, VerdictKind};
use crate::serial::{DeviceEndpoint, LogLine, RelayActuator};
use crate::shutdown::{StopController, StopOutcome};
use crate::telemetry::{self, CycleSpan, EntryKind, SpanExt, StatsRecorder};

/// Cycle budget and phase timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Number of cycles to run; 0 runs until stopped.
    pub cycles: u32,
    pub on_min_secs: f64,
    pub on_max_secs: f64,
    /// Monitoring continues this long after power-off to catch shutdown lines.
    pub drain_secs: f64,
    /// Inter-cycle delay with the DUT unpowered.
    pub off_secs: f64,
    /// Release period before the first cycle.
    pub initial_off_secs: f64,
    pub poll_interval_ms: u64,
    pub success_mode: SuccessMode,
    /// Seed for on-time sampling; random when unset.
    pub seed: Option<u64>,
    pub register_probe: Option<RegisterRequest>,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            cycles: 10_000,
            on_min_secs: 2.0,
            on_max_secs: 5.0,
            drain_secs: 1.0,
            off_secs: 5.0,
            initial_off_secs: 2.0,
            poll_interval_ms: 10,
            success_mode: SuccessMode::Any,
            seed: None,
            register_probe: None,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl CycleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.clamp(1, 100))
    }

    pub fn drain(&self) -> Duration {
        secs(self.drain_secs)
    }

    pub fn off(&self) -> Duration {
        secs(self.off_secs)
    }

    pub fn initial_off(&self) -> Duration {
        secs(self.initial_off_secs)
    }

    fn is_last(&self, index: u32) -> bool {
        self.cycles != 0 && index >= self.cycles
    }
}

/// How a cycle left the state machine without aborting.
enum CycleEnd {
    Completed(CycleOutcome),
    /// A stop request was observed mid-cycle; the cycle is not counted.
    Interrupted,
}

/// Drives the soak loop over a relay and a device endpoint.
pub struct CycleController<D> {
    config: CycleConfig,
    classifier: LineClassifier,
    success_rules: Vec<RuleId>,
    relay: Arc<RelayActuator>,
    device: D,
    stats: Arc<StatsRecorder>,
    stop: Arc<StopController>,
    rng: StdRng,
    probe: Option<RegisterProbe>,
    probe_deadline: Option<Instant>,
    max_reconnect_failures: u32,
    reconnect_failures: u32,
}

impl<D: DeviceEndpoint> CycleController<D> {
    pub fn new(
        config: CycleConfig,
        rules: Arc<KeywordRuleSet>,
        relay: Arc<RelayActuator>,
        device: D,
        stats: Arc<StatsRecorder>,
        stop: Arc<StopController>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let success_rules = rules.success_rules().map(|r| r.id).collect();
        Self {
            config,
            classifier: LineClassifier::new(rules),
            success_rules,
            relay,
            device,
            stats,
            stop,
            rng,
            probe: None,
            probe_deadline: None,
            max_reconnect_failures: 3,
            reconnect_failures: 0,
        }
    }

    /// Consecutive failed reconnects tolerated before aborting.
    pub fn with_reconnect_budget(mut self, attempts: u32) -> Self {
        self.max_reconnect_failures = attempts.max(1);
        self
    }

    /// Issue a register read after every power-on.
    pub fn with_probe(mut self, probe: RegisterProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Run cycles until the budget is spent, a stop is requested or the
    /// session aborts. Always ends through the stop controller.
    pub async fn run(&mut self) -> StopOutcome {
        tracing::info!(
            cycles = self.config.cycles,
            on_min = self.config.on_min_secs,
            on_max = self.config.on_max_secs,
            "soak test starting"
        );
        self.stats.note(
            EntryKind::Info,
            &format!(
                "soak test starting: {} cycles, on {:.1}-{:.1}s, off {:.1}s",
                self.config.cycles, self.config.on_min_secs, self.config.on_max_secs, self.config.off_secs
            ),
        );

        if let Err(e) = self.prepare().await {
            return self.stop.abort(&e, &mut self.device).await;
        }

        let mut index = 0u32;
        let reason = loop {
            if self.stop.stop_requested() {
                break "interrupted by user".to_string();
            }
            if self.config.is_last(index) {
                break format!("completed {index} cycles");
            }
            index += 1;

            let on_duration = self.sample_on_duration();
            let span = CycleSpan::new(index, on_duration.as_secs_f64());
            let result = self.run_cycle(index, on_duration).instrument(span.clone()).await;
            span.record_result(&result);

            match result {
                Ok(CycleEnd::Completed(outcome)) => {
                    span.record("outcome", outcome.as_str());
                    self.report_progress(index, outcome);
                    self.flush_if_due().await;
                }
                Ok(CycleEnd::Interrupted) => continue,
                Err(e) => {
                    span.record("outcome", CycleOutcome::Aborted.as_str());
                    return self.stop.abort(&e, &mut self.device).await;
                }
            }

            if !self.config.is_last(index) {
                self.pause(self.config.off()).await;
            }
        };

        self.stop.shutdown(&reason, &mut self.device).await
    }

    /// Put the relay in the released state before the first cycle.
    async fn prepare(&mut self) -> Result<(), CycleError> {
        if self.relay.config().identify_on_start {
            match self.relay.identify().await {
                Ok(model) => self.stats.note(EntryKind::Info, &format!("relay board: {model:?}")),
                Err(e) => {
                    tracing::warn!(error = %e, "relay identification failed");
                    self.stats.note(EntryKind::Warning, &format!("relay identification failed: {e}"));
                }
            }
        }

        self.stats.note(EntryKind::Info, "releasing relay before first cycle");
        self.relay.ensure_off().await?;
        self.pause(self.config.initial_off()).await;
        Ok(())
    }

    /// Uniform draw from the on-time range, rounded to 0.1 s.
    fn sample_on_duration(&mut self) -> Duration {
        let (min, max) = (self.config.on_min_secs, self.config.on_max_secs);
        if max <= min {
            return secs(min);
        }
        let drawn = self.rng.gen_range(min..=max);
        secs(((drawn * 10.0).round() / 10.0).clamp(min, max))
    }

    /// Sleep, returning early on a stop request. Returns true when interrupted.
    async fn pause(&self, duration: Duration) -> bool {
        let cancel = self.stop.cancel_token();
        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }

    async fn run_cycle(&mut self, index: u32, on_duration: Duration) -> Result<CycleEnd, CycleError> {
        let mut cycle = Cycle::new(index, on_duration, Instant::now());
        self.stats.note(
            EntryKind::Info,
            &format!("--- cycle {index} (on {:.1}s) ---", on_duration.as_secs_f64()),
        );

        match self.drive(&mut cycle).await {
            Ok(true) => {
                let outcome = cycle.evaluate(self.config.success_mode, &self.success_rules);
                cycle.advance(CycleState::Idle);
                cycle.finish(outcome, Instant::now());
                self.stats.record(&cycle);
                Ok(CycleEnd::Completed(outcome))
            }
            Ok(false) => {
                tracing::info!(index, "cycle interrupted by stop request");
                self.stats.note(EntryKind::Warning, &format!("cycle {index} interrupted, not counted"));
                Ok(CycleEnd::Interrupted)
            }
            Err(e) => {
                if let CycleError::Burst(report) = &e {
                    cycle.burst = Some(report.clone());
                }
                cycle.advance(CycleState::Aborted);
                cycle.finish(CycleOutcome::Aborted, Instant::now());
                self.stats.record(&cycle);
                Err(e)
            }
        }
    }

    /// Walk one cycle through its phases. Returns false when interrupted.
    async fn drive(&mut self, cycle: &mut Cycle) -> Result<bool, CycleError> {
        if !self.device.is_connected() {
            tracing::info!("device port down at cycle start, reconnecting");
            self.reconnect(cycle).await?;
        }

        self.classifier.reset();
        // Whatever arrived while unpowered belongs to no cycle.
        let stale = self.device.discard_pending();
        if stale > 0 {
            tracing::debug!(bytes = stale, "discarded output received while powered off");
            self.stats.note(
                EntryKind::Info,
                &format!("discarded {stale} bytes received while powered off"),
            );
        }
        cycle.advance(CycleState::PowerOn);
        if let Err(e) = self.relay.set_power(true).await {
            telemetry::record_relay_fault();
            cycle.relay_failed = true;
            self.stats.note(EntryKind::Error, &format!("relay power-on failed: {e}"));
            cycle.advance(CycleState::PowerOff);
            self.relay.ensure_off().await?;
            cycle.advance(CycleState::Analyzing);
            return Ok(true);
        }
        self.stats.note(EntryKind::Info, "relay -> ON");
        self.start_probe().await;

        if self.stop.stop_requested() {
            cycle.advance(CycleState::PowerOff);
            self.power_off(cycle).await?;
            return Ok(false);
        }

        cycle.advance(CycleState::Monitoring);
        let on_duration = cycle.on_duration;
        self.monitor(cycle, on_duration).await?;

        cycle.advance(CycleState::PowerOff);
        self.power_off(cycle).await?;
        if self.stop.stop_requested() {
            return Ok(false);
        }

        cycle.advance(CycleState::Analyzing);
        self.monitor(cycle, self.config.drain()).await?;
        if self.stop.stop_requested() {
            return Ok(false);
        }
        self.expire_probe(Instant::now());
        Ok(true)
    }

    async fn power_off(&mut self, cycle: &mut Cycle) -> Result<(), CycleError> {
        if let Err(e) = self.relay.set_power(false).await {
            telemetry::record_relay_fault();
            cycle.relay_failed = true;
            self.stats.note(EntryKind::Error, &format!("relay power-off failed: {e}"));
            self.relay.ensure_off().await?;
        }
        self.stats.note(EntryKind::Info, "relay -> OFF");
        Ok(())
    }

    /// Read and classify device output for `budget`. Burst verdicts end the
    /// phase immediately with an error; a stop request ends it early.
    async fn monitor(&mut self, cycle: &mut Cycle, budget: Duration) -> Result<(), CycleError> {
        let deadline = Instant::now() + budget;
        let poll = self.config.poll_interval();

        loop {
            if self.stop.stop_requested() {
                return Ok(());
            }

            // After a failed reconnect there is no log to watch; keep the power cadence.
            if !cycle.reconnect_failed {
                match self.device.read_available() {
                    Ok(lines) => {
                        for line in lines {
                            self.handle_line(cycle, line)?;
                        }
                    }
                    Err(e) if e.is_disconnect() => {
                        cycle.disconnects += 1;
                        telemetry::record_disconnect();
                        tracing::warn!(error = %e, phase = cycle.state.as_str(), "device disconnected");
                        self.stats.note(EntryKind::Warning, &format!("device disconnected: {e}"));
                        self.reconnect(cycle).await?;
                        continue;
                    }
                    Err(e) => tracing::warn!(error = %e, "device read failed"),
                }
            }

            self.flush_if_due().await;
            let now = Instant::now();
            self.expire_probe(now);
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    /// One reconnect attempt. Only an exhausted budget is an error.
    async fn reconnect(&mut self, cycle: &mut Cycle) -> Result<(), CycleError> {
        match self.device.reconnect().await {
            Ok(()) => {
                self.reconnect_failures = 0;
                self.stats.note(
                    EntryKind::Info,
                    &format!("device reconnected on {}", self.device.port_name()),
                );
                Ok(())
            }
            Err(e) => {
                self.reconnect_failures += 1;
                cycle.reconnect_failed = true;
                tracing::error!(
                    error = %e,
                    failures = self.reconnect_failures,
                    budget = self.max_reconnect_failures,
                    "device reconnect failed"
                );
                self.stats.note(EntryKind::Error, &format!("device reconnect failed: {e}"));
                if self.reconnect_failures >= self.max_reconnect_failures {
                    return Err(CycleError::ReconnectExhausted {
                        attempts: self.reconnect_failures,
                        last: e,
                    });
                }
                Ok(())
            }
        }
    }

    fn handle_line(&mut self, cycle: &mut Cycle, line: LogLine) -> Result<(), CycleError> {
        let verdict = self.classifier.classify(&line);

        if line.lossy {
            telemetry::record_decode_loss();
        }
        for hit in &verdict.hits {
            telemetry::record_rule_match(hit.category);
        }
        self.stats.record_line(&line, EntryKind::from_verdict(verdict.kind));

        match verdict.kind {
            VerdictKind::CriticalBurst | VerdictKind::ErrorBurst => {
                tracing::error!(line = %line.text, "burst threshold reached")
            }
            VerdictKind::Exception => tracing::warn!(line = %line.text, "exception keyword"),
            VerdictKind::Match => tracing::warn!(
                line = %line.text,
                count = verdict.top.map(|h| h.count),
                "error keyword below threshold"
            ),
            VerdictKind::Success => tracing::info!(line = %line.text, "success marker"),
            VerdictKind::Info => tracing::debug!(line = %line.text, "info keyword"),
            VerdictKind::Unmatched => tracing::trace!(line = %line.text),
        }

        self.check_probe_reply(&line);

        let burst = match verdict.top {
            Some(hit) if verdict.is_burst() => Some(self.burst_report(&hit)),
            _ => None,
        };
        cycle.observe(line, &verdict);

        match burst {
            Some(report) => Err(CycleError::Burst(report)),
            None => Ok(()),
        }
    }

    fn burst_report(&self, hit: &RuleHit) -> BurstReport {
        let (pattern, window, threshold) = self
            .classifier
            .rules()
            .get(hit.rule)
            .map(|r| (r.label.clone(), r.window, r.threshold))
            .unwrap_or_default();
        BurstReport {
            rule: hit.rule,
            pattern,
            category: hit.category,
            count: hit.count,
            threshold,
            window,
        }
    }

    async fn start_probe(&mut self) {
        let Some(probe) = &self.probe else {
            return;
        };
        let request = match probe.encode_request() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "register probe encode failed");
                self.stats.note(EntryKind::Warning, &format!("register probe encode failed: {e}"));
                return;
            }
        };
        let wait = probe.request().reply_wait();
        match self.device.send(&request).await {
            Ok(()) => self.probe_deadline = Some(Instant::now() + wait),
            Err(e) => {
                tracing::warn!(error = %e, "register probe send failed");
                self.stats.note(EntryKind::Warning, &format!("register probe send failed: {e}"));
            }
        }
    }

    fn check_probe_reply(&mut self, line: &LogLine) {
        if self.probe_deadline.is_none() {
            return;
        }
        let Some(reply) = self.probe.as_ref().and_then(|p| p.match_reply(line)) else {
            return;
        };
        self.probe_deadline = None;
        match reply {
            Ok(frame) => {
                let fields = serde_json::to_string(&frame.fields).unwrap_or_default();
                tracing::info!(status = frame.status, %fields, "register probe reply");
                self.stats.note(
                    EntryKind::Info,
                    &format!("register probe reply: status={} fields={fields}", frame.status),
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "register probe reply undecodable");
                self.stats.note(EntryKind::Warning, &format!("register probe reply undecodable: {e}"));
            }
        }
    }

    fn expire_probe(&mut self, now: Instant) {
        if self.probe_deadline.is_some_and(|deadline| now >= deadline) {
            self.probe_deadline = None;
            tracing::warn!("register probe got no reply");
            self.stats.note(EntryKind::Warning, "register probe got no reply");
        }
    }

    fn report_progress(&self, index: u32, outcome: CycleOutcome) {
        let session = self.stats.session();
        tracing::info!(
            index,
            %outcome,
            success = session.success,
            total = session.total,
            rate = %format!("{:.2}%", session.success_rate() * 100.0),
            "cycle finished"
        );
    }

    async fn flush_if_due(&self) {
        if let Err(e) = self.stats.maybe_flush().await {
            tracing::error!(error = %e, "periodic log flush failed");
        }
    }
}
