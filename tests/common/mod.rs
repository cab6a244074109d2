//! Scripted relay and device doubles shared by the integration tests.
//!
//! The relay double records every command with its (paused) timestamp. The
//! device double replays a per-cycle script relative to the most recent
//! power-on command, so scripts read like a scope trace of one cycle. Output
//! scripted after the drain stays buffered like a real port until it is read
//! or discarded.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use relay_soak::cycle::CycleConfig;
use relay_soak::rules::{default_rule_specs, KeywordRuleSet};
use relay_soak::serial::{DeviceEndpoint, LogLine, PortError, RelayActuator, RelayConfig, RelayLink};
use relay_soak::shutdown::StopController;
use relay_soak::telemetry::StatsRecorder;

pub const ON: u8 = 0x50;
pub const OFF: u8 = 0x4F;

/// Everything the doubles observed, shared with the test body.
#[derive(Debug, Default)]
pub struct BenchLog {
    pub commands: Vec<(Instant, Vec<u8>)>,
    pub sent: Vec<Vec<u8>>,
    pub device_closed: bool,
    pub relay_closed: bool,
    pub reconnects: u32,
}

impl BenchLog {
    pub fn power_ons(&self) -> usize {
        self.commands.iter().filter(|(_, c)| c == &[ON]).count()
    }

    pub fn last_on(&self) -> Option<Instant> {
        self.commands.iter().rev().find(|(_, c)| c == &[ON]).map(|(at, _)| *at)
    }

    pub fn last_command(&self) -> Option<Vec<u8>> {
        self.commands.last().map(|(_, c)| c.clone())
    }
}

pub type Bench = Arc<Mutex<BenchLog>>;

pub fn bench() -> Bench {
    Arc::new(Mutex::new(BenchLog::default()))
}

/// Relay link that records commands and can be told to fail.
pub struct RecordingRelayLink {
    bench: Bench,
    /// 1-based write numbers that fail with `BrokenPipe`.
    fail_writes: Vec<usize>,
    writes: usize,
    reply: Vec<u8>,
}

impl RecordingRelayLink {
    pub fn new(bench: Bench) -> Self {
        Self {
            bench,
            fail_writes: Vec::new(),
            writes: 0,
            reply: vec![0xAB],
        }
    }

    pub fn failing(mut self, writes: &[usize]) -> Self {
        self.fail_writes = writes.to_vec();
        self
    }
}

#[async_trait]
impl RelayLink for RecordingRelayLink {
    async fn write_command(&mut self, command: &[u8]) -> io::Result<()> {
        self.writes += 1;
        if self.fail_writes.contains(&self.writes) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "relay unplugged"));
        }
        self.bench.lock().commands.push((Instant::now(), command.to_vec()));
        Ok(())
    }

    async fn read_reply(&mut self, _wait: Duration) -> io::Result<Vec<u8>> {
        Ok(self.reply.clone())
    }

    async fn close(&mut self) -> io::Result<()> {
        self.bench.lock().relay_closed = true;
        Ok(())
    }
}

/// One scripted device event, at an offset from the cycle's power-on.
#[derive(Debug, Clone)]
pub enum Event {
    Line(f64, String),
    Disconnect(f64),
}

impl Event {
    pub fn line(at: f64, text: &str) -> Self {
        Self::Line(at, text.to_string())
    }

    fn offset(&self) -> f64 {
        match self {
            Self::Line(at, _) | Self::Disconnect(at) => *at,
        }
    }
}

/// Device endpoint replaying a script per cycle.
pub struct FakeDevice {
    bench: Bench,
    /// `scripts[n]` plays during the n-th power-on; missing entries are silent.
    scripts: Vec<Vec<Event>>,
    /// Outcomes of successive reconnect attempts; `Ok` once exhausted.
    reconnects: VecDeque<bool>,
    /// 1-based index of the script being played; 0 before the first power-on.
    cycle: usize,
    /// Power-on instant the current script is timed from.
    origin: Option<Instant>,
    cursor: usize,
    connected: bool,
}

impl FakeDevice {
    pub fn new(bench: Bench, scripts: Vec<Vec<Event>>) -> Self {
        Self {
            bench,
            scripts,
            reconnects: VecDeque::new(),
            cycle: 0,
            origin: None,
            cursor: 0,
            connected: true,
        }
    }

    pub fn with_reconnects(mut self, outcomes: &[bool]) -> Self {
        self.reconnects = outcomes.iter().copied().collect();
        self
    }

    fn disconnected() -> PortError {
        PortError::Disconnected {
            port: "FAKE0".to_string(),
        }
    }

    /// Move every event of the current script that is due by now into `out`.
    /// Returns false when the port dropped.
    fn collect_due(&mut self, out: &mut Vec<LogLine>) -> bool {
        let Some(origin) = self.origin else {
            return true;
        };
        let Some(script) = self.cycle.checked_sub(1).and_then(|i| self.scripts.get(i)) else {
            return true;
        };

        let elapsed = Instant::now().saturating_duration_since(origin).as_secs_f64();
        while let Some(event) = script.get(self.cursor) {
            if event.offset() > elapsed + 1e-9 {
                break;
            }
            self.cursor += 1;
            match event {
                Event::Line(at, text) => {
                    let received = origin + Duration::from_secs_f64(*at);
                    out.push(LogLine::new(text.as_bytes().to_vec(), text.clone(), false, received));
                }
                Event::Disconnect(_) => {
                    self.connected = false;
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl DeviceEndpoint for FakeDevice {
    fn port_name(&self) -> &str {
        "FAKE0"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn read_available(&mut self) -> Result<Vec<LogLine>, PortError> {
        if !self.connected {
            return Err(Self::disconnected());
        }

        // Output of the previous power-on that nobody read or discarded.
        let mut lines = Vec::new();
        let mut alive = self.collect_due(&mut lines);

        let (power_ons, last_on) = {
            let log = self.bench.lock();
            (log.power_ons(), log.last_on())
        };
        if alive && power_ons != self.cycle {
            self.cycle = power_ons;
            self.origin = last_on;
            self.cursor = 0;
            alive = self.collect_due(&mut lines);
        }

        // Lines that arrived before the drop are delivered; the error surfaces next read.
        if !alive && lines.is_empty() {
            return Err(Self::disconnected());
        }
        Ok(lines)
    }

    fn discard_pending(&mut self) -> usize {
        if !self.connected {
            return 0;
        }
        let mut dropped = Vec::new();
        self.collect_due(&mut dropped);
        dropped.iter().map(|line| line.raw.len() + 1).sum()
    }

    async fn reconnect(&mut self) -> Result<(), PortError> {
        self.bench.lock().reconnects += 1;
        if self.reconnects.pop_front().unwrap_or(true) {
            self.connected = true;
            Ok(())
        } else {
            self.connected = false;
            Err(PortError::Discovery {
                role: relay_soak::serial::PortRole::Device,
                reason: "no adapter description contains \"cp210\"".to_string(),
            })
        }
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        self.bench.lock().sent.push(bytes.to_vec());
        Ok(())
    }

    async fn close(&mut self) {
        self.connected = false;
        self.bench.lock().device_closed = true;
    }
}

/// Relay timing with no contact settle delay.
pub fn quick_relay() -> RelayConfig {
    RelayConfig {
        settle_ms: 0,
        ..RelayConfig::default()
    }
}

/// Fixed 1 s on-time, 1.5 s drain, 0.5 s off, no initial release pause.
pub fn quick_cycles(cycles: u32) -> CycleConfig {
    CycleConfig {
        cycles,
        on_min_secs: 1.0,
        on_max_secs: 1.0,
        drain_secs: 1.5,
        off_secs: 0.5,
        initial_off_secs: 0.0,
        seed: Some(7),
        ..CycleConfig::default()
    }
}

pub fn default_rules() -> Arc<KeywordRuleSet> {
    Arc::new(KeywordRuleSet::compile(&default_rule_specs()).unwrap())
}

/// The shared pieces every controller test wires together.
pub struct Rig {
    pub bench: Bench,
    pub relay: Arc<RelayActuator>,
    pub stats: Arc<StatsRecorder>,
    pub stop: Arc<StopController>,
}

impl Rig {
    pub fn new() -> Self {
        let bench = bench();
        Self::with_link(bench.clone(), RecordingRelayLink::new(bench))
    }

    pub fn with_link(bench: Bench, link: RecordingRelayLink) -> Self {
        Self::build(bench, link, Duration::from_secs(60))
    }

    /// Rig whose recorder flushes to memory every `interval`.
    pub fn flushing_every(interval: Duration) -> Self {
        let bench = bench();
        Self::build(bench.clone(), RecordingRelayLink::new(bench), interval)
    }

    fn build(bench: Bench, link: RecordingRelayLink, flush_interval: Duration) -> Self {
        let relay = Arc::new(RelayActuator::new(quick_relay(), Box::new(link)));
        let stats = Arc::new(StatsRecorder::in_memory(flush_interval));
        let stop = Arc::new(StopController::new(relay.clone(), stats.clone()));
        Self {
            bench,
            relay,
            stats,
            stop,
        }
    }
}
