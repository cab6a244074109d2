//! Harness configuration: TOML file, then environment overrides, then validation.
//!
//! Every field has a default, so an empty file (or no file) is a complete
//! configuration. Invalid environment values fall back to the file/default
//! value without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Field |
//! |---|---|
//! | `RELAY_SOAK_CONFIG` | path of the TOML file (when `--config` is not given) |
//! | `RELAY_SOAK_CYCLES` | `cycle.cycles` |
//! | `RELAY_SOAK_ON_MIN` | `cycle.on_min_secs` |
//! | `RELAY_SOAK_ON_MAX` | `cycle.on_max_secs` |
//! | `RELAY_SOAK_OFF_SECS` | `cycle.off_secs` |
//! | `RELAY_SOAK_DRAIN_SECS` | `cycle.drain_secs` |
//! | `RELAY_SOAK_POLL_MS` | `cycle.poll_interval_ms` |
//! | `RELAY_SOAK_SEED` | `cycle.seed` |
//! | `RELAY_SOAK_RELAY_PORT` | `ports.relay_port` |
//! | `RELAY_SOAK_DEVICE_PORT` | `ports.device_port` |
//! | `RELAY_SOAK_RELAY_MATCH` | `ports.relay_match` |
//! | `RELAY_SOAK_DEVICE_MATCH` | `ports.device_match` |
//! | `RELAY_SOAK_DEVICE_BAUD` | `ports.device_baud` |
//! | `RELAY_SOAK_LOG_DIR` | `logs.dir` |
//! | `RELAY_SOAK_ENCODING` | `reader.encoding` |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cycle::CycleConfig;
use crate::rules::{default_rule_specs, KeywordRuleSet, RuleSpec};
use crate::serial::{LineDecoder, PortsConfig, RelayConfig, DEFAULT_CHANNEL_CAPACITY};
use crate::telemetry::LogsConfig;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "RELAY_SOAK_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// DUT log decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// WHATWG encoding label of the DUT log.
    pub encoding: String,
    /// Chunks buffered between the reader task and the cycle loop.
    pub channel_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            encoding: "gb18030".to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Complete harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub cycle: CycleConfig,
    pub ports: PortsConfig,
    pub relay: RelayConfig,
    pub logs: LogsConfig,
    pub reader: ReaderConfig,
    pub rules: Vec<RuleSpec>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            ports: PortsConfig::default(),
            relay: RelayConfig::default(),
            logs: LogsConfig::default(),
            reader: ReaderConfig::default(),
            rules: default_rule_specs(),
        }
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse a `u32` env var, returning `current` on missing or invalid.
fn parse_u32(key: &str, current: u32) -> u32 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

/// Parse a `u64` env var, returning `current` on missing or invalid.
fn parse_u64(key: &str, current: u64) -> u64 {
    env_value(key).and_then(|v| v.parse().ok()).unwrap_or(current)
}

/// Parse a finite non-negative `f64` env var, returning `current` otherwise.
fn parse_secs(key: &str, current: f64) -> f64 {
    env_value(key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(current)
}

impl HarnessConfig {
    /// Parse TOML text.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    /// Read a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text, path)
    }

    /// Apply `RELAY_SOAK_*` overrides in place.
    pub fn apply_env(&mut self) {
        let c = &mut self.cycle;
        c.cycles = parse_u32("RELAY_SOAK_CYCLES", c.cycles);
        c.on_min_secs = parse_secs("RELAY_SOAK_ON_MIN", c.on_min_secs);
        c.on_max_secs = parse_secs("RELAY_SOAK_ON_MAX", c.on_max_secs);
        c.off_secs = parse_secs("RELAY_SOAK_OFF_SECS", c.off_secs);
        c.drain_secs = parse_secs("RELAY_SOAK_DRAIN_SECS", c.drain_secs);
        c.poll_interval_ms = parse_u64("RELAY_SOAK_POLL_MS", c.poll_interval_ms);
        if let Some(seed) = env_value("RELAY_SOAK_SEED").and_then(|v| v.parse().ok()) {
            c.seed = Some(seed);
        }

        let p = &mut self.ports;
        if let Some(port) = env_value("RELAY_SOAK_RELAY_PORT") {
            p.relay_port = Some(port);
        }
        if let Some(port) = env_value("RELAY_SOAK_DEVICE_PORT") {
            p.device_port = Some(port);
        }
        if let Some(needle) = env_value("RELAY_SOAK_RELAY_MATCH") {
            p.relay_match = needle;
        }
        if let Some(needle) = env_value("RELAY_SOAK_DEVICE_MATCH") {
            p.device_match = needle;
        }
        p.device_baud = parse_u32("RELAY_SOAK_DEVICE_BAUD", p.device_baud);

        if let Some(dir) = env_value("RELAY_SOAK_LOG_DIR") {
            self.logs.dir = PathBuf::from(dir);
        }
        if let Some(encoding) = env_value("RELAY_SOAK_ENCODING") {
            self.reader.encoding = encoding;
        }
    }

    /// Check cross-field constraints, reporting every problem at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let c = &self.cycle;

        if !(c.on_min_secs.is_finite() && c.on_max_secs.is_finite()) {
            problems.push("cycle.on_min_secs and cycle.on_max_secs must be finite".to_string());
        } else if c.on_min_secs <= 0.0 {
            problems.push(format!("cycle.on_min_secs must be positive, got {}", c.on_min_secs));
        } else if c.on_min_secs > c.on_max_secs {
            problems.push(format!(
                "cycle.on_min_secs ({}) exceeds cycle.on_max_secs ({})",
                c.on_min_secs, c.on_max_secs
            ));
        }
        for (name, value) in [
            ("cycle.drain_secs", c.drain_secs),
            ("cycle.off_secs", c.off_secs),
            ("cycle.initial_off_secs", c.initial_off_secs),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                problems.push(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if !(1..=100).contains(&c.poll_interval_ms) {
            problems.push(format!("cycle.poll_interval_ms must be in 1..=100, got {}", c.poll_interval_ms));
        }

        let p = &self.ports;
        if p.relay_port.is_none() && p.relay_match.trim().is_empty() {
            problems.push("ports.relay_match is empty".to_string());
        }
        if p.device_port.is_none() && p.device_match.trim().is_empty() {
            problems.push("ports.device_match is empty".to_string());
        }
        if p.relay_port.is_none()
            && p.device_port.is_none()
            && p.relay_match.trim().eq_ignore_ascii_case(p.device_match.trim())
        {
            problems.push("ports.relay_match and ports.device_match must differ".to_string());
        }
        if p.relay_baud == 0 || p.device_baud == 0 {
            problems.push("baud rates must be positive".to_string());
        }
        if p.max_reconnect_failures == 0 {
            problems.push("ports.max_reconnect_failures must be at least 1".to_string());
        }

        let r = &self.relay;
        if r.on_command.is_empty() || r.off_command.is_empty() {
            problems.push("relay.on_command and relay.off_command must not be empty".to_string());
        }
        if r.on_command == r.off_command {
            problems.push("relay.on_command and relay.off_command must differ".to_string());
        }

        if LineDecoder::for_label(&self.reader.encoding).is_none() {
            problems.push(format!("reader.encoding: unknown label \"{}\"", self.reader.encoding));
        }
        if self.reader.channel_capacity == 0 {
            problems.push("reader.channel_capacity must be positive".to_string());
        }

        if let Err(e) = KeywordRuleSet::compile(&self.rules) {
            problems.push(format!("rules: {e}"));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Compile the configured rule table.
    pub fn rule_set(&self) -> Result<KeywordRuleSet, ConfigError> {
        KeywordRuleSet::compile(&self.rules).map_err(|e| ConfigError::Invalid(vec![format!("rules: {e}")]))
    }

    pub fn decoder(&self) -> Result<LineDecoder, ConfigError> {
        LineDecoder::for_label(&self.reader.encoding).ok_or_else(|| {
            ConfigError::Invalid(vec![format!("reader.encoding: unknown label \"{}\"", self.reader.encoding)])
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Resolve the config file: explicit path, then `RELAY_SOAK_CONFIG`, then none.
pub fn config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| env_value(CONFIG_PATH_ENV).map(PathBuf::from))
}

/// Load and override from the environment, without validating.
pub fn load_unvalidated(explicit: Option<&Path>) -> Result<HarnessConfig, ConfigError> {
    let mut config = match config_path(explicit) {
        Some(path) => HarnessConfig::from_file(&path)?,
        None => HarnessConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

/// Load, override from the environment and validate.
pub fn load(explicit: Option<&Path>) -> Result<HarnessConfig, ConfigError> {
    let config = load_unvalidated(explicit)?;
    config.validate()?;
    Ok(config)
}
