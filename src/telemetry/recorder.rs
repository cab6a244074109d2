//! Session statistics and the three persisted test logs.
//!
//! Entries are buffered in memory and appended to disk on [`StatsRecorder::flush`].
//! The periodic [`StatsRecorder::maybe_flush`] writes on the blocking pool.
//! The full log receives every entry; entries tagged Exception, Error or
//! Critical are duplicated into the error log; the raw log holds the received
//! bytes of every DUT line.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use super::metrics;

/// Entries per log kept by the in-memory sink; older ones are dropped.
pub const DEFAULT_MEMORY_TAIL: usize = 10_000;
use super::session::TestSession;
use crate::cycle::{Cycle, CycleOutcome};
use crate::rules::VerdictKind;
use crate::serial::LogLine;

/// Where and how often the test logs are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// When false, entries are kept in memory only.
    pub enabled: bool,
    pub dir: PathBuf,
    pub flush_interval_secs: f64,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("logs"),
            flush_interval_secs: 60.0,
        }
    }
}

impl LogsConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_secs.max(0.0))
    }
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to append to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Severity tag of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Info,
    Success,
    Warning,
    Exception,
    Error,
    Critical,
}

impl EntryKind {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Success => "SUCCESS",
            Self::Warning => "WARN",
            Self::Exception => "EXCEPTION",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }

    /// Entries duplicated into the error log.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Exception | Self::Error | Self::Critical)
    }

    pub fn from_verdict(kind: VerdictKind) -> Self {
        match kind {
            VerdictKind::Unmatched | VerdictKind::Info => Self::Info,
            VerdictKind::Success => Self::Success,
            VerdictKind::Match => Self::Error,
            VerdictKind::Exception => Self::Exception,
            VerdictKind::ErrorBurst => Self::Error,
            VerdictKind::CriticalBurst => Self::Critical,
        }
    }
}

/// Paths of the three log files of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub full: PathBuf,
    pub error: PathBuf,
    pub raw: PathBuf,
}

impl LogPaths {
    /// `soak_<YYYYmmdd_HHMMSS>_{full,error,raw}.log` under `dir`.
    pub fn for_session(dir: &Path) -> Self {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        Self {
            full: dir.join(format!("soak_{stamp}_full.log")),
            error: dir.join(format!("soak_{stamp}_error.log")),
            raw: dir.join(format!("soak_{stamp}_raw.log")),
        }
    }
}

/// Buffered (or, in memory mode, retained) log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBuffers {
    pub full: Vec<String>,
    pub error: Vec<String>,
    pub raw: Vec<String>,
}

impl LogBuffers {
    fn is_empty(&self) -> bool {
        self.full.is_empty() && self.error.is_empty() && self.raw.is_empty()
    }

    fn append(&mut self, other: &mut LogBuffers) {
        self.full.append(&mut other.full);
        self.error.append(&mut other.error);
        self.raw.append(&mut other.raw);
    }

    /// Keep only the newest `limit` entries of each log.
    fn truncate_front(&mut self, limit: usize) {
        for log in [&mut self.full, &mut self.error, &mut self.raw] {
            if log.len() > limit {
                log.drain(..log.len() - limit);
            }
        }
    }
}

enum Sink {
    Files(LogPaths),
    Memory(LogBuffers),
}

struct Inner {
    session: TestSession,
    pending: LogBuffers,
    sink: Sink,
    last_flush: Instant,
}

fn timestamp() -> String {
    chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]").to_string()
}

/// Append each log of `batch` to its file, clearing what was written.
fn write_batch(paths: &LogPaths, batch: &mut LogBuffers) -> Result<(), RecorderError> {
    append_lines(&paths.full, &batch.full)?;
    batch.full.clear();
    append_lines(&paths.error, &batch.error)?;
    batch.error.clear();
    append_lines(&paths.raw, &batch.raw)?;
    batch.raw.clear();
    Ok(())
}

fn append_lines(path: &Path, lines: &[String]) -> Result<(), RecorderError> {
    if lines.is_empty() {
        return Ok(());
    }
    let write = || -> std::io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut chunk = lines.join("\n");
        chunk.push('\n');
        file.write_all(chunk.as_bytes())?;
        file.flush()
    };
    write().map_err(|source| RecorderError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Aggregates cycle outcomes and owns the persisted logs.
pub struct StatsRecorder {
    inner: Mutex<Inner>,
    flush_interval: Duration,
    memory_tail: usize,
}

impl StatsRecorder {
    fn with_sink(sink: Sink, flush_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                session: TestSession::default(),
                pending: LogBuffers::default(),
                sink,
                last_flush: Instant::now(),
            }),
            flush_interval,
            memory_tail: DEFAULT_MEMORY_TAIL,
        }
    }

    /// Recorder that keeps the newest flushed entries in memory.
    pub fn in_memory(flush_interval: Duration) -> Self {
        Self::with_sink(Sink::Memory(LogBuffers::default()), flush_interval)
    }

    /// Recorder writing a fresh set of session logs under `dir`.
    pub fn with_log_dir(dir: &Path, flush_interval: Duration) -> Result<Self, RecorderError> {
        std::fs::create_dir_all(dir).map_err(|source| RecorderError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
        let paths = LogPaths::for_session(dir);
        tracing::info!(full = %paths.full.display(), "session logs created");
        Ok(Self::with_sink(Sink::Files(paths), flush_interval))
    }

    /// Bound on entries per log retained by the in-memory sink.
    pub fn with_memory_tail(mut self, entries: usize) -> Self {
        self.memory_tail = entries.max(1);
        self
    }

    pub fn from_config(config: &LogsConfig) -> Result<Self, RecorderError> {
        if config.enabled {
            Self::with_log_dir(&config.dir, config.flush_interval())
        } else {
            Ok(Self::in_memory(config.flush_interval()))
        }
    }

    pub fn log_paths(&self) -> Option<LogPaths> {
        match &self.inner.lock().sink {
            Sink::Files(paths) => Some(paths.clone()),
            Sink::Memory(_) => None,
        }
    }

    /// Add a harness message to the full log (and the error log for error kinds).
    pub fn note(&self, kind: EntryKind, message: &str) {
        let entry = format!("{} [{}] {}", timestamp(), kind.tag(), message);
        let mut inner = self.inner.lock();
        if kind.is_error() {
            inner.pending.error.push(entry.clone());
        }
        inner.pending.full.push(entry);
    }

    /// Log one DUT line: decoded text to the full log, received bytes to the raw log.
    pub fn record_line(&self, line: &LogLine, kind: EntryKind) {
        let ts = timestamp();
        let entry = format!("{ts} [{}] {}", kind.tag(), line.text);
        let raw = format!("{ts} {}", line.raw.escape_ascii());
        let mut inner = self.inner.lock();
        if kind.is_error() {
            inner.pending.error.push(entry.clone());
        }
        inner.pending.full.push(entry);
        inner.pending.raw.push(raw);
    }

    /// Fold a finished cycle into the session counters.
    pub fn record(&self, cycle: &Cycle) {
        let outcome = cycle.outcome.unwrap_or(CycleOutcome::Failure);
        let session = {
            let mut inner = self.inner.lock();
            let s = &mut inner.session;
            s.count_outcome(outcome);
            s.exception_count += u64::from(cycle.exceptions);
            s.disconnect_count += u64::from(cycle.disconnects);
            s.decode_losses += u64::from(cycle.lossy_lines);
            s.clone()
        };

        metrics::record_cycle(outcome, cycle.elapsed().as_secs_f64());
        metrics::record_success_rate(session.success_rate());

        let kind = match outcome {
            CycleOutcome::Success => EntryKind::Success,
            CycleOutcome::Failure => EntryKind::Warning,
            CycleOutcome::Aborted => EntryKind::Critical,
        };
        self.note(
            kind,
            &format!(
                "cycle {} {} (on {:.2}s, {} lines, {} exceptions, {} disconnects) running {}/{}",
                cycle.index,
                outcome,
                cycle.on_duration.as_secs_f64(),
                cycle.line_count,
                cycle.exceptions,
                cycle.disconnects,
                session.success,
                session.total,
            ),
        );
    }

    /// Set the abort flag and remember why.
    pub fn mark_aborted(&self, reason: &str) {
        let mut inner = self.inner.lock();
        inner.session.aborted = true;
        inner.session.abort_reason = Some(reason.to_string());
    }

    pub fn session(&self) -> TestSession {
        self.inner.lock().session.clone()
    }

    pub fn summary(&self) -> String {
        self.inner.lock().session.summary()
    }

    /// Flush when the configured interval has elapsed. Returns whether it flushed.
    ///
    /// File writes run on the blocking pool. On failure the unwritten entries
    /// go back in front of anything buffered meanwhile.
    pub async fn maybe_flush(&self) -> Result<bool, RecorderError> {
        let (paths, batch) = {
            let mut inner = self.inner.lock();
            if inner.last_flush.elapsed() < self.flush_interval {
                return Ok(false);
            }
            inner.last_flush = Instant::now();
            let Inner { pending, sink, .. } = &mut *inner;
            match sink {
                Sink::Memory(retained) => {
                    retained.append(pending);
                    retained.truncate_front(self.memory_tail);
                    return Ok(true);
                }
                Sink::Files(_) if pending.is_empty() => return Ok(true),
                Sink::Files(paths) => (paths.clone(), std::mem::take(pending)),
            }
        };

        let full = paths.full.clone();
        let written = tokio::task::spawn_blocking(move || {
            let mut batch = batch;
            let result = write_batch(&paths, &mut batch);
            (result, batch)
        })
        .await;

        match written {
            Ok((Ok(()), _)) => Ok(true),
            Ok((Err(e), mut unwritten)) => {
                let mut inner = self.inner.lock();
                unwritten.append(&mut inner.pending);
                inner.pending = unwritten;
                Err(e)
            }
            Err(join) => Err(RecorderError::Write {
                path: full,
                source: std::io::Error::new(std::io::ErrorKind::Other, join.to_string()),
            }),
        }
    }

    /// Append buffered entries to the sink. Entries stay buffered if a write fails.
    pub fn flush(&self) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock();
        inner.last_flush = Instant::now();
        if inner.pending.is_empty() {
            return Ok(());
        }

        let Inner { pending, sink, .. } = &mut *inner;
        match sink {
            Sink::Files(paths) => write_batch(paths, pending)?,
            Sink::Memory(retained) => {
                retained.append(pending);
                retained.truncate_front(self.memory_tail);
            }
        }
        Ok(())
    }

    /// Entries flushed so far in memory mode; empty when writing to files.
    pub fn retained(&self) -> LogBuffers {
        match &self.inner.lock().sink {
            Sink::Memory(retained) => retained.clone(),
            Sink::Files(_) => LogBuffers::default(),
        }
    }
}
