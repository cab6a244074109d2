//! Telemetry for the harness: console tracing, metrics, session statistics
//! and the persisted test logs.

mod logging;
mod metrics;
mod recorder;
mod session;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat, LOG_FILE_ENV, LOG_FILTER_ENV, LOG_FORMAT_ENV};
pub use self::metrics::{
    init_metrics, record_cycle, record_decode_loss, record_disconnect, record_relay_fault, record_rule_match,
    record_success_rate,
};
pub use recorder::{
    EntryKind, LogBuffers, LogPaths, LogsConfig, RecorderError, StatsRecorder, DEFAULT_MEMORY_TAIL,
};
pub use session::TestSession;
pub use spans::{CycleSpan, SpanExt};
