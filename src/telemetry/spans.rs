//! Span helpers for cycle-level tracing.

use tracing::{info_span, Span};

/// Extension trait for recording results into spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-cycle spans.
pub struct CycleSpan;

impl CycleSpan {
    /// Fields:
    /// - `index`: 1-based cycle number
    /// - `on_secs`: sampled power-on duration
    /// - `outcome`: filled in when the cycle is analyzed
    /// - `status` / `error.message`: filled in by [`SpanExt::record_result`]
    pub fn new(index: u32, on_secs: f64) -> Span {
        info_span!(
            "cycle",
            index,
            on_secs,
            outcome = tracing::field::Empty,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
        )
    }
}
