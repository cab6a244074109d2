//! Transport error types for the relay and DUT serial endpoints.
//!
//! Transport errors are recoverable: the lowest layer that can recover
//! (reconnect, re-assert relay state) handles them.

use std::fmt;

use thiserror::Error;

/// Which serial endpoint an operation concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortRole {
    Relay,
    Device,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Device => f.write_str("device under test"),
        }
    }
}

/// Errors raised by port discovery, opening and reading.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("failed to enumerate serial ports: {0}")]
    Enumerate(String),

    #[error("could not resolve {role} port: {reason}")]
    Discovery { role: PortRole, reason: String },

    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{port} disconnected")]
    Disconnected { port: String },

    #[error("device write on {port} failed: {source}")]
    Write {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

impl PortError {
    /// True when the caller should attempt a device reconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Write { .. })
    }
}

/// Errors raised while commanding the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay command {command:02X?} failed: {source}")]
    Control {
        command: Vec<u8>,
        #[source]
        source: std::io::Error,
    },

    #[error("relay link is closed")]
    LinkClosed,
}
