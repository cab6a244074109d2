//! Seam for structured register exchange with the DUT.
//!
//! The harness never implements the DUT wire format. A [`DutCodec`] supplied
//! by the embedding application turns register requests into bytes and reply
//! bytes into fields; the cycle controller only moves those bytes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serial::LogLine;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    /// Bytes are not a frame this codec understands (e.g. a plain log line).
    #[error("not a codec frame")]
    NotAFrame,
}

/// A decoded reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecodedFrame {
    pub fields: BTreeMap<String, serde_json::Value>,
    pub status: i32,
}

/// External encoder/decoder for the DUT register protocol.
pub trait DutCodec: Send + Sync {
    fn encode(&self, device_id: u8, command: u8, register_addr: u16, count: u16) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, bytes: &[u8]) -> Result<DecodedFrame, CodecError>;
}

/// One register read issued after every power-on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub device_id: u8,
    pub command: u8,
    pub register_addr: u16,
    #[serde(default = "default_count")]
    pub count: u16,
    /// How long to wait for the reply before giving up.
    #[serde(default = "default_reply_wait_ms")]
    pub reply_wait_ms: u64,
}

fn default_count() -> u16 {
    1
}

fn default_reply_wait_ms() -> u64 {
    500
}

impl RegisterRequest {
    pub fn reply_wait(&self) -> Duration {
        Duration::from_millis(self.reply_wait_ms)
    }
}

/// Pairs a codec with the request it should issue.
pub struct RegisterProbe {
    codec: Box<dyn DutCodec>,
    request: RegisterRequest,
}

impl RegisterProbe {
    pub fn new(codec: Box<dyn DutCodec>, request: RegisterRequest) -> Self {
        Self { codec, request }
    }

    pub fn request(&self) -> &RegisterRequest {
        &self.request
    }

    pub fn encode_request(&self) -> Result<Vec<u8>, CodecError> {
        let r = &self.request;
        self.codec.encode(r.device_id, r.command, r.register_addr, r.count)
    }

    /// Try to read a reply out of a received line. Plain log lines yield `None`.
    pub fn match_reply(&self, line: &LogLine) -> Option<Result<DecodedFrame, CodecError>> {
        match self.codec.decode(&line.raw) {
            Err(CodecError::NotAFrame) => None,
            other => Some(other),
        }
    }
}
