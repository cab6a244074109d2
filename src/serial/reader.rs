//! Background reader turning a DUT byte stream into timestamped log lines.
//!
//! A spawned task owns the read half and forwards chunks over a bounded
//! channel; the cycle loop drains it without blocking via
//! [`LogStreamReader::read_available`].

use std::io;

use encoding_rs::Encoding;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::error::PortError;
use crate::rules::{normalize, strip_ansi};

const READ_CHUNK: usize = 1024;

/// Longest partial line kept before it is emitted without a terminator.
pub const MAX_LINE_BYTES: usize = 4096;

/// Default capacity of the chunk channel between reader task and consumer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// One line of DUT output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Bytes as received, without the line terminator.
    pub raw: Vec<u8>,
    /// Decoded text with ANSI escapes removed and surrounding whitespace trimmed.
    pub text: String,
    /// Matching form of `text`: lowercase, no whitespace.
    pub cleaned: String,
    /// Some bytes could not be decoded and were replaced.
    pub lossy: bool,
    pub received_at: Instant,
}

impl LogLine {
    pub fn new(raw: Vec<u8>, text: String, lossy: bool, received_at: Instant) -> Self {
        let text = strip_ansi(&text).trim().to_string();
        let cleaned = normalize(&text);
        Self {
            raw,
            text,
            cleaned,
            lossy,
            received_at,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.cleaned.is_empty()
    }
}

/// Decodes raw line bytes using a configured character encoding.
#[derive(Debug, Clone, Copy)]
pub struct LineDecoder {
    encoding: &'static Encoding,
}

impl LineDecoder {
    /// Resolve a WHATWG encoding label such as `utf-8` or `gb18030`.
    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(|encoding| Self { encoding })
    }

    pub fn name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Decode, replacing malformed sequences. The flag reports whether any were replaced.
    pub fn decode(&self, bytes: &[u8]) -> (String, bool) {
        let (text, lossy) = self.encoding.decode_without_bom_handling(bytes);
        (text.into_owned(), lossy)
    }

    pub fn line(&self, raw: Vec<u8>, received_at: Instant) -> LogLine {
        let (text, lossy) = self.decode(&raw);
        LogLine::new(raw, text, lossy, received_at)
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self {
            encoding: encoding_rs::UTF_8,
        }
    }
}

enum ReaderEvent {
    Chunk(Vec<u8>, Instant),
    Closed(Option<io::Error>),
}

/// Consumer side of the background reader task.
pub struct LogStreamReader {
    port: String,
    decoder: LineDecoder,
    rx: mpsc::Receiver<ReaderEvent>,
    partial: Vec<u8>,
    closed: bool,
    task: JoinHandle<()>,
}

impl LogStreamReader {
    /// Spawn the reader task over `reader`.
    pub fn spawn<R>(reader: R, port: &str, decoder: LineDecoder, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(read_loop(reader, tx, port.to_string()));
        Self {
            port: port.to_string(),
            decoder,
            rx,
            partial: Vec::new(),
            closed: false,
            task,
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    /// False once the stream reported EOF or an error.
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Return every complete line received so far without waiting.
    ///
    /// Lines already received are delivered before a disconnect is reported.
    /// A trailing partial line is flushed when the stream closes.
    pub fn read_available(&mut self) -> Result<Vec<LogLine>, PortError> {
        let mut lines = Vec::new();

        while !self.closed {
            match self.rx.try_recv() {
                Ok(ReaderEvent::Chunk(bytes, at)) => self.split_lines(&bytes, at, &mut lines),
                Ok(ReaderEvent::Closed(error)) => {
                    if let Some(e) = error {
                        tracing::warn!(port = %self.port, error = %e, "device read failed");
                    }
                    self.close_partial(&mut lines);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.close_partial(&mut lines),
            }
        }

        if self.closed && lines.is_empty() {
            return Err(PortError::Disconnected {
                port: self.port.clone(),
            });
        }
        Ok(lines)
    }

    /// Drop everything buffered so far, including a partial line.
    pub fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while let Ok(event) = self.rx.try_recv() {
            match event {
                ReaderEvent::Chunk(bytes, _) => dropped += bytes.len(),
                ReaderEvent::Closed(_) => {
                    self.closed = true;
                    break;
                }
            }
        }
        dropped += self.partial.len();
        self.partial.clear();
        dropped
    }

    fn split_lines(&mut self, bytes: &[u8], at: Instant, out: &mut Vec<LogLine>) {
        for &b in bytes {
            if b == b'\n' {
                let mut raw = std::mem::take(&mut self.partial);
                if raw.last() == Some(&b'\r') {
                    raw.pop();
                }
                out.push(self.decoder.line(raw, at));
            } else {
                self.partial.push(b);
                if self.partial.len() >= MAX_LINE_BYTES {
                    let raw = std::mem::take(&mut self.partial);
                    tracing::debug!(port = %self.port, bytes = raw.len(), "unterminated output cut into a line");
                    out.push(self.overlong_line(raw, at));
                }
            }
        }
    }

    /// Lines cut at [`MAX_LINE_BYTES`] are flagged lossy.
    fn overlong_line(&self, raw: Vec<u8>, at: Instant) -> LogLine {
        let (text, _) = self.decoder.decode(&raw);
        LogLine::new(raw, text, true, at)
    }

    fn close_partial(&mut self, out: &mut Vec<LogLine>) {
        self.closed = true;
        if !self.partial.is_empty() {
            let mut raw = std::mem::take(&mut self.partial);
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            out.push(self.decoder.line(raw, Instant::now()));
        }
    }
}

impl Drop for LogStreamReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_loop<R>(mut reader: R, tx: mpsc::Sender<ReaderEvent>, port: String)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(%port, "device stream reached EOF");
                let _ = tx.send(ReaderEvent::Closed(None)).await;
                return;
            }
            Ok(n) => {
                if tx.send(ReaderEvent::Chunk(buf[..n].to_vec(), Instant::now())).await.is_err() {
                    return;
                }
            }
            // Serial ports report an idle read timeout as an error; keep reading.
            Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
            Err(e) => {
                let _ = tx.send(ReaderEvent::Closed(Some(e))).await;
                return;
            }
        }
    }
}
