//! The DUT side of the harness: log lines in, probe requests out.

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio_serial::SerialStream;

use super::error::{PortError, PortRole};
use super::ports::PortManager;
use super::reader::{LineDecoder, LogLine, LogStreamReader};

/// Endpoint the cycle controller monitors. Implemented by [`SerialDevice`]
/// and by scripted fakes in tests.
#[async_trait]
pub trait DeviceEndpoint: Send {
    fn port_name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Non-blocking: an empty vector means nothing arrived yet.
    fn read_available(&mut self) -> Result<Vec<LogLine>, PortError>;

    /// Drop buffered output, returning the number of bytes discarded.
    fn discard_pending(&mut self) -> usize;

    /// One reconnect attempt, including the backoff delay.
    async fn reconnect(&mut self) -> Result<(), PortError>;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PortError>;

    async fn close(&mut self);
}

/// DUT log port backed by a real serial adapter.
pub struct SerialDevice {
    ports: PortManager,
    decoder: LineDecoder,
    capacity: usize,
    port: String,
    reader: Option<LogStreamReader>,
    writer: Option<WriteHalf<SerialStream>>,
}

impl SerialDevice {
    /// Wrap an already opened device stream.
    pub fn new(ports: PortManager, stream: SerialStream, decoder: LineDecoder, capacity: usize) -> Self {
        let port = ports
            .state(PortRole::Device)
            .port_name
            .clone()
            .unwrap_or_default();
        let mut device = Self {
            ports,
            decoder,
            capacity,
            port,
            reader: None,
            writer: None,
        };
        device.attach(stream);
        device
    }

    fn attach(&mut self, stream: SerialStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        self.reader = Some(LogStreamReader::spawn(read_half, &self.port, self.decoder, self.capacity));
        self.writer = Some(write_half);
    }

    fn detach(&mut self) {
        self.reader = None;
        self.writer = None;
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    fn disconnected(&self) -> PortError {
        PortError::Disconnected {
            port: self.port.clone(),
        }
    }
}

#[async_trait]
impl DeviceEndpoint for SerialDevice {
    fn port_name(&self) -> &str {
        &self.port
    }

    fn is_connected(&self) -> bool {
        self.reader.as_ref().is_some_and(LogStreamReader::is_open)
    }

    fn read_available(&mut self) -> Result<Vec<LogLine>, PortError> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(self.disconnected());
        };
        match reader.read_available() {
            Ok(lines) => Ok(lines),
            Err(e) => {
                self.ports.mark_error(PortRole::Device, &e.to_string());
                Err(e)
            }
        }
    }

    fn discard_pending(&mut self) -> usize {
        self.reader.as_mut().map_or(0, LogStreamReader::discard_pending)
    }

    async fn reconnect(&mut self) -> Result<(), PortError> {
        self.detach();
        let stream = self.ports.reconnect_device(None).await?;
        if let Some(name) = self.ports.state(PortRole::Device).port_name.clone() {
            self.port = name;
        }
        self.attach(stream);
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), PortError> {
        let port = self.port.clone();
        let writer = self.writer.as_mut().ok_or_else(|| PortError::Disconnected { port: port.clone() })?;
        let result = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        }
        .await;
        result.map_err(|source| PortError::Write { port, source })
    }

    async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.reader = None;
        self.ports.mark_closed(PortRole::Device);
        tracing::debug!(port = %self.port, "device port closed");
    }
}
