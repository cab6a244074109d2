//! Relay actuation over a single-byte serial command protocol.
//!
//! All writes go through one async mutex, so only one command is ever in
//! flight regardless of whether it comes from the cycle loop or the stop path.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::error::RelayError;

/// Byte-level transport to the relay board.
#[async_trait]
pub trait RelayLink: Send {
    async fn write_command(&mut self, command: &[u8]) -> io::Result<()>;

    /// Collect whatever reply bytes arrive within `wait`.
    async fn read_reply(&mut self, wait: Duration) -> io::Result<Vec<u8>>;

    async fn close(&mut self) -> io::Result<()>;
}

/// [`RelayLink`] over any async byte stream (a serial port in production).
pub struct StreamRelayLink<S> {
    stream: Option<S>,
}

impl<S> StreamRelayLink<S> {
    pub fn new(stream: S) -> Self {
        Self { stream: Some(stream) }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "relay stream closed")
}

#[async_trait]
impl<S> RelayLink for StreamRelayLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn write_command(&mut self, command: &[u8]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        stream.write_all(command).await?;
        stream.flush().await
    }

    async fn read_reply(&mut self, wait: Duration) -> io::Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or_else(closed)?;
        let deadline = Instant::now() + wait;
        let mut reply = Vec::new();
        let mut buf = [0u8; 64];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => reply.extend_from_slice(&buf[..n]),
                Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => break,
                Ok(Err(e)) => return Err(e),
            }
        }
        Ok(reply)
    }

    async fn close(&mut self) -> io::Result<()> {
        match self.stream.take() {
            Some(mut stream) => stream.shutdown().await,
            None => Ok(()),
        }
    }
}

/// Relay command bytes and timing. The bytes are fixed per relay hardware model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Command that energizes the DUT (press / assert).
    pub on_command: Vec<u8>,
    /// Command that releases the relay (fail-safe state).
    pub off_command: Vec<u8>,
    /// Enable / handshake query used to identify the board.
    pub handshake_command: Vec<u8>,
    /// Pause after each command for the contacts to settle.
    pub settle_ms: u64,
    /// How long to wait for a handshake reply.
    pub handshake_wait_ms: u64,
    /// Attempts when re-asserting the released state.
    pub retry_attempts: u32,
    pub identify_on_start: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            on_command: vec![0x50],
            off_command: vec![0x4F],
            handshake_command: vec![0x51],
            settle_ms: 100,
            handshake_wait_ms: 1000,
            retry_attempts: 3,
            identify_on_start: false,
        }
    }
}

impl RelayConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Relay board variant reported by the handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RelayModel {
    TwoChannel,
    FourChannel,
    EightChannel,
    Unknown(Vec<u8>),
}

impl RelayModel {
    pub fn from_reply(reply: &[u8]) -> Self {
        if reply.contains(&0xAC) {
            Self::EightChannel
        } else if reply.contains(&0xAB) {
            Self::FourChannel
        } else if reply.contains(&0xAD) {
            Self::TwoChannel
        } else {
            Self::Unknown(reply.to_vec())
        }
    }

    pub fn channels(&self) -> Option<u8> {
        match self {
            Self::TwoChannel => Some(2),
            Self::FourChannel => Some(4),
            Self::EightChannel => Some(8),
            Self::Unknown(_) => None,
        }
    }
}

/// Drives DUT power through the relay and tracks the believed relay state.
pub struct RelayActuator {
    config: RelayConfig,
    link: Mutex<Option<Box<dyn RelayLink>>>,
    powered: AtomicBool,
    state_known: AtomicBool,
}

impl RelayActuator {
    pub fn new(config: RelayConfig, link: Box<dyn RelayLink>) -> Self {
        Self {
            config,
            link: Mutex::new(Some(link)),
            powered: AtomicBool::new(false),
            state_known: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Last state successfully commanded.
    pub fn is_powered_on(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    /// False after a failed write: the physical relay state is unknown.
    pub fn state_known(&self) -> bool {
        self.state_known.load(Ordering::Acquire)
    }

    /// Write the on or off command and wait for the contacts to settle.
    pub async fn set_power(&self, on: bool) -> Result<(), RelayError> {
        let command = if on {
            &self.config.on_command
        } else {
            &self.config.off_command
        };

        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or(RelayError::LinkClosed)?;

        if let Err(source) = link.write_command(command).await {
            self.state_known.store(false, Ordering::Release);
            tracing::error!(on, error = %source, "relay command failed");
            return Err(RelayError::Control {
                command: command.clone(),
                source,
            });
        }

        tokio::time::sleep(self.config.settle()).await;
        self.powered.store(on, Ordering::Release);
        self.state_known.store(true, Ordering::Release);
        tracing::debug!(on, "relay switched");
        Ok(())
    }

    /// Re-assert the released state, retrying up to `retry_attempts` times.
    pub async fn ensure_off(&self) -> Result<(), RelayError> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last = RelayError::LinkClosed;
        for attempt in 1..=attempts {
            match self.set_power(false).await {
                Ok(()) => return Ok(()),
                Err(RelayError::LinkClosed) => return Err(RelayError::LinkClosed),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "relay release failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Identify the relay board: release, send the handshake, read the reply,
    /// then release again so the board is left in the fail-safe state.
    pub async fn identify(&self) -> Result<RelayModel, RelayError> {
        self.set_power(false).await?;

        let reply = {
            let mut guard = self.link.lock().await;
            let link = guard.as_mut().ok_or(RelayError::LinkClosed)?;
            let command = &self.config.handshake_command;
            link.write_command(command).await.map_err(|source| RelayError::Control {
                command: command.clone(),
                source,
            })?;
            link.read_reply(Duration::from_millis(self.config.handshake_wait_ms))
                .await
                .map_err(|source| RelayError::Control {
                    command: command.clone(),
                    source,
                })?
        };

        let model = RelayModel::from_reply(&reply);
        match &model {
            RelayModel::Unknown(bytes) if bytes.is_empty() => {
                tracing::warn!("relay returned no handshake reply")
            }
            RelayModel::Unknown(bytes) => tracing::warn!(reply = ?bytes, "unrecognized relay handshake reply"),
            known => tracing::info!(channels = known.channels(), "relay board identified"),
        }

        self.set_power(false).await?;
        Ok(model)
    }

    /// Close the link. Later commands fail with [`RelayError::LinkClosed`].
    pub async fn close(&self) {
        let mut guard = self.link.lock().await;
        if let Some(mut link) = guard.take() {
            if let Err(e) = link.close().await {
                tracing::warn!(error = %e, "relay link close failed");
            }
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.link.lock().await.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RelayConfig {
        RelayConfig {
            settle_ms: 0,
            handshake_wait_ms: 50,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_model_from_reply() {
        assert_eq!(RelayModel::from_reply(&[0x00, 0xAC]), RelayModel::EightChannel);
        assert_eq!(RelayModel::from_reply(&[0xAB]), RelayModel::FourChannel);
        assert_eq!(RelayModel::from_reply(&[0xAD]), RelayModel::TwoChannel);
        assert_eq!(RelayModel::from_reply(&[0x01]).channels(), None);
    }

    #[tokio::test]
    async fn test_set_power_writes_configured_bytes() {
        let mock = tokio_test::io::Builder::new().write(&[0x50]).write(&[0x4F]).build();
        let relay = RelayActuator::new(quick_config(), Box::new(StreamRelayLink::new(mock)));

        relay.set_power(true).await.unwrap();
        assert!(relay.is_powered_on());
        relay.set_power(false).await.unwrap();
        assert!(!relay.is_powered_on());
        assert!(relay.state_known());
    }

    #[tokio::test]
    async fn test_write_failure_marks_state_unknown() {
        let mock = tokio_test::io::Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            .build();
        let relay = RelayActuator::new(quick_config(), Box::new(StreamRelayLink::new(mock)));

        let err = relay.set_power(true).await.unwrap_err();
        assert!(matches!(err, RelayError::Control { .. }));
        assert!(!relay.state_known());
        assert!(!relay.is_powered_on());
    }

    #[tokio::test]
    async fn test_identify_reads_handshake_reply() {
        let mock = tokio_test::io::Builder::new()
            .write(&[0x4F])
            .write(&[0x51])
            .read(&[0xAB])
            .write(&[0x4F])
            .build();
        let relay = RelayActuator::new(quick_config(), Box::new(StreamRelayLink::new(mock)));

        assert_eq!(relay.identify().await.unwrap(), RelayModel::FourChannel);
        assert!(!relay.is_powered_on());
    }

    #[tokio::test]
    async fn test_closed_link_rejects_commands() {
        let mock = tokio_test::io::Builder::new().build();
        let relay = RelayActuator::new(quick_config(), Box::new(StreamRelayLink::new(mock)));
        relay.close().await;
        assert!(relay.is_closed().await);
        assert!(matches!(relay.set_power(false).await, Err(RelayError::LinkClosed)));
    }
}
