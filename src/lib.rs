//! relay-soak: relay power-cycle endurance harness.
//!
//! Repeatedly power-cycles a device under test (DUT) through a serial relay,
//! watches the DUT's serial debug log, and decides per cycle whether the DUT
//! booted and shut down correctly or whether a fault burst must stop the run.
//!
//! # Safety Rules
//!
//! - The relay is released before the first cycle and on every exit path.
//! - Only the cycle controller may abort a session; transport errors are
//!   recovered at the lowest layer that can (reconnect, re-assert release).
//! - Relay writes are serialized; at most one command is in flight.

pub mod cli;
pub mod codec;
pub mod config;
pub mod cycle;
pub mod rules;
pub mod serial;
pub mod shutdown;
pub mod telemetry;

use std::sync::Arc;

use thiserror::Error;

use codec::{DutCodec, RegisterProbe};
use config::{ConfigError, HarnessConfig};
use cycle::CycleController;
use serial::{PortError, PortManager, RelayActuator, SerialDevice, StreamRelayLink};
use shutdown::{StopController, StopOutcome};
use telemetry::{RecorderError, StatsRecorder};

/// Errors raised while bringing the harness up.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Recorder(#[from] RecorderError),
}

impl HarnessError {
    /// Process exit code: 2 for configuration problems, 3 for port problems.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Recorder(_) => 2,
            Self::Port(_) => 3,
        }
    }
}

/// A connected harness, ready to run.
pub struct Harness {
    pub stats: Arc<StatsRecorder>,
    pub relay: Arc<RelayActuator>,
    pub stop: Arc<StopController>,
    controller: CycleController<SerialDevice>,
}

impl Harness {
    /// Discover and open both ports and wire up the session.
    ///
    /// `codec` enables the register probe when `cycle.register_probe` is set.
    pub fn connect(config: HarnessConfig, codec: Option<Box<dyn DutCodec>>) -> Result<Self, HarnessError> {
        let rules = Arc::new(config.rule_set()?);
        let decoder = config.decoder()?;

        let mut ports = PortManager::system(config.ports.clone());
        ports.discover()?;
        let relay_stream = ports.open_relay()?;
        let device_stream = ports.open_device()?;

        let stats = Arc::new(StatsRecorder::from_config(&config.logs)?);
        let relay = Arc::new(RelayActuator::new(
            config.relay.clone(),
            Box::new(StreamRelayLink::new(relay_stream)),
        ));
        let stop = Arc::new(StopController::new(relay.clone(), stats.clone()));
        let device = SerialDevice::new(ports, device_stream, decoder, config.reader.channel_capacity);

        let mut controller = CycleController::new(
            config.cycle.clone(),
            rules,
            relay.clone(),
            device,
            stats.clone(),
            stop.clone(),
        )
        .with_reconnect_budget(config.ports.max_reconnect_failures);

        match (codec, config.cycle.register_probe.clone()) {
            (Some(codec), Some(request)) => controller = controller.with_probe(RegisterProbe::new(codec, request)),
            (None, Some(_)) => tracing::warn!("register probe configured but no codec supplied, probe disabled"),
            _ => {}
        }

        Ok(Self {
            stats,
            relay,
            stop,
            controller,
        })
    }

    /// Run the soak loop to completion.
    pub async fn run(mut self) -> StopOutcome {
        self.controller.run().await
    }
}
