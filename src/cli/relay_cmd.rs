//! `relay` subcommand: manual relay control for bench setup.
//!
//! Only the relay port is resolved, so the DUT adapter may be unplugged.

use crate::serial::{
    PortManager, PortsConfig, RelayActuator, RelayConfig, RelayError, RelayModel, StreamRelayLink,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayAction {
    On,
    Off,
    Identify,
}

impl RelayAction {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "on" => Some(Self::On),
            "off" | "release" => Some(Self::Off),
            "identify" | "id" => Some(Self::Identify),
            _ => None,
        }
    }
}

/// Perform `action` and describe the result.
pub async fn apply(relay: &RelayActuator, action: RelayAction) -> Result<String, RelayError> {
    match action {
        RelayAction::On => {
            relay.set_power(true).await?;
            Ok("relay on: DUT powered".to_string())
        }
        RelayAction::Off => {
            relay.ensure_off().await?;
            Ok("relay off: DUT released".to_string())
        }
        RelayAction::Identify => {
            let model = relay.identify().await?;
            Ok(match model {
                RelayModel::Unknown(reply) => format!("relay board: unknown (reply {reply:02X?})"),
                known => format!("relay board: {}-channel", known.channels().unwrap_or_default()),
            })
        }
    }
}

/// Open the relay port, run `action` and close the port.
///
/// Returns 0 on success, 1 on a relay command failure, 3 on a port error.
pub async fn run(ports: &PortsConfig, relay: &RelayConfig, action: RelayAction) -> i32 {
    let mut manager = PortManager::system(ports.clone());
    let stream = match manager.discover_relay().and_then(|_| manager.open_relay()) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 3;
        }
    };

    let actuator = RelayActuator::new(relay.clone(), Box::new(StreamRelayLink::new(stream)));
    let code = match apply(&actuator, action).await {
        Ok(message) => {
            println!("{message}");
            0
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            1
        }
    };
    actuator.close().await;
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn quick() -> RelayConfig {
        RelayConfig {
            settle_ms: 0,
            handshake_wait_ms: 20,
            ..RelayConfig::default()
        }
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(RelayAction::parse("ON"), Some(RelayAction::On));
        assert_eq!(RelayAction::parse("release"), Some(RelayAction::Off));
        assert_eq!(RelayAction::parse("id"), Some(RelayAction::Identify));
        assert_eq!(RelayAction::parse("toggle"), None);
    }

    #[tokio::test]
    async fn test_off_writes_release_byte() {
        let mock = Builder::new().write(&[0x4F]).build();
        let relay = RelayActuator::new(quick(), Box::new(StreamRelayLink::new(mock)));
        let message = apply(&relay, RelayAction::Off).await.unwrap();
        assert!(message.contains("released"));
        assert!(!relay.is_powered_on());
    }

    #[tokio::test]
    async fn test_identify_reports_channels() {
        let mock = Builder::new()
            .write(&[0x4F])
            .write(&[0x51])
            .read(&[0xAB])
            .write(&[0x4F])
            .build();
        let relay = RelayActuator::new(quick(), Box::new(StreamRelayLink::new(mock)));
        let message = apply(&relay, RelayAction::Identify).await.unwrap();
        assert_eq!(message, "relay board: 4-channel");
    }
}
