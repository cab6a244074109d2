//! Serial port discovery, opening and device reconnection.
//!
//! Adapters are matched to their role by a case-insensitive substring of the
//! adapter description. A role may instead be pinned to an explicit port name.

use std::time::Duration;

use serde::Serialize;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

use super::error::{PortError, PortRole};

/// A serial adapter as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortDescriptor {
    pub name: String,
    pub description: String,
}

impl PortDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
        }
    }
}

/// Source of the adapter list. Swapped out in tests.
pub trait PortCatalog: Send + Sync {
    fn list(&self) -> Result<Vec<PortDescriptor>, PortError>;
}

/// Catalog backed by the OS serial port enumeration.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortCatalog;

impl PortCatalog for SystemPortCatalog {
    fn list(&self) -> Result<Vec<PortDescriptor>, PortError> {
        let ports = tokio_serial::available_ports().map_err(|e| PortError::Enumerate(e.to_string()))?;
        Ok(ports
            .into_iter()
            .map(|p| PortDescriptor {
                description: describe(&p.port_type, &p.port_name),
                name: p.port_name,
            })
            .collect())
    }
}

fn describe(port_type: &SerialPortType, name: &str) -> String {
    match port_type {
        SerialPortType::UsbPort(usb) => {
            let mut parts = vec!["usb".to_string()];
            parts.extend(usb.product.clone());
            parts.extend(usb.manufacturer.clone());
            parts.push(format!("{:04x}:{:04x}", usb.vid, usb.pid));
            parts.join(" ")
        }
        SerialPortType::PciPort => format!("pci {name}"),
        SerialPortType::BluetoothPort => format!("bluetooth {name}"),
        SerialPortType::Unknown => name.to_string(),
    }
}

/// Port matching and line settings.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Description substring identifying the relay adapter.
    pub relay_match: String,
    /// Description substring identifying the DUT log adapter.
    pub device_match: String,
    /// Explicit relay port name, bypassing discovery.
    pub relay_port: Option<String>,
    /// Explicit device port name, bypassing discovery.
    pub device_port: Option<String>,
    pub relay_baud: u32,
    pub device_baud: u32,
    pub open_timeout_ms: u64,
    pub reconnect_backoff_secs: f64,
    /// Consecutive failed reconnects before the session is aborted.
    pub max_reconnect_failures: u32,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            relay_match: "ch340".to_string(),
            device_match: "cp210".to_string(),
            relay_port: None,
            device_port: None,
            relay_baud: 9600,
            device_baud: 115_200,
            open_timeout_ms: 100,
            reconnect_backoff_secs: 3.0,
            max_reconnect_failures: 3,
        }
    }
}

impl PortsConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_backoff_secs.max(0.0))
    }
}

/// Observable state of one serial endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub role: PortRole,
    pub port_name: Option<String>,
    pub baud: u32,
    pub is_open: bool,
    pub last_error: Option<String>,
}

impl ConnectionState {
    fn new(role: PortRole, baud: u32) -> Self {
        Self {
            role,
            port_name: None,
            baud,
            is_open: false,
            last_error: None,
        }
    }
}

/// Resolved port names for both roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredPorts {
    pub device: String,
    pub relay: String,
}

/// Discovers, opens and reconnects the two serial endpoints.
pub struct PortManager {
    config: PortsConfig,
    catalog: Box<dyn PortCatalog>,
    relay: ConnectionState,
    device: ConnectionState,
}

impl PortManager {
    pub fn new(config: PortsConfig, catalog: Box<dyn PortCatalog>) -> Self {
        let relay = ConnectionState::new(PortRole::Relay, config.relay_baud);
        let device = ConnectionState::new(PortRole::Device, config.device_baud);
        Self {
            config,
            catalog,
            relay,
            device,
        }
    }

    /// Manager backed by the OS port list.
    pub fn system(config: PortsConfig) -> Self {
        Self::new(config, Box::new(SystemPortCatalog))
    }

    pub fn config(&self) -> &PortsConfig {
        &self.config
    }

    pub fn state(&self, role: PortRole) -> &ConnectionState {
        match role {
            PortRole::Relay => &self.relay,
            PortRole::Device => &self.device,
        }
    }

    fn state_mut(&mut self, role: PortRole) -> &mut ConnectionState {
        match role {
            PortRole::Relay => &mut self.relay,
            PortRole::Device => &mut self.device,
        }
    }

    /// List every adapter the catalog reports.
    pub fn available(&self) -> Result<Vec<PortDescriptor>, PortError> {
        self.catalog.list()
    }

    /// Resolve both roles. Fails naming the role that could not be resolved.
    pub fn discover(&mut self) -> Result<DiscoveredPorts, PortError> {
        let ports = self.catalog.list()?;
        let device = self.resolve(PortRole::Device, &ports)?;
        let relay = self.resolve(PortRole::Relay, &ports)?;

        if device == relay {
            return Err(PortError::Discovery {
                role: PortRole::Relay,
                reason: format!("{relay} also matches the device role"),
            });
        }

        self.device.port_name = Some(device.clone());
        self.relay.port_name = Some(relay.clone());
        tracing::info!(%device, %relay, "serial ports resolved");
        Ok(DiscoveredPorts { device, relay })
    }

    fn resolve(&self, role: PortRole, ports: &[PortDescriptor]) -> Result<String, PortError> {
        let (pinned, needle) = match role {
            PortRole::Relay => (&self.config.relay_port, &self.config.relay_match),
            PortRole::Device => (&self.config.device_port, &self.config.device_match),
        };
        if let Some(name) = pinned {
            return Ok(name.clone());
        }

        let needle = needle.to_lowercase();
        let candidates: Vec<&PortDescriptor> = ports
            .iter()
            .filter(|p| p.description.to_lowercase().contains(&needle))
            .collect();

        match candidates.as_slice() {
            [only] => Ok(only.name.clone()),
            [] => Err(PortError::Discovery {
                role,
                reason: format!("no adapter description contains \"{needle}\""),
            }),
            many => Err(PortError::Discovery {
                role,
                reason: format!(
                    "ambiguous match for \"{needle}\": {}",
                    many.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
                ),
            }),
        }
    }

    /// Open `port` at `baud`, recording the outcome against `role`.
    pub fn open(&mut self, role: PortRole, port: &str, baud: u32) -> Result<SerialStream, PortError> {
        let timeout = self.config.open_timeout();
        let result = tokio_serial::new(port, baud)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| PortError::Open {
                port: port.to_string(),
                source: e.into(),
            });

        let state = self.state_mut(role);
        state.port_name = Some(port.to_string());
        state.baud = baud;
        match &result {
            Ok(_) => {
                state.is_open = true;
                state.last_error = None;
                tracing::info!(%role, port, baud, "serial port opened");
            }
            Err(e) => {
                state.is_open = false;
                state.last_error = Some(e.to_string());
                tracing::error!(%role, port, error = %e, "serial port open failed");
            }
        }
        result
    }

    /// Open the relay port resolved by [`discover`](Self::discover).
    pub fn open_relay(&mut self) -> Result<SerialStream, PortError> {
        let port = self.resolved(PortRole::Relay)?;
        self.open(PortRole::Relay, &port, self.config.relay_baud)
    }

    /// Open the device port resolved by [`discover`](Self::discover).
    pub fn open_device(&mut self) -> Result<SerialStream, PortError> {
        let port = self.resolved(PortRole::Device)?;
        self.open(PortRole::Device, &port, self.config.device_baud)
    }

    fn resolved(&self, role: PortRole) -> Result<String, PortError> {
        self.state(role).port_name.clone().ok_or(PortError::Discovery {
            role,
            reason: "port not discovered yet".to_string(),
        })
    }

    /// Re-run discovery for the device role only. The relay port is assumed stable.
    pub fn rediscover_device(&mut self) -> Result<String, PortError> {
        let ports = self.catalog.list()?;
        let device = self.resolve(PortRole::Device, &ports)?;
        self.device.port_name = Some(device.clone());
        Ok(device)
    }

    /// Resolve the relay role alone, for relay-only commands.
    pub fn discover_relay(&mut self) -> Result<String, PortError> {
        let ports = self.catalog.list()?;
        let relay = self.resolve(PortRole::Relay, &ports)?;
        self.relay.port_name = Some(relay.clone());
        Ok(relay)
    }

    /// Close the stale device handle, back off, rediscover and open once.
    ///
    /// Failure is reported, not retried; the caller decides whether to loop.
    pub async fn reconnect_device(&mut self, stale: Option<SerialStream>) -> Result<SerialStream, PortError> {
        drop(stale);
        self.mark_closed(PortRole::Device);

        let backoff = self.config.reconnect_backoff();
        tracing::warn!(backoff_ms = backoff.as_millis() as u64, "device port lost, reconnecting");
        tokio::time::sleep(backoff).await;

        let port = match self.rediscover_device() {
            Ok(port) => port,
            Err(e) => {
                self.device.last_error = Some(e.to_string());
                return Err(e);
            }
        };
        let stream = self.open(PortRole::Device, &port, self.config.device_baud)?;
        tracing::info!(port = %port, "device port reconnected");
        Ok(stream)
    }

    /// Record that the endpoint handle has been dropped.
    pub fn mark_closed(&mut self, role: PortRole) {
        self.state_mut(role).is_open = false;
    }

    /// Record a transport error against an endpoint.
    pub fn mark_error(&mut self, role: PortRole, error: &str) {
        let state = self.state_mut(role);
        state.is_open = false;
        state.last_error = Some(error.to_string());
    }
}
