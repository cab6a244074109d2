//! Serial transport: port discovery, relay actuation and the DUT log stream.

pub mod device;
pub mod error;
pub mod ports;
pub mod reader;
pub mod relay;

pub use device::{DeviceEndpoint, SerialDevice};
pub use error::{PortError, PortRole, RelayError};
pub use ports::{
    ConnectionState, DiscoveredPorts, PortCatalog, PortDescriptor, PortManager, PortsConfig, SystemPortCatalog,
};
pub use reader::{LineDecoder, LogLine, LogStreamReader, DEFAULT_CHANNEL_CAPACITY, MAX_LINE_BYTES};
pub use relay::{RelayActuator, RelayConfig, RelayLink, RelayModel, StreamRelayLink};
