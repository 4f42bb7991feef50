//! `tb-ble-bridge` library.
//!
//! The binary (`src/main.rs`) is responsible for logger setup, signal handling
//! and process exit codes. The core "business logic" lives in [`crate::app`]
//! where it can be tested deterministically with injected BLE and gateway
//! collaborators.

pub mod app;
pub mod ble;
pub mod command;
pub mod decoder;
pub mod discovery;
pub mod duration;
pub mod mac_address;
pub mod poller;
pub mod registry;
pub mod signal;
pub mod sink;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{Options, RunError, Settings, run_with};
pub use ble::{Advertisement, BleCentral, ConnectionError, Peripheral, ScanError};
pub use command::CommandChannel;
pub use decoder::{DecodeError, Decoder, Notifiable, Readings, Scalar};
pub use discovery::{DeviceTable, DiscoveredDevice, DiscoveryOptions};
pub use duration::parse_duration;
pub use mac_address::MacAddress;
pub use poller::{PollOptions, TickReport};
pub use registry::{ConfigError, ExtensionDescriptor, Registry, builtin_factories};
pub use signal::{Cancelled, RescanSignal, Shutdown, ShutdownTrigger, shutdown_channel};
pub use sink::{DiscoveryAttributes, TelemetryEnvelope, TelemetrySink, TransportError};
