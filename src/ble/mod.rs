//! BLE collaborator abstraction.
//!
//! The bridge never talks to a radio directly. Discovery goes through a
//! [`BleCentral`] and per-device GATT traffic through a [`Peripheral`], so the
//! discovery engine and polling scheduler can be tested without Bluetooth
//! hardware. The BlueZ implementation lives in [`bluer`](self::bluer).

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::mac_address::MacAddress;
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// AD type of the Complete Local Name advertisement field.
pub const AD_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// AD type of manufacturer-specific advertisement data.
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xff;

/// Description used for the Complete Local Name field.
pub const COMPLETE_LOCAL_NAME: &str = "Complete Local Name";

/// Build a full 128-bit UUID from a 16-bit Bluetooth SIG assigned number.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Error type for a scan attempt. Always recoverable: the discovery engine retries.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// Errors on an individual device link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("device is not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
}

/// LE address type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressType::Public => write!(f, "public"),
            AddressType::Random => write!(f, "random"),
        }
    }
}

/// One advertisement data field as reported by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct AdField {
    pub ad_type: u8,
    pub description: String,
    pub value: String,
}

impl AdField {
    pub fn new(ad_type: u8, description: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            ad_type,
            description: description.into(),
            value: value.into(),
        }
    }

    pub fn complete_local_name(name: impl Into<String>) -> Self {
        Self::new(AD_TYPE_COMPLETE_LOCAL_NAME, COMPLETE_LOCAL_NAME, name)
    }
}

/// A device seen during a scan window.
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub address_type: AddressType,
    pub rssi: Option<i16>,
    pub fields: Vec<AdField>,
}

impl Advertisement {
    /// The advertised Complete Local Name, if the device exposed one.
    pub fn complete_local_name(&self) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| {
                f.ad_type == AD_TYPE_COMPLETE_LOCAL_NAME || f.description == COMPLETE_LOCAL_NAME
            })
            .map(|f| f.value.as_str())
    }
}

/// A notification received from a subscribed characteristic.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Scanning side of the BLE stack.
pub trait BleCentral: Send + Sync {
    /// Scan for `window` and return every device seen in it.
    fn scan(&self, window: Duration) -> BoxFuture<'_, Result<Vec<Advertisement>, ScanError>>;

    /// Create the persistent link handle for a discovered device. Does not connect.
    fn peripheral(&self, address: MacAddress) -> Result<Box<dyn Peripheral>, ConnectionError>;
}

/// Link to one device.
///
/// Subscriptions registered with [`Peripheral::subscribe`] belong to the
/// handle, not to a single connection: implementations re-arm them on every
/// [`Peripheral::connect`].
pub trait Peripheral: Send {
    fn address(&self) -> MacAddress;

    fn connect(&mut self, address_type: AddressType) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Release the link. A no-op when not connected.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), ConnectionError>>;

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>, ConnectionError>>;

    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Wait up to `timeout` for the next notification. `None` when nothing arrived.
    fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Notification>, ConnectionError>>;

    /// Manufacturer-specific advertisement data last seen for `company_id`.
    fn manufacturer_data(
        &mut self,
        company_id: u16,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>, ConnectionError>>;
}
