//! Per-device-type decoders.
//!
//! A decoder turns raw BLE data from one device into named [`Readings`].
//! Every decoder can be polled; decoders for devices that push data also
//! expose the [`Notifiable`] capability through [`Decoder::as_notifiable`].
//!
//! Decoders are instantiated through the factory table in
//! [`crate::registry`], one instance per discovered device.

pub mod battery;
pub mod environmental;
pub mod heart_rate;
pub mod ruuvi;

use crate::ble::{ConnectionError, Notification, Peripheral};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Metric name to scalar value.
pub type Readings = BTreeMap<String, Scalar>;

/// A single reading value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<u32> for Scalar {
    fn from(v: u32) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<u16> for Scalar {
    fn from(v: u16) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<u8> for Scalar {
    fn from(v: u8) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<i8> for Scalar {
    fn from(v: i8) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Text(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Text(v)
    }
}

/// Merge notification-sourced and poll-sourced readings.
///
/// Poll values win on key collision.
pub fn merge_readings(notified: Readings, polled: Readings) -> Readings {
    let mut merged = notified;
    merged.extend(polled);
    merged
}

/// Error types for decoding device data.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Unsupported payload format or version
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Invalid or corrupted data that cannot be decoded
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Third-party decoder returned an error
    #[error("Decoder error: {0}")]
    DecoderError(String),
    /// Reading from the device failed
    #[error("Link error: {0}")]
    Link(#[from] ConnectionError),
}

/// Capability every decoder has: synchronous polling over an open link.
pub trait Decoder: Send {
    fn poll<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>>;

    /// The notification capability, for decoders that have one.
    fn as_notifiable(&mut self) -> Option<&mut dyn Notifiable> {
        None
    }
}

/// Capability of decoders whose devices push data through notifications.
pub trait Notifiable: Send {
    /// Subscribe to the device's notifying characteristics.
    fn start_notify<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<(), DecodeError>>;

    fn is_notifying(&self) -> bool;

    fn on_notification(&mut self, notification: &Notification) -> Result<Readings, DecodeError>;
}

/// Read an optional characteristic: a missing characteristic is `None`, other failures propagate.
pub(crate) async fn read_optional(
    peripheral: &mut dyn Peripheral,
    characteristic: uuid::Uuid,
) -> Result<Option<Vec<u8>>, DecodeError> {
    match peripheral.read(characteristic).await {
        Ok(value) => Ok(Some(value)),
        Err(ConnectionError::CharacteristicNotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
