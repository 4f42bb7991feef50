//! Outbound telemetry gateway abstraction.
//!
//! The gateway proxies many logical devices over one session. Every push to a
//! logical device is wrapped in register/unregister, mirroring how the gateway
//! expects sub-devices to come and go.

pub mod thingsboard;

use crate::decoder::Readings;
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Failure talking to the gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("failed to connect to gateway: {0}")]
    Connect(String),
    #[error("failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("failed to encode payload: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Encode(err.to_string())
    }
}

/// Attribute update announcing whether a device is currently discovered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryAttributes {
    pub discovered: bool,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl DiscoveryAttributes {
    pub fn found(device_type: &str, mac_addr: &str, description: &str) -> Self {
        Self {
            discovered: true,
            device_type: Some(device_type.to_string()),
            mac_addr: Some(mac_addr.to_string()),
            description: Some(description.to_string()),
        }
    }

    pub fn lost() -> Self {
        Self {
            discovered: false,
            device_type: None,
            mac_addr: None,
            description: None,
        }
    }
}

/// One timestamped telemetry sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryEnvelope {
    /// Milliseconds since the Unix epoch
    pub ts: u64,
    pub values: Readings,
}

impl TelemetryEnvelope {
    pub fn new(ts: u64, values: Readings) -> Self {
        Self { ts, values }
    }

    /// Stamp `values` with the current wall-clock time.
    pub fn now(values: Readings) -> Self {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::new(ts, values)
    }
}

/// Telemetry gateway client. No retry policy is imposed here.
pub trait TelemetrySink: Send + Sync {
    fn register_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;

    fn send_attributes<'a>(
        &'a self,
        name: &'a str,
        attributes: &'a DiscoveryAttributes,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn send_telemetry<'a>(
        &'a self,
        name: &'a str,
        envelope: &'a TelemetryEnvelope,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn unregister_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
}

/// Push an attribute update for `name`, registering the device around it.
pub async fn announce(
    sink: &dyn TelemetrySink,
    name: &str,
    attributes: &DiscoveryAttributes,
) -> Result<(), TransportError> {
    sink.register_device(name).await?;
    sink.send_attributes(name, attributes).await?;
    sink.unregister_device(name).await
}

/// Push one telemetry sample for `name`, registering the device around it.
pub async fn publish(
    sink: &dyn TelemetrySink,
    name: &str,
    envelope: &TelemetryEnvelope,
) -> Result<(), TransportError> {
    sink.register_device(name).await?;
    sink.send_telemetry(name, envelope).await?;
    sink.unregister_device(name).await
}
