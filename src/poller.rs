//! Polling scheduler.
//!
//! One [`tick`] visits every discovered device in turn: connect, collect
//! notification and poll readings, release the link, publish. A failing
//! device is logged and skipped; only a shutdown request ends the tick early.

use crate::ble::{AddressType, ConnectionError};
use crate::decoder::{DecodeError, Readings, merge_readings};
use crate::discovery::{DeviceTable, DiscoveredDevice};
use crate::signal::{Cancelled, Shutdown};
use crate::sink::{TelemetryEnvelope, TelemetrySink, TransportError, publish};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

/// Bounds for the per-device steps of a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollOptions {
    pub connect_timeout: Duration,
    pub poll_timeout: Duration,
    /// How long to wait for one notification burst
    pub notify_timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(10),
            notify_timeout: Duration::from_secs(1),
        }
    }
}

/// Failure confined to one device for one tick.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    Connection(#[from] ConnectionError),
    #[error("decoding failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("publishing failed: {0}")]
    Transport(#[from] TransportError),
}

/// What happened during one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    /// Devices that produced no readings
    pub empty: usize,
    pub failed: usize,
}

enum Outcome {
    Published,
    Empty,
}

/// Poll every device in `table` once.
pub async fn tick(
    table: &mut DeviceTable,
    sink: &dyn TelemetrySink,
    options: &PollOptions,
    shutdown: &Shutdown,
) -> Result<TickReport, Cancelled> {
    let mut report = TickReport::default();

    for device in table.devices_mut() {
        shutdown.check()?;
        match poll_device(device, sink, options, shutdown).await? {
            Ok(Outcome::Published) => report.published += 1,
            Ok(Outcome::Empty) => report.empty += 1,
            Err(e) => {
                log::warn!("{} ({}): {e}", device.display_name, device.address);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn poll_device(
    device: &mut DiscoveredDevice,
    sink: &dyn TelemetrySink,
    options: &PollOptions,
    shutdown: &Shutdown,
) -> Result<Result<Outcome, DeviceError>, Cancelled> {
    log::info!("Connecting to device: {}", device.display_name);

    let collected = tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        collected = collect(device, options) => Some(collected),
    };

    // The link is released exactly once per visit, whatever happened above.
    log::debug!("Disconnecting from {}", device.display_name);
    match timeout(options.connect_timeout, device.peripheral.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::warn!("Disconnecting {} failed: {e}", device.display_name),
        Err(_) => log::warn!("Disconnecting {} timed out", device.display_name),
    }

    let Some(collected) = collected else {
        return Err(Cancelled);
    };
    shutdown.check()?;

    let readings = match collected {
        Ok(readings) => readings,
        Err(e) => return Ok(Err(e)),
    };

    if readings.is_empty() {
        log::info!("No data to send for {}", device.display_name);
        return Ok(Ok(Outcome::Empty));
    }

    let envelope = TelemetryEnvelope::now(readings);
    log::info!(
        "Sending data for {}: {}",
        device.display_name,
        serde_json::to_string(&envelope).unwrap_or_default()
    );
    if let Err(e) = publish(sink, &device.display_name, &envelope).await {
        return Ok(Err(e.into()));
    }
    device.last_telemetry = envelope.values;

    Ok(Ok(Outcome::Published))
}

/// Connect, drain one notification burst if the decoder supports it, then poll.
async fn collect(
    device: &mut DiscoveredDevice,
    options: &PollOptions,
) -> Result<Readings, DeviceError> {
    let name = &device.display_name;
    let peripheral = device.peripheral.as_mut();

    timeout(
        options.connect_timeout,
        peripheral.connect(AddressType::Public),
    )
    .await
    .map_err(|_| ConnectionError::Timeout(options.connect_timeout))??;

    let mut notified = Readings::new();
    if let Some(notifiable) = device.decoder.as_notifiable() {
        if !notifiable.is_notifying() {
            log::info!("Starting notifications for {name}");
            timeout(options.poll_timeout, notifiable.start_notify(&mut *peripheral))
                .await
                .map_err(|_| ConnectionError::Timeout(options.poll_timeout))??;
        }

        log::info!("Getting notification from: {name}");
        if let Some(notification) = peripheral
            .wait_for_notification(options.notify_timeout)
            .await?
        {
            log::debug!(
                "Received notification for {} from {name}",
                notification.characteristic
            );
            notified = notifiable.on_notification(&notification)?;
            log::debug!("Data received: {notified:?}");
        }
    }

    log::info!("Polling data from: {name}");
    let polled = timeout(options.poll_timeout, device.decoder.poll(peripheral))
        .await
        .map_err(|_| DecodeError::Link(ConnectionError::Timeout(options.poll_timeout)))??;
    log::debug!("Data received: {polled:?}");

    Ok(merge_readings(notified, polled))
}
