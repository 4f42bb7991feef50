//! Heart Rate Service decoder.
//!
//! Heart rate monitors only push measurements through notifications; the
//! polled part is the static body sensor location.

use super::{DecodeError, Decoder, Notifiable, Readings, read_optional};
use crate::ble::{Notification, Peripheral, bluetooth_uuid};
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Heart Rate Measurement characteristic (0x2A37), notify only.
pub const HEART_RATE_MEASUREMENT: Uuid = bluetooth_uuid(0x2a37);

/// Body Sensor Location characteristic (0x2A38), read.
pub const BODY_SENSOR_LOCATION: Uuid = bluetooth_uuid(0x2a38);

const FLAG_HR_U16: u8 = 0x01;
const FLAG_CONTACT_DETECTED: u8 = 0x02;
const FLAG_CONTACT_SUPPORTED: u8 = 0x04;
const FLAG_ENERGY_EXPENDED: u8 = 0x08;
const FLAG_RR_INTERVALS: u8 = 0x10;

#[derive(Debug, Default)]
pub struct HeartRateDecoder {
    notifying: bool,
}

impl HeartRateDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for HeartRateDecoder {
    fn poll<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>> {
        async move {
            let mut readings = Readings::new();
            if let Some(raw) = read_optional(peripheral, BODY_SENSOR_LOCATION).await? {
                match decode_body_sensor_location(&raw) {
                    Ok(location) => {
                        readings.insert("sensor_location".into(), location.into());
                    }
                    Err(e) => log::warn!("Skipping sensor location: {e}"),
                }
            }
            Ok(readings)
        }
        .boxed()
    }

    fn as_notifiable(&mut self) -> Option<&mut dyn Notifiable> {
        Some(self)
    }
}

impl Notifiable for HeartRateDecoder {
    fn start_notify<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<(), DecodeError>> {
        async move {
            peripheral.subscribe(HEART_RATE_MEASUREMENT).await?;
            self.notifying = true;
            Ok(())
        }
        .boxed()
    }

    fn is_notifying(&self) -> bool {
        self.notifying
    }

    fn on_notification(&mut self, notification: &Notification) -> Result<Readings, DecodeError> {
        if notification.characteristic != HEART_RATE_MEASUREMENT {
            log::debug!(
                "Ignoring notification from unexpected characteristic {}",
                notification.characteristic
            );
            return Ok(Readings::new());
        }
        decode_heart_rate_measurement(&notification.value)
    }
}

/// Decode a Heart Rate Measurement value.
///
/// Produces `heart_rate` (bpm), and when flagged `sensor_contact`,
/// `energy_expended` (kJ) and `rr_interval` (seconds, last interval in the packet).
pub fn decode_heart_rate_measurement(raw: &[u8]) -> Result<Readings, DecodeError> {
    let truncated =
        || DecodeError::InvalidData(format!("truncated heart rate measurement: {raw:02x?}"));

    let (&flags, mut rest) = raw.split_first().ok_or_else(truncated)?;
    let mut readings = Readings::new();

    let bpm = if flags & FLAG_HR_U16 != 0 {
        let (value, tail) = take_u16(rest).ok_or_else(truncated)?;
        rest = tail;
        value
    } else {
        let (&value, tail) = rest.split_first().ok_or_else(truncated)?;
        rest = tail;
        u16::from(value)
    };
    readings.insert("heart_rate".into(), bpm.into());

    if flags & FLAG_CONTACT_SUPPORTED != 0 {
        readings.insert(
            "sensor_contact".into(),
            (flags & FLAG_CONTACT_DETECTED != 0).into(),
        );
    }

    if flags & FLAG_ENERGY_EXPENDED != 0 {
        let (energy, tail) = take_u16(rest).ok_or_else(truncated)?;
        rest = tail;
        readings.insert("energy_expended".into(), energy.into());
    }

    if flags & FLAG_RR_INTERVALS != 0 {
        let mut last = None;
        while let Some((rr, tail)) = take_u16(rest) {
            last = Some(rr);
            rest = tail;
        }
        if let Some(rr) = last {
            readings.insert("rr_interval".into(), (f64::from(rr) / 1024.0).into());
        }
    }

    Ok(readings)
}

fn take_u16(raw: &[u8]) -> Option<(u16, &[u8])> {
    match raw {
        [lo, hi, tail @ ..] => Some((u16::from_le_bytes([*lo, *hi]), tail)),
        _ => None,
    }
}

/// Name of a Body Sensor Location value. Values past the assigned range are
/// "Reserved"; only a value that is not exactly one byte is an error.
pub fn decode_body_sensor_location(raw: &[u8]) -> Result<&'static str, DecodeError> {
    let location = match raw {
        [0] => "Other",
        [1] => "Chest",
        [2] => "Wrist",
        [3] => "Finger",
        [4] => "Hand",
        [5] => "Ear Lobe",
        [6] => "Foot",
        [_] => "Reserved",
        _ => {
            return Err(DecodeError::InvalidData(format!(
                "unknown body sensor location {raw:02x?}"
            )));
        }
    };
    Ok(location)
}
