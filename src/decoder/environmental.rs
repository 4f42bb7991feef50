//! Environmental Sensing Service decoder (temperature and humidity).

use super::{DecodeError, Decoder, Readings, read_optional};
use crate::ble::{Peripheral, bluetooth_uuid};
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Temperature characteristic (0x2A6E): sint16, 0.01 °C.
pub const TEMPERATURE: Uuid = bluetooth_uuid(0x2a6e);

/// Humidity characteristic (0x2A6F): uint16, 0.01 %.
pub const HUMIDITY: Uuid = bluetooth_uuid(0x2a6f);

#[derive(Debug, Default)]
pub struct EnvironmentalDecoder;

impl EnvironmentalDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for EnvironmentalDecoder {
    fn poll<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>> {
        async move {
            let mut readings = Readings::new();
            if let Some(raw) = read_optional(peripheral, TEMPERATURE).await? {
                readings.insert("temperature".into(), decode_temperature(&raw)?.into());
            }
            if let Some(raw) = read_optional(peripheral, HUMIDITY).await? {
                readings.insert("humidity".into(), decode_humidity(&raw)?.into());
            }
            Ok(readings)
        }
        .boxed()
    }
}

fn two_bytes(raw: &[u8], what: &str) -> Result<[u8; 2], DecodeError> {
    raw.try_into().map_err(|_| {
        DecodeError::InvalidData(format!("{what} must be 2 bytes, got {}", raw.len()))
    })
}

/// Degrees Celsius. 0x8000 means "value is not known".
pub fn decode_temperature(raw: &[u8]) -> Result<f64, DecodeError> {
    match i16::from_le_bytes(two_bytes(raw, "temperature")?) {
        i16::MIN => Err(DecodeError::InvalidData("temperature not known".into())),
        v => Ok(f64::from(v) / 100.0),
    }
}

/// Relative humidity in percent. 0xFFFF means "value is not known".
pub fn decode_humidity(raw: &[u8]) -> Result<f64, DecodeError> {
    match u16::from_le_bytes(two_bytes(raw, "humidity")?) {
        u16::MAX => Err(DecodeError::InvalidData("humidity not known".into())),
        v => Ok(f64::from(v) / 100.0),
    }
}
