//! Battery Service decoder.

use super::{DecodeError, Decoder, Readings};
use crate::ble::{Peripheral, bluetooth_uuid};
use futures::FutureExt;
use futures::future::BoxFuture;
use uuid::Uuid;

/// Battery Level characteristic (0x2A19): one byte, percent.
pub const BATTERY_LEVEL: Uuid = bluetooth_uuid(0x2a19);

#[derive(Debug, Default)]
pub struct BatteryDecoder;

impl BatteryDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for BatteryDecoder {
    fn poll<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>> {
        async move {
            let raw = peripheral.read(BATTERY_LEVEL).await?;
            decode_battery_level(&raw)
        }
        .boxed()
    }
}

pub fn decode_battery_level(raw: &[u8]) -> Result<Readings, DecodeError> {
    match raw {
        [level] if *level <= 100 => Ok(Readings::from([(
            "battery_level".to_string(),
            (*level).into(),
        )])),
        [level] => Err(DecodeError::InvalidData(format!(
            "battery level {level}% out of range"
        ))),
        _ => Err(DecodeError::InvalidData(format!(
            "battery level must be 1 byte, got {}",
            raw.len()
        ))),
    }
}
