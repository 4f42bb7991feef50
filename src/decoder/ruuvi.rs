//! RuuviTag decoder.
//!
//! RuuviTags broadcast their measurements in manufacturer-specific
//! advertisement data, so polling reads the data last advertised for the
//! device instead of a GATT characteristic. Every frame carries a measurement
//! sequence number, so a frame identical to the previous one is stale.

use super::{DecodeError, Decoder, Readings};
use crate::ble::Peripheral;
use futures::FutureExt;
use futures::future::BoxFuture;
use ruuvi_decoders::{v5, v6};

/// Ruuvi Innovations manufacturer ID.
///
/// See: https://github.com/ruuvi/ruuvi-sensor-protocols
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

#[derive(Debug, Default)]
pub struct RuuviDecoder {
    last_frame: Option<Vec<u8>>,
}

impl RuuviDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for RuuviDecoder {
    fn poll<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>> {
        async move {
            let Some(data) = peripheral.manufacturer_data(RUUVI_MANUFACTURER_ID).await? else {
                log::debug!("No Ruuvi advertisement cached for {}", peripheral.address());
                return Ok(Readings::new());
            };
            if self.last_frame.as_ref() == Some(&data) {
                log::debug!("No new Ruuvi advertisement from {}", peripheral.address());
                return Ok(Readings::new());
            }
            let readings = decode_ruuvi_data(&data);
            self.last_frame = Some(data);
            readings
        }
        .boxed()
    }
}

/// Decode Ruuvi manufacturer data (without the company ID prefix) into readings.
///
/// Supports data formats 5 (RAWv2) and 6. Values are in SI units:
/// - Pressure in Pascals
/// - Battery voltage in Volts (from millivolts)
/// - Acceleration in g (from milli-g)
pub fn decode_ruuvi_data(data: &[u8]) -> Result<Readings, DecodeError> {
    match data.first() {
        None => Err(DecodeError::InvalidData("Empty data".into())),
        Some(5) => decode_v5(data),
        Some(6) => decode_v6(data),
        Some(format) => Err(DecodeError::UnsupportedFormat(format!(
            "RuuviTag data format {format} (only 5 and 6 supported)"
        ))),
    }
}

fn put<T: Into<super::Scalar>>(readings: &mut Readings, key: &str, value: Option<T>) {
    if let Some(value) = value {
        readings.insert(key.to_string(), value.into());
    }
}

fn decode_v5(data: &[u8]) -> Result<Readings, DecodeError> {
    let tag = v5::decode(data).map_err(|e| {
        DecodeError::DecoderError(format!("Failed to decode RuuviTag data: {e:?}"))
    })?;

    let mut readings = Readings::new();
    put(&mut readings, "temperature", tag.temperature);
    put(&mut readings, "humidity", tag.humidity);
    put(&mut readings, "pressure", tag.pressure);
    put(
        &mut readings,
        "battery",
        tag.battery_voltage.map(|mv| f64::from(mv) / 1000.0),
    );
    put(&mut readings, "tx_power", tag.tx_power);
    put(
        &mut readings,
        "movement_counter",
        tag.movement_counter.map(u32::from),
    );
    put(
        &mut readings,
        "measurement_sequence",
        tag.measurement_sequence.map(u32::from),
    );
    let acceleration = (tag.acceleration_x, tag.acceleration_y, tag.acceleration_z);
    if let (Some(x), Some(y), Some(z)) = acceleration {
        put(&mut readings, "acceleration_x", Some(f64::from(x) / 1000.0));
        put(&mut readings, "acceleration_y", Some(f64::from(y) / 1000.0));
        put(&mut readings, "acceleration_z", Some(f64::from(z) / 1000.0));
    }
    Ok(readings)
}

fn decode_v6(data: &[u8]) -> Result<Readings, DecodeError> {
    let tag = v6::decode(data).map_err(|e| {
        DecodeError::DecoderError(format!("Failed to decode RuuviTag data: {e:?}"))
    })?;

    let mut readings = Readings::new();
    put(&mut readings, "temperature", tag.temperature);
    put(&mut readings, "humidity", tag.humidity);
    // format 6 reports hPa
    put(&mut readings, "pressure", tag.pressure.map(|hpa| hpa * 100.0));
    put(
        &mut readings,
        "measurement_sequence",
        tag.measurement_sequence.map(u32::from),
    );
    put(&mut readings, "pm2_5", tag.pm2_5);
    put(&mut readings, "co2", tag.co2.map(f64::from));
    put(&mut readings, "voc_index", tag.voc_index.map(f64::from));
    put(&mut readings, "nox_index", tag.nox_index.map(f64::from));
    put(&mut readings, "luminosity", tag.luminosity);
    Ok(readings)
}
