//! Discovery engine.
//!
//! A rescan first retires every known device (announcing `discovered=false`),
//! then scans in fixed windows until a window turns up at least one device
//! advertising a registered name. Every match inside that window is kept;
//! devices missed by it are picked up by a later rescan.

use crate::ble::{Advertisement, BleCentral, Peripheral};
use crate::decoder::{Decoder, Readings};
use crate::mac_address::MacAddress;
use crate::registry::{ExtensionDescriptor, Registry};
use crate::signal::{Cancelled, Shutdown};
use crate::sink::{DiscoveryAttributes, TelemetrySink, announce};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Timing for the scan loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiscoveryOptions {
    /// Length of one scan attempt
    pub scan_window: Duration,
    /// Fixed pause after a failed attempt
    pub retry_delay: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(15),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Gateway name of a device: advertised name plus the separator-free address.
pub fn display_name(ble_name: &str, address: &MacAddress) -> String {
    format!("{}_{}", ble_name, address.compact())
}

/// A matched device together with the state it owns.
pub struct DiscoveredDevice {
    pub address: MacAddress,
    pub display_name: String,
    /// Extension id of the device type
    pub device_type: String,
    pub decoder: Box<dyn Decoder>,
    pub peripheral: Box<dyn Peripheral>,
    pub last_telemetry: Readings,
}

impl DiscoveredDevice {
    pub fn new(
        extension: &ExtensionDescriptor,
        address: MacAddress,
        peripheral: Box<dyn Peripheral>,
    ) -> Self {
        Self {
            address,
            display_name: display_name(&extension.ble_advertised_name, &address),
            device_type: extension.id.clone(),
            decoder: extension.new_decoder(),
            peripheral,
            last_telemetry: Readings::new(),
        }
    }
}

impl fmt::Debug for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredDevice")
            .field("address", &self.address)
            .field("display_name", &self.display_name)
            .field("device_type", &self.device_type)
            .field("last_telemetry", &self.last_telemetry)
            .finish_non_exhaustive()
    }
}

/// Currently discovered devices, grouped by extension id.
///
/// Written only by [`rescan`]; the polling scheduler iterates it.
#[derive(Debug, Default)]
pub struct DeviceTable {
    by_type: BTreeMap<String, BTreeMap<String, DiscoveredDevice>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `device` unless its display name is already taken.
    ///
    /// On collision the existing entry is kept and the rejected device is returned.
    pub fn insert(&mut self, device: DiscoveredDevice) -> Result<(), Box<DiscoveredDevice>> {
        if self.contains(&device.display_name) {
            return Err(Box::new(device));
        }
        self.by_type
            .entry(device.device_type.clone())
            .or_default()
            .insert(device.display_name.clone(), device);
        Ok(())
    }

    pub fn contains(&self, display_name: &str) -> bool {
        self.by_type
            .values()
            .any(|devices| devices.contains_key(display_name))
    }

    pub fn get(&self, display_name: &str) -> Option<&DiscoveredDevice> {
        self.by_type
            .values()
            .find_map(|devices| devices.get(display_name))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DiscoveredDevice> {
        self.by_type.values().flat_map(|devices| devices.values())
    }

    pub fn devices_mut(&mut self) -> impl Iterator<Item = &mut DiscoveredDevice> {
        self.by_type
            .values_mut()
            .flat_map(|devices| devices.values_mut())
    }

    /// Devices of one extension id.
    pub fn of_type(&self, device_type: &str) -> impl Iterator<Item = &DiscoveredDevice> {
        self.by_type
            .get(device_type)
            .into_iter()
            .flat_map(|devices| devices.values())
    }

    pub fn len(&self) -> usize {
        self.by_type.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.by_type.clear();
    }
}

/// Retire all known devices, then scan until at least one registered device is found.
///
/// Scan failures are logged and retried without limit after a fixed
/// `retry_delay`; an empty window is followed directly by the next one.
/// Returns the number of devices now in `table`, or [`Cancelled`] once
/// shutdown is requested.
pub async fn rescan(
    table: &mut DeviceTable,
    registry: &Registry,
    central: &dyn BleCentral,
    sink: &dyn TelemetrySink,
    options: &DiscoveryOptions,
    shutdown: &Shutdown,
) -> Result<usize, Cancelled> {
    retire_all(table, sink).await;

    loop {
        shutdown.check()?;
        log::info!("Scanning BLE devices...");

        let scanned = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Cancelled),
            scanned = central.scan(options.scan_window) => scanned,
        };

        match scanned {
            Ok(advertisements) => {
                for advertisement in &advertisements {
                    match_advertisement(table, registry, central, sink, advertisement).await;
                }
                if !table.is_empty() {
                    log::info!("Discovery complete: {} known device(s)", table.len());
                    return Ok(table.len());
                }
                log::info!("No known devices found, scanning again");
            }
            Err(e) => {
                log::error!("Scan failed: {e}");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(Cancelled),
                    _ = tokio::time::sleep(options.retry_delay) => {}
                }
            }
        }
    }
}

/// Announce every known device as lost and empty the table.
async fn retire_all(table: &mut DeviceTable, sink: &dyn TelemetrySink) {
    for device in table.devices() {
        log::info!("Retiring {}", device.display_name);
        if let Err(e) = announce(sink, &device.display_name, &DiscoveryAttributes::lost()).await {
            log::warn!(
                "Failed to mark {} as undiscovered: {e}",
                device.display_name
            );
        }
    }
    table.clear();
}

async fn match_advertisement(
    table: &mut DeviceTable,
    registry: &Registry,
    central: &dyn BleCentral,
    sink: &dyn TelemetrySink,
    advertisement: &Advertisement,
) {
    log::debug!(
        "Device {} ({}), RSSI={} dB",
        advertisement.address,
        advertisement.address_type,
        advertisement
            .rssi
            .map_or_else(|| "?".to_string(), |rssi| rssi.to_string())
    );
    for field in &advertisement.fields {
        log::debug!("  {} = {}", field.description, field.value);
    }

    let Some(name) = advertisement.complete_local_name() else {
        return;
    };
    let Some(extension) = registry.by_ble_name(name) else {
        return;
    };
    log::info!("Known device found: {name} at {}", advertisement.address);

    let name = display_name(&extension.ble_advertised_name, &advertisement.address);
    if table.contains(&name) {
        log::debug!("{name} already discovered in this scan, ignoring duplicate");
        return;
    }

    let peripheral = match central.peripheral(advertisement.address) {
        Ok(peripheral) => peripheral,
        Err(e) => {
            log::error!("Cannot create link to {}: {e}", advertisement.address);
            return;
        }
    };

    let device = DiscoveredDevice::new(extension, advertisement.address, peripheral);
    let attributes = DiscoveryAttributes::found(
        &extension.id,
        &advertisement.address.to_string(),
        &extension.description,
    );
    if let Err(e) = announce(sink, &device.display_name, &attributes).await {
        log::warn!("Failed to announce {}: {e}", device.display_name);
    }

    if let Err(rejected) = table.insert(device) {
        log::warn!("Display name {} already taken", rejected.display_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::ScanError;
    use crate::registry::builtin_factories;
    use crate::signal::shutdown_channel;
    use crate::test_utils::{
        FakeCentral, FakePeripheral, RecordingSink, SinkCall, TEST_MAC, named_advertisement,
    };
    use serde_json::json;

    const OTHER_MAC: MacAddress = MacAddress([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

    fn registry() -> Registry {
        Registry::from_json(
            r#"{
                "environmental_sensing": { "ble_name": "TEMP01", "description": "Greenhouse" },
                "heart_rate": { "ble_name": "HRM", "description": "Chest strap" }
            }"#,
            &builtin_factories(),
        )
        .unwrap()
    }

    fn fast() -> DiscoveryOptions {
        DiscoveryOptions {
            scan_window: Duration::from_millis(1),
            retry_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_display_name_embeds_compact_address() {
        assert_eq!(display_name("TEMP01", &TEST_MAC), "TEMP01_AABBCCDDEEFF");
    }

    #[tokio::test]
    async fn test_rescan_announces_match_with_metadata() {
        let central = FakeCentral::new();
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "TEMP01")]));
        let sink = RecordingSink::new();
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();

        let found = rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();

        assert_eq!(found, 1);
        let device = table.get("TEMP01_AABBCCDDEEFF").unwrap();
        assert_eq!(device.address, TEST_MAC);
        assert_eq!(device.device_type, "environmental_sensing");

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Register("TEMP01_AABBCCDDEEFF".into()),
                SinkCall::Attributes(
                    "TEMP01_AABBCCDDEEFF".into(),
                    json!({
                        "discovered": true,
                        "type": "environmental_sensing",
                        "mac_addr": "AA:BB:CC:DD:EE:FF",
                        "description": "Greenhouse",
                    })
                ),
                SinkCall::Unregister("TEMP01_AABBCCDDEEFF".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_rescan_retries_failed_and_empty_windows() {
        let central = FakeCentral::new();
        central.push_scan(Err(ScanError::Bluetooth("adapter busy".into())));
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "UNKNOWN")]));
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "HRM")]));
        let sink = RecordingSink::new();
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();

        rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();

        assert_eq!(central.scan_count(), 3);
        assert!(table.contains("HRM_AABBCCDDEEFF"));
    }

    #[tokio::test]
    async fn test_rescan_keeps_every_match_in_window() {
        let central = FakeCentral::new();
        central.push_scan(Ok(vec![
            named_advertisement(TEST_MAC, "TEMP01"),
            named_advertisement(OTHER_MAC, "TEMP01"),
            named_advertisement(MacAddress([1, 2, 3, 4, 5, 6]), "HRM"),
        ]));
        let sink = RecordingSink::new();
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();

        let found = rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();

        assert_eq!(found, 3);
        assert_eq!(central.scan_count(), 1);
        assert_eq!(table.of_type("environmental_sensing").count(), 2);
        assert_eq!(table.of_type("heart_rate").count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_advertisement_does_not_replace_device() {
        let central = FakeCentral::new();
        let first = FakePeripheral::new(TEST_MAC);
        let probe = first.probe();
        central.add_peripheral(first);
        central.push_scan(Ok(vec![
            named_advertisement(TEST_MAC, "TEMP01"),
            named_advertisement(TEST_MAC, "TEMP01"),
        ]));
        let sink = RecordingSink::new();
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();

        rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(sink.attributes().len(), 1);

        // the kept entry still owns the first peripheral handed out
        let device = table.devices_mut().next().unwrap();
        device
            .peripheral
            .connect(crate::ble::AddressType::Public)
            .await
            .unwrap();
        assert_eq!(probe.connects(), 1);
    }

    #[test]
    fn test_table_insert_rejects_collision() {
        let registry = registry();
        let extension = registry.by_ble_name("TEMP01").unwrap();
        let mut table = DeviceTable::new();

        let link = || Box::new(FakePeripheral::new(TEST_MAC));
        let first = DiscoveredDevice::new(extension, TEST_MAC, link());
        let second = DiscoveredDevice::new(extension, TEST_MAC, link());
        assert!(table.insert(first).is_ok());
        let rejected = table.insert(second).unwrap_err();
        assert_eq!(rejected.display_name, "TEMP01_AABBCCDDEEFF");
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_retires_previous_devices_before_announcing() {
        let central = FakeCentral::new();
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "TEMP01")]));
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "TEMP01")]));
        let sink = RecordingSink::new();
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();
        let registry = registry();

        rescan(&mut table, &registry, &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();
        rescan(&mut table, &registry, &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();

        let flags: Vec<bool> = sink
            .attributes()
            .into_iter()
            .map(|(_, attrs)| attrs["discovered"].as_bool().unwrap())
            .collect();
        assert_eq!(flags, vec![true, false, true]);
        assert_eq!(
            sink.attributes()[1],
            (
                "TEMP01_AABBCCDDEEFF".to_string(),
                json!({ "discovered": false })
            )
        );
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_rescan_survives_announce_failure() {
        let central = FakeCentral::new();
        central.push_scan(Ok(vec![named_advertisement(TEST_MAC, "TEMP01")]));
        let sink = RecordingSink::new();
        sink.fail_attributes_for("TEMP01_AABBCCDDEEFF");
        let (_trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();

        let found = rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown)
            .await
            .unwrap();
        assert_eq!(found, 1);
    }

    #[tokio::test]
    async fn test_rescan_stops_on_shutdown() {
        // nothing ever matches, so only shutdown can end the loop
        let central = FakeCentral::new();
        let sink = RecordingSink::new();
        let (trigger, shutdown) = shutdown_channel();
        let mut table = DeviceTable::new();
        trigger.trigger();

        let result = rescan(&mut table, &registry(), &central, &sink, &fast(), &shutdown).await;
        assert_eq!(result, Err(Cancelled));
    }
}
