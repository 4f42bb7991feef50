//! Scripted stand-ins for the BLE stack, the gateway and decoders.

use crate::ble::{
    AdField, AddressType, Advertisement, BleCentral, ConnectionError, Notification, Peripheral,
    ScanError, bluetooth_uuid,
};
use crate::decoder::{DecodeError, Decoder, Notifiable, Readings, Scalar};
use crate::mac_address::MacAddress;
use crate::sink::{DiscoveryAttributes, TelemetryEnvelope, TelemetrySink, TransportError};
use crate::signal::{RescanSignal, ShutdownTrigger};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Characteristic the scripted notifiable decoder subscribes to.
pub const TEST_NOTIFY_UUID: Uuid = bluetooth_uuid(0xfff1);

/// Build readings from integer pairs.
pub fn int_readings(pairs: &[(&str, i64)]) -> Readings {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Scalar::Int(*v)))
        .collect()
}

/// Advertisement carrying only a Complete Local Name.
pub fn named_advertisement(address: MacAddress, name: &str) -> Advertisement {
    Advertisement {
        address,
        address_type: AddressType::Public,
        rssi: Some(-58),
        fields: vec![
            AdField::new(0x01, "Flags", "06"),
            AdField::complete_local_name(name),
        ],
    }
}

/// Counters shared between a [`FakePeripheral`] and the test that built it.
#[derive(Debug, Default)]
pub struct PeripheralProbe {
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub subscriptions: Mutex<Vec<Uuid>>,
}

impl PeripheralProbe {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct FakePeripheral {
    address: MacAddress,
    characteristics: HashMap<Uuid, Vec<u8>>,
    manufacturer: HashMap<u16, Vec<u8>>,
    notifications: VecDeque<Notification>,
    fail_connect: bool,
    hang_subscribe: bool,
    connected: bool,
    probe: Arc<PeripheralProbe>,
}

impl FakePeripheral {
    pub fn new(address: MacAddress) -> Self {
        Self {
            address,
            characteristics: HashMap::new(),
            manufacturer: HashMap::new(),
            notifications: VecDeque::new(),
            fail_connect: false,
            hang_subscribe: false,
            connected: false,
            probe: Arc::new(PeripheralProbe::default()),
        }
    }

    pub fn with_characteristic(mut self, uuid: Uuid, value: Vec<u8>) -> Self {
        self.characteristics.insert(uuid, value);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, value: Vec<u8>) -> Self {
        self.manufacturer.insert(company_id, value);
        self
    }

    pub fn with_notification(mut self, characteristic: Uuid, value: Vec<u8>) -> Self {
        self.notifications.push_back(Notification {
            characteristic,
            value,
        });
        self
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Make every subscribe call never complete.
    pub fn hanging_subscribe(mut self) -> Self {
        self.hang_subscribe = true;
        self
    }

    pub fn probe(&self) -> Arc<PeripheralProbe> {
        Arc::clone(&self.probe)
    }
}

impl Peripheral for FakePeripheral {
    fn address(&self) -> MacAddress {
        self.address
    }

    fn connect(
        &mut self,
        _address_type: AddressType,
    ) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.probe.connects.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect {
                return Err(ConnectionError::Bluetooth("connection refused".into()));
            }
            self.connected = true;
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.probe.disconnects.fetch_add(1, Ordering::SeqCst);
            self.connected = false;
            Ok(())
        }
        .boxed()
    }

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>, ConnectionError>> {
        async move {
            if !self.connected {
                return Err(ConnectionError::NotConnected);
            }
            self.characteristics
                .get(&characteristic)
                .cloned()
                .ok_or(ConnectionError::CharacteristicNotFound(characteristic))
        }
        .boxed()
    }

    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            if !self.connected {
                return Err(ConnectionError::NotConnected);
            }
            if self.hang_subscribe {
                futures::future::pending::<()>().await;
            }
            if let Ok(mut subs) = self.probe.subscriptions.lock() {
                subs.push(characteristic);
            }
            Ok(())
        }
        .boxed()
    }

    fn wait_for_notification(
        &mut self,
        _timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Notification>, ConnectionError>> {
        async move { Ok(self.notifications.pop_front()) }.boxed()
    }

    fn manufacturer_data(
        &mut self,
        company_id: u16,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>, ConnectionError>> {
        async move { Ok(self.manufacturer.get(&company_id).cloned()) }.boxed()
    }
}

/// Central that replays scripted scan results.
///
/// Once the script runs out every scan returns an empty window.
#[derive(Debug, Default)]
pub struct FakeCentral {
    scans: Mutex<VecDeque<Result<Vec<Advertisement>, ScanError>>>,
    peripherals: Mutex<HashMap<MacAddress, FakePeripheral>>,
    scan_count: AtomicUsize,
}

impl FakeCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_scan(&self, result: Result<Vec<Advertisement>, ScanError>) {
        self.scans.lock().unwrap().push_back(result);
    }

    /// Hand out `peripheral` the next time its address is requested.
    pub fn add_peripheral(&self, peripheral: FakePeripheral) {
        self.peripherals
            .lock()
            .unwrap()
            .insert(peripheral.address, peripheral);
    }

    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }
}

impl BleCentral for FakeCentral {
    fn scan(&self, window: Duration) -> BoxFuture<'_, Result<Vec<Advertisement>, ScanError>> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        let next = self.scans.lock().unwrap().pop_front();
        async move {
            tokio::time::sleep(window).await;
            next.unwrap_or_else(|| Ok(Vec::new()))
        }
        .boxed()
    }

    fn peripheral(&self, address: MacAddress) -> Result<Box<dyn Peripheral>, ConnectionError> {
        let peripheral = self
            .peripherals
            .lock()
            .unwrap()
            .remove(&address)
            .unwrap_or_else(|| FakePeripheral::new(address));
        Ok(Box::new(peripheral))
    }
}

/// One call observed by [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Register(String),
    Attributes(String, serde_json::Value),
    Telemetry(String, serde_json::Value),
    Unregister(String),
}

/// Sink that records every successful call in order.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<SinkCall>>,
    failing_attributes: Mutex<HashSet<String>>,
    failing_telemetry: Mutex<HashSet<String>>,
    shutdown_after: Mutex<Option<(usize, ShutdownTrigger)>>,
    rescan_after: Mutex<Option<(usize, RescanSignal)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_attributes_for(&self, name: &str) {
        self.failing_attributes.lock().unwrap().insert(name.into());
    }

    pub fn fail_telemetry_for(&self, name: &str) {
        self.failing_telemetry.lock().unwrap().insert(name.into());
    }

    /// Fire `trigger` once `count` telemetry pushes have been recorded.
    pub fn shutdown_after_telemetry(&self, count: usize, trigger: ShutdownTrigger) {
        *self.shutdown_after.lock().unwrap() = Some((count, trigger));
    }

    /// Request a rescan when exactly `count` telemetry pushes have been recorded.
    pub fn rescan_after_telemetry(&self, count: usize, signal: RescanSignal) {
        *self.rescan_after.lock().unwrap() = Some((count, signal));
    }

    pub fn telemetry(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Telemetry(name, value) => Some((name, value)),
                _ => None,
            })
            .collect()
    }

    pub fn attributes(&self) -> Vec<(String, serde_json::Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                SinkCall::Attributes(name, value) => Some((name, value)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SinkCall) {
        let is_telemetry = matches!(call, SinkCall::Telemetry(..));
        let mut calls = self.calls.lock().unwrap();
        calls.push(call);
        let telemetry_count = calls
            .iter()
            .filter(|c| matches!(c, SinkCall::Telemetry(..)))
            .count();
        if let Some((count, trigger)) = self.shutdown_after.lock().unwrap().as_ref()
            && telemetry_count >= *count
        {
            trigger.trigger();
        }
        if let Some((count, signal)) = self.rescan_after.lock().unwrap().as_ref()
            && telemetry_count == *count
            && is_telemetry
        {
            signal.request();
        }
    }

    fn rejected(name: &str, topic: &str) -> TransportError {
        TransportError::Publish {
            topic: topic.into(),
            reason: format!("rejected for {name}"),
        }
    }
}

impl TelemetrySink for RecordingSink {
    fn register_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        self.record(SinkCall::Register(name.into()));
        async { Ok(()) }.boxed()
    }

    fn send_attributes<'a>(
        &'a self,
        name: &'a str,
        attributes: &'a DiscoveryAttributes,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = if self.failing_attributes.lock().unwrap().contains(name) {
            Err(Self::rejected(name, "attributes"))
        } else {
            self.record(SinkCall::Attributes(
                name.into(),
                serde_json::to_value(attributes).unwrap(),
            ));
            Ok(())
        };
        async move { result }.boxed()
    }

    fn send_telemetry<'a>(
        &'a self,
        name: &'a str,
        envelope: &'a TelemetryEnvelope,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        let result = if self.failing_telemetry.lock().unwrap().contains(name) {
            Err(Self::rejected(name, "telemetry"))
        } else {
            self.record(SinkCall::Telemetry(
                name.into(),
                serde_json::to_value(envelope).unwrap(),
            ));
            Ok(())
        };
        async move { result }.boxed()
    }

    fn unregister_device<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        self.record(SinkCall::Unregister(name.into()));
        async { Ok(()) }.boxed()
    }
}

/// What a [`ScriptedDecoder`] does when polled.
#[derive(Debug, Clone)]
pub enum PollScript {
    Readings(Readings),
    Fail(String),
    /// Request shutdown, then fail.
    CancelAndFail(ShutdownTrigger),
    /// Request shutdown, then never complete.
    CancelAndHang(ShutdownTrigger),
}

/// Decoder whose behaviour is fixed by the test.
#[derive(Debug)]
pub struct ScriptedDecoder {
    poll: PollScript,
    notify_readings: Option<Readings>,
    notifying: bool,
    arm_calls: Arc<AtomicUsize>,
    polls: Arc<AtomicUsize>,
}

impl ScriptedDecoder {
    pub fn pollable(poll: PollScript) -> Self {
        Self {
            poll,
            notify_readings: None,
            notifying: false,
            arm_calls: Arc::new(AtomicUsize::new(0)),
            polls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn notifiable(poll: PollScript, notify_readings: Readings) -> Self {
        Self {
            notify_readings: Some(notify_readings),
            ..Self::pollable(poll)
        }
    }

    pub fn arm_calls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.arm_calls)
    }

    pub fn polls(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.polls)
    }
}

impl Decoder for ScriptedDecoder {
    fn poll<'a>(
        &'a mut self,
        _peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<Readings, DecodeError>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let script = self.poll.clone();
        async move {
            match script {
                PollScript::Readings(readings) => Ok(readings),
                PollScript::Fail(reason) => Err(DecodeError::InvalidData(reason)),
                PollScript::CancelAndFail(trigger) => {
                    trigger.trigger();
                    Err(DecodeError::InvalidData("failed while shutting down".into()))
                }
                PollScript::CancelAndHang(trigger) => {
                    trigger.trigger();
                    futures::future::pending().await
                }
            }
        }
        .boxed()
    }

    fn as_notifiable(&mut self) -> Option<&mut dyn Notifiable> {
        if self.notify_readings.is_some() {
            Some(self)
        } else {
            None
        }
    }
}

impl Notifiable for ScriptedDecoder {
    fn start_notify<'a>(
        &'a mut self,
        peripheral: &'a mut dyn Peripheral,
    ) -> BoxFuture<'a, Result<(), DecodeError>> {
        async move {
            self.arm_calls.fetch_add(1, Ordering::SeqCst);
            peripheral.subscribe(TEST_NOTIFY_UUID).await?;
            self.notifying = true;
            Ok(())
        }
        .boxed()
    }

    fn is_notifying(&self) -> bool {
        self.notifying
    }

    fn on_notification(&mut self, _notification: &Notification) -> Result<Readings, DecodeError> {
        Ok(self.notify_readings.clone().unwrap_or_default())
    }
}
