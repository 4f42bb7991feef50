//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    AD_TYPE_MANUFACTURER_DATA, AdField, AddressType, Advertisement, BleCentral, ConnectionError,
    Notification, Peripheral, ScanError,
};
use crate::mac_address::MacAddress;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, Session};
use futures::FutureExt;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::{BoxStream, SelectAll};
use std::fmt::Write;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

const SERVICES_RESOLVED_POLL: Duration = Duration::from_millis(100);

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

impl From<bluer::Error> for ConnectionError {
    fn from(err: bluer::Error) -> Self {
        ConnectionError::Bluetooth(err.to_string())
    }
}

/// The default BlueZ adapter.
///
/// BlueZ only refreshes cached advertisement data while discovery runs, so a
/// background discovery session stays open for the lifetime of the central.
pub struct BluerCentral {
    _session: Session,
    adapter: Adapter,
    discovery: JoinHandle<()>,
}

impl BluerCentral {
    /// Open a D-Bus session, power on the default adapter and start discovery.
    pub async fn new() -> Result<Self, ScanError> {
        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        log::info!("Using Bluetooth adapter {}", adapter.name());

        let discovery = tokio::spawn(keep_discovering(adapter.clone()));

        Ok(Self {
            _session: session,
            adapter,
            discovery,
        })
    }

    async fn advertisement(&self, address: Address) -> Result<Advertisement, bluer::Error> {
        let device = self.adapter.device(address)?;

        let mut fields = Vec::new();
        if let Some(name) = device.name().await? {
            fields.push(AdField::complete_local_name(name));
        }
        if let Some(data) = device.manufacturer_data().await? {
            for (company_id, bytes) in data {
                let mut value = format!("{company_id:04x}");
                for byte in bytes {
                    let _ = write!(value, "{byte:02x}");
                }
                fields.push(AdField::new(AD_TYPE_MANUFACTURER_DATA, "Manufacturer", value));
            }
        }

        let address_type = match device.address_type().await? {
            bluer::AddressType::LeRandom => AddressType::Random,
            _ => AddressType::Public,
        };

        Ok(Advertisement {
            address: address.into(),
            address_type,
            rssi: device.rssi().await?,
            fields,
        })
    }
}

async fn keep_discovering(adapter: Adapter) {
    match adapter.discover_devices().await {
        Ok(events) => {
            tokio::pin!(events);
            while events.next().await.is_some() {}
            log::warn!("Background discovery ended, advertisement data will go stale");
        }
        Err(e) => log::warn!("Cannot keep discovery running: {e}"),
    }
}

impl Drop for BluerCentral {
    fn drop(&mut self) {
        self.discovery.abort();
    }
}

impl BleCentral for BluerCentral {
    fn scan(&self, window: Duration) -> BoxFuture<'_, Result<Vec<Advertisement>, ScanError>> {
        async move {
            let mut seen: Vec<Address> = Vec::new();
            {
                let events = self.adapter.discover_devices().await?;
                let deadline = tokio::time::sleep(window);
                tokio::pin!(events, deadline);

                loop {
                    tokio::select! {
                        _ = &mut deadline => break,
                        event = events.next() => match event {
                            Some(AdapterEvent::DeviceAdded(address)) => {
                                if !seen.contains(&address) {
                                    seen.push(address);
                                }
                            }
                            Some(_) => {}
                            None => break,
                        },
                    }
                }
            }

            let mut advertisements = Vec::with_capacity(seen.len());
            for address in seen {
                match self.advertisement(address).await {
                    Ok(advertisement) => advertisements.push(advertisement),
                    Err(e) => log::debug!("Device {address} vanished before it was read: {e}"),
                }
            }
            Ok(advertisements)
        }
        .boxed()
    }

    fn peripheral(&self, address: MacAddress) -> Result<Box<dyn Peripheral>, ConnectionError> {
        let device = self.adapter.device(address.into())?;
        Ok(Box::new(BluerPeripheral::new(device)))
    }
}

/// GATT link to one device.
///
/// Characteristics subscribed to once are re-subscribed on every connect.
pub struct BluerPeripheral {
    device: Device,
    subscriptions: Vec<Uuid>,
    notifications: SelectAll<BoxStream<'static, Notification>>,
}

impl BluerPeripheral {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            subscriptions: Vec::new(),
            notifications: SelectAll::new(),
        }
    }

    async fn arm(&mut self, uuid: Uuid) -> Result<(), ConnectionError> {
        let characteristic = find_characteristic(&self.device, uuid).await?;
        let stream = characteristic.notify().await?;
        self.notifications.push(
            stream
                .map(move |value| Notification {
                    characteristic: uuid,
                    value,
                })
                .boxed(),
        );
        Ok(())
    }
}

async fn find_characteristic(
    device: &Device,
    uuid: Uuid,
) -> Result<Characteristic, ConnectionError> {
    if !device.is_connected().await? {
        return Err(ConnectionError::NotConnected);
    }
    for service in device.services().await? {
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(characteristic);
            }
        }
    }
    Err(ConnectionError::CharacteristicNotFound(uuid))
}

impl Peripheral for BluerPeripheral {
    fn address(&self) -> MacAddress {
        self.device.address().into()
    }

    fn connect(
        &mut self,
        address_type: AddressType,
    ) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            log::debug!("Connecting to {} ({address_type})", self.device.address());
            if !self.device.is_connected().await? {
                self.device.connect().await?;
            }
            while !self.device.is_services_resolved().await? {
                tokio::time::sleep(SERVICES_RESOLVED_POLL).await;
            }

            self.notifications = SelectAll::new();
            for uuid in self.subscriptions.clone() {
                self.arm(uuid).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.notifications = SelectAll::new();
            if self.device.is_connected().await? {
                self.device.disconnect().await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn read(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<Vec<u8>, ConnectionError>> {
        async move {
            let characteristic = find_characteristic(&self.device, characteristic).await?;
            Ok(characteristic.read().await?)
        }
        .boxed()
    }

    fn subscribe(&mut self, characteristic: Uuid) -> BoxFuture<'_, Result<(), ConnectionError>> {
        async move {
            self.arm(characteristic).await?;
            if !self.subscriptions.contains(&characteristic) {
                self.subscriptions.push(characteristic);
            }
            Ok(())
        }
        .boxed()
    }

    fn wait_for_notification(
        &mut self,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<Option<Notification>, ConnectionError>> {
        async move {
            if self.notifications.is_empty() {
                return Ok(None);
            }
            Ok(tokio::time::timeout(timeout, self.notifications.next())
                .await
                .ok()
                .flatten())
        }
        .boxed()
    }

    fn manufacturer_data(
        &mut self,
        company_id: u16,
    ) -> BoxFuture<'_, Result<Option<Vec<u8>>, ConnectionError>> {
        async move {
            Ok(self
                .device
                .manufacturer_data()
                .await?
                .and_then(|mut data| data.remove(&company_id)))
        }
        .boxed()
    }
}
