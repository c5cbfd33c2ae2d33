//! GATT link over the host Bluetooth stack (btleplug)
//!
//! Also provides [`scan`], used to find the bed's address the first time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic as GattCharacteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::Instant;

use bedside_proto::Characteristic;
use bedside_proto::ble::SERVICE_UUID;

use crate::link::{ConnError, GattLink, IoError, MacAddress, PeripheralIdentity};

/// How often the adapter's peripheral list is polled while looking for the bed
const SCAN_POLL: Duration = Duration::from_millis(250);

/// Characteristics every supported firmware exposes; the light is optional
const REQUIRED: [Characteristic; 4] = [
    Characteristic::UpperLift,
    Characteristic::LowerLift,
    Characteristic::UpperVibration,
    Characteristic::LowerVibration,
];

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("Bluetooth adapter {0:?} not found")]
    UnknownAdapter(String),
    #[error(transparent)]
    Ble(#[from] btleplug::Error),
}

/// A peripheral seen during [`scan`]
#[derive(Debug, Clone)]
pub struct DiscoveredPeripheral {
    pub name: String,
    pub address: MacAddress,
    pub rssi: Option<i16>,
    /// Advertises the bed service
    pub is_bed: bool,
}

/// Pick the adapter whose info string contains `name`, or the first one
async fn get_adapter(manager: &Manager, name: Option<&str>) -> Result<Adapter, AdapterError> {
    let adapters = manager.adapters().await?;
    let Some(name) = name else {
        return adapters.into_iter().next().ok_or(AdapterError::NoAdapter);
    };

    for adapter in adapters {
        if adapter.adapter_info().await?.contains(name) {
            return Ok(adapter);
        }
    }
    Err(AdapterError::UnknownAdapter(name.to_string()))
}

/// Scan for BLE devices for `duration`
pub async fn scan(
    adapter: Option<&str>,
    duration: Duration,
) -> Result<Vec<DiscoveredPeripheral>, AdapterError> {
    let manager = Manager::new().await?;
    let adapter = get_adapter(&manager, adapter).await?;

    adapter.start_scan(ScanFilter::default()).await?;
    tokio::time::sleep(duration).await;

    let mut devices = Vec::new();
    for peripheral in adapter.peripherals().await? {
        if let Some(props) = peripheral.properties().await? {
            let is_bed = props.services.contains(&SERVICE_UUID);
            devices.push(DiscoveredPeripheral {
                name: props.local_name.unwrap_or_else(|| "Unknown".to_string()),
                address: MacAddress(peripheral.address().into_inner()),
                rssi: props.rssi,
                is_bed,
            });
        }
    }

    adapter.stop_scan().await?;
    Ok(devices)
}

/// Connected bed with its discovered characteristics
pub struct BtleConnection {
    peripheral: Peripheral,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
}

impl BtleConnection {
    fn characteristic(&self, target: Characteristic) -> Result<&GattCharacteristic, IoError> {
        self.characteristics
            .get(&target)
            .ok_or(IoError::NotExposed(target))
    }
}

/// [`GattLink`] backed by the host Bluetooth stack
pub struct BtleplugLink {
    manager: Manager,
    io_timeout: Duration,
}

impl BtleplugLink {
    pub async fn new(io_timeout: Duration) -> Result<Self, AdapterError> {
        Ok(Self {
            manager: Manager::new().await?,
            io_timeout,
        })
    }

    /// Poll the adapter until the bed shows up or `deadline` passes
    async fn find(
        &self,
        adapter: &Adapter,
        address: MacAddress,
        deadline: Instant,
    ) -> Result<Peripheral, ConnError> {
        let mut scanning = false;
        loop {
            let peripherals = adapter.peripherals().await.map_err(classify)?;
            if let Some(p) = peripherals
                .into_iter()
                .find(|p| p.address().into_inner() == address.0)
            {
                if scanning {
                    stop_scan(adapter).await;
                }
                return Ok(p);
            }

            if !scanning {
                tracing::debug!("{address} not cached, scanning");
                adapter
                    .start_scan(ScanFilter::default())
                    .await
                    .map_err(classify)?;
                scanning = true;
            }

            if Instant::now() + SCAN_POLL > deadline {
                stop_scan(adapter).await;
                return Err(ConnError::NotFound(address));
            }
            tokio::time::sleep(SCAN_POLL).await;
        }
    }

    async fn open(&self, peripheral: Peripheral) -> Result<BtleConnection, ConnError> {
        if !peripheral.is_connected().await.map_err(classify)? {
            peripheral.connect().await.map_err(classify)?;
        }
        peripheral.discover_services().await.map_err(classify)?;

        let characteristics: HashMap<_, _> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == SERVICE_UUID)
            .filter_map(|c| Characteristic::from_uuid(c.uuid).map(|k| (k, c)))
            .collect();

        if let Some(missing) = REQUIRED.iter().find(|c| !characteristics.contains_key(*c)) {
            if let Err(e) = peripheral.disconnect().await {
                tracing::debug!("disconnect: {e}");
            }
            return Err(ConnError::Denied(format!(
                "bed service does not expose {missing}"
            )));
        }

        Ok(BtleConnection {
            peripheral,
            characteristics,
        })
    }
}

async fn stop_scan(adapter: &Adapter) {
    if let Err(e) = adapter.stop_scan().await {
        tracing::debug!("stop scan: {e}");
    }
}

/// Sort a btleplug error into the link's connection failures
fn classify(e: btleplug::Error) -> ConnError {
    match e {
        btleplug::Error::PermissionDenied => ConnError::Denied("permission denied".to_string()),
        btleplug::Error::TimedOut(d) => ConnError::Timeout(d),
        other => {
            let message = other.to_string();
            let lower = message.to_lowercase();
            // BlueZ reports a peripheral that refuses a second central this way
            if lower.contains("busy")
                || lower.contains("in progress")
                || lower.contains("le-connection-abort")
            {
                ConnError::Busy
            } else {
                ConnError::Denied(message)
            }
        }
    }
}

fn io_error(target: Characteristic, e: btleplug::Error) -> IoError {
    match e {
        btleplug::Error::NotConnected => IoError::Disconnected(e.to_string()),
        btleplug::Error::TimedOut(d) => IoError::Timeout(target, d),
        other => IoError::Gatt(target, other.to_string()),
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    type Handle = BtleConnection;

    async fn connect(
        &self,
        identity: &PeripheralIdentity,
        timeout: Duration,
    ) -> Result<BtleConnection, ConnError> {
        let deadline = Instant::now() + timeout;
        let adapter = get_adapter(&self.manager, identity.adapter.as_deref())
            .await
            .map_err(|e| ConnError::Denied(e.to_string()))?;

        let peripheral = self.find(&adapter, identity.address, deadline).await?;
        tracing::info!("connecting to {}", identity.address);

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, self.open(peripheral.clone())).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::debug!("disconnect: {e}");
                }
                Err(ConnError::Timeout(timeout))
            }
        }
    }

    async fn write(
        &self,
        handle: &BtleConnection,
        target: Characteristic,
        payload: &[u8],
    ) -> Result<(), IoError> {
        let characteristic = handle.characteristic(target)?;
        let write = handle
            .peripheral
            .write(characteristic, payload, WriteType::WithResponse);
        match tokio::time::timeout(self.io_timeout, write).await {
            Ok(result) => result.map_err(|e| io_error(target, e)),
            Err(_) => Err(IoError::Timeout(target, self.io_timeout)),
        }
    }

    async fn read(&self, handle: &BtleConnection, target: Characteristic) -> Result<Vec<u8>, IoError> {
        let characteristic = handle.characteristic(target)?;
        if !characteristic.properties.contains(CharPropFlags::READ) {
            return Err(IoError::NotReadable(target));
        }
        match tokio::time::timeout(self.io_timeout, handle.peripheral.read(characteristic)).await {
            Ok(result) => result.map_err(|e| io_error(target, e)),
            Err(_) => Err(IoError::Timeout(target, self.io_timeout)),
        }
    }

    async fn disconnect(&self, handle: &BtleConnection) {
        match handle.peripheral.is_connected().await {
            Ok(false) => {}
            _ => {
                if let Err(e) = handle.peripheral.disconnect().await {
                    tracing::debug!("disconnect: {e}");
                }
            }
        }
    }
}
