use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::bleuuid::uuid_from_u16;
use btleplug::api::{
    BDAddr, Central as _, CentralEvent, Characteristic, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt as _;
use log::{debug, info, warn};
use mac_address::MacAddress;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::config::GattConfig;
use crate::error::TransportError;
use crate::session::{DeviceDiscovery, MowerActivity, MowerSession, MowerState};

/// https://bitbucket.org/bluetooth-SIG/public/src/main/assigned_numbers/company_identifiers/company_identifiers.yaml
pub const HUSQVARNA_COMPANY_ID: u16 = 0x0426;

/// Device Information service characteristics.
const MANUFACTURER_NAME_CHARACTERISTIC: u16 = 0x2A29;
const MODEL_NUMBER_CHARACTERISTIC: u16 = 0x2A24;

const OPCODE_RESUME: u8 = 0x01;
const OPCODE_OVERRIDE: u8 = 0x02;
const OPCODE_PARK: u8 = 0x03;
const OPCODE_PAUSE: u8 = 0x04;

fn bd_addr(address: &MacAddress) -> BDAddr {
    BDAddr::from(address.bytes())
}

/// Whether advertised manufacturer data marks the device as a supported mower.
pub fn is_supported(manufacturer_data: &HashMap<u16, Vec<u8>>) -> bool {
    manufacturer_data.contains_key(&HUSQVARNA_COMPANY_ID)
}

/// Finds mowers through the adapter's peripheral cache, scanning when the
/// cache has nothing.
pub struct BleDiscovery {
    adapter: Adapter,
    scan_duration: Duration,
}

impl BleDiscovery {
    pub fn new(adapter: Adapter, scan_duration: Duration) -> Self {
        BleDiscovery {
            adapter,
            scan_duration,
        }
    }

    async fn cached(&self, address: BDAddr) -> Option<Peripheral> {
        match self.adapter.peripherals().await {
            Ok(peripherals) => peripherals.into_iter().find(|p| p.address() == address),
            Err(err) => {
                warn!("Error listing peripherals: {:?}", err);
                None
            }
        }
    }

    async fn scan_for(&self, address: BDAddr) -> Result<Option<Peripheral>, btleplug::Error> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let found = timeout(self.scan_duration, async {
            while let Some(event) = events.next().await {
                let (CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) = event
                else {
                    continue;
                };
                if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                    if peripheral.address() == address {
                        return Some(peripheral);
                    }
                }
            }
            None
        })
        .await
        .unwrap_or(None);

        if let Err(err) = self.adapter.stop_scan().await {
            debug!("Error stopping scan: {:?}", err);
        }
        Ok(found)
    }
}

#[async_trait]
impl DeviceDiscovery for BleDiscovery {
    type Device = Peripheral;

    async fn find_device(&self, address: &MacAddress) -> Option<Peripheral> {
        let address = bd_addr(address);
        if let Some(peripheral) = self.cached(address).await {
            return Some(peripheral);
        }

        debug!("{} not in cache, scanning", address);
        match self.scan_for(address).await {
            Ok(found) => found,
            Err(err) => {
                warn!("Error scanning for {}: {:?}", address, err);
                None
            }
        }
    }

    async fn close_stale_connections(&self, address: &MacAddress) {
        let Some(peripheral) = self.cached(bd_addr(address)).await else {
            return;
        };
        if peripheral.is_connected().await.unwrap_or(false) {
            debug!("Closing stale connection to {}", address);
            if let Err(err) = peripheral.disconnect().await {
                warn!("Error closing stale connection to {}: {:?}", address, err);
            }
        }
    }

    async fn disconnected(&self, address: &MacAddress) {
        let address = bd_addr(address);
        let mut events = match self.adapter.events().await {
            Ok(events) => events,
            Err(err) => {
                warn!("Can't watch adapter events: {:?}", err);
                return std::future::pending().await;
            }
        };
        while let Some(event) = events.next().await {
            let CentralEvent::DeviceDisconnected(id) = event else {
                continue;
            };
            if let Ok(peripheral) = self.adapter.peripheral(&id).await {
                if peripheral.address() == address {
                    return;
                }
            }
        }
        std::future::pending().await
    }
}

struct Characteristics {
    battery_level: Option<Characteristic>,
    activity: Characteristic,
    state: Characteristic,
    command: Characteristic,
}

/// Session over plain GATT reads and writes on the configured characteristics.
pub struct GattSession {
    gatt: GattConfig,
    peripheral: Option<Peripheral>,
    characteristics: Option<Characteristics>,
}

impl GattSession {
    pub fn new(gatt: GattConfig) -> Self {
        GattSession {
            gatt,
            peripheral: None,
            characteristics: None,
        }
    }

    fn resolve(&self, peripheral: &Peripheral) -> Result<Characteristics, TransportError> {
        let available = peripheral.characteristics();
        let find = |uuid: Uuid| available.iter().find(|c| c.uuid == uuid).cloned();
        let require =
            |uuid: Uuid| find(uuid).ok_or(TransportError::MissingCharacteristic(uuid));

        Ok(Characteristics {
            battery_level: find(self.gatt.battery_level()),
            activity: require(self.gatt.activity)?,
            state: require(self.gatt.state)?,
            command: require(self.gatt.command)?,
        })
    }

    fn link(&self) -> Result<(&Peripheral, &Characteristics), TransportError> {
        match (&self.peripheral, &self.characteristics) {
            (Some(peripheral), Some(characteristics)) => Ok((peripheral, characteristics)),
            _ => Err(TransportError::NotConnected),
        }
    }

    async fn send(&self, opcode: u8) -> Result<(), TransportError> {
        let (peripheral, characteristics) = self.link()?;
        peripheral
            .write(&characteristics.command, &[opcode], WriteType::WithResponse)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MowerSession for GattSession {
    type Device = Peripheral;

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn connect(&mut self, device: Peripheral) -> Result<bool, TransportError> {
        device.connect().await?;
        device.discover_services().await?;
        let characteristics = self.resolve(&device)?;
        let connected = device.is_connected().await?;

        self.characteristics = Some(characteristics);
        self.peripheral = Some(device);
        Ok(connected)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.characteristics = None;
        if let Some(peripheral) = self.peripheral.take() {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn battery_level(&mut self) -> Result<Option<u8>, TransportError> {
        let (peripheral, characteristics) = self.link()?;
        let Some(characteristic) = &characteristics.battery_level else {
            return Ok(None);
        };
        let value = peripheral.read(characteristic).await?;
        Ok(value.first().copied().filter(|level| *level <= 100))
    }

    async fn activity(&mut self) -> Result<Option<MowerActivity>, TransportError> {
        let (peripheral, characteristics) = self.link()?;
        let value = peripheral.read(&characteristics.activity).await?;
        Ok(value.first().copied().and_then(MowerActivity::from_code))
    }

    async fn state(&mut self) -> Result<Option<MowerState>, TransportError> {
        let (peripheral, characteristics) = self.link()?;
        let value = peripheral.read(&characteristics.state).await?;
        Ok(value.first().copied().and_then(MowerState::from_code))
    }

    async fn resume(&mut self) -> Result<(), TransportError> {
        self.send(OPCODE_RESUME).await
    }

    async fn override_schedule(&mut self) -> Result<(), TransportError> {
        self.send(OPCODE_OVERRIDE).await
    }

    async fn park(&mut self) -> Result<(), TransportError> {
        self.send(OPCODE_PARK).await
    }

    async fn pause(&mut self) -> Result<(), TransportError> {
        self.send(OPCODE_PAUSE).await
    }
}

#[derive(Debug, Clone)]
pub struct DiscoveredMower {
    pub address: MacAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Scans for `duration` and returns every supported mower that advertised.
pub async fn scan_for_mowers(
    adapter: &Adapter,
    duration: Duration,
) -> Result<Vec<DiscoveredMower>, btleplug::Error> {
    adapter.start_scan(ScanFilter::default()).await?;
    sleep(duration).await;
    adapter.stop_scan().await?;

    let mut mowers = Vec::new();
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        debug!(
            "{} manufacturer data: {:?}",
            properties.address, properties.manufacturer_data
        );
        if !is_supported(&properties.manufacturer_data) {
            continue;
        }

        info!(
            "Found mower {} {}",
            properties.address,
            properties.local_name.as_deref().unwrap_or_default()
        );
        mowers.push(DiscoveredMower {
            address: MacAddress::new(properties.address.into_inner()),
            name: properties.local_name,
            rssi: properties.rssi,
        });
    }
    Ok(mowers)
}

/// What a mower says about itself in its Device Information service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInformation {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

impl DeviceInformation {
    /// "<manufacturer> <model>", or whichever of the two is known.
    pub fn title(&self) -> Option<String> {
        let parts: Vec<&str> = [self.manufacturer.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }
}

/// Connects to a mower found by [`scan_for_mowers`], reads its Device
/// Information and disconnects again.
pub async fn read_device_information(
    adapter: &Adapter,
    address: &MacAddress,
    connect_timeout: Duration,
) -> Result<DeviceInformation, TransportError> {
    let address = bd_addr(address);
    let peripheral = adapter
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == address)
        .ok_or(TransportError::NotConnected)?;

    let result = timeout(connect_timeout, async {
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        Ok::<_, TransportError>(DeviceInformation {
            manufacturer: read_string(&peripheral, MANUFACTURER_NAME_CHARACTERISTIC).await?,
            model: read_string(&peripheral, MODEL_NUMBER_CHARACTERISTIC).await?,
        })
    })
    .await
    .unwrap_or(Err(TransportError::Timeout));

    if let Err(err) = peripheral.disconnect().await {
        debug!("Error disconnecting from {}: {:?}", address, err);
    }
    result
}

async fn read_string(peripheral: &Peripheral, uuid: u16) -> Result<Option<String>, TransportError> {
    let uuid = uuid_from_u16(uuid);
    let Some(characteristic) = peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
    else {
        return Ok(None);
    };
    Ok(decode_string(&peripheral.read(&characteristic).await?))
}

/// Device strings are NUL padded.
fn decode_string(value: &[u8]) -> Option<String> {
    let value = String::from_utf8_lossy(value).replace('\0', "");
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_string() {
        assert_eq!(decode_string(b"Husqvarna\0\0"), Some("Husqvarna".to_string()));
        assert_eq!(decode_string(b"305 "), Some("305".to_string()));
        assert_eq!(decode_string(b"\0\0"), None);
        assert_eq!(decode_string(b""), None);
    }

    #[test]
    fn test_device_information_title() {
        let info = DeviceInformation {
            manufacturer: Some("Husqvarna".to_string()),
            model: Some("305".to_string()),
        };
        assert_eq!(info.title().as_deref(), Some("Husqvarna 305"));

        let info = DeviceInformation {
            manufacturer: None,
            model: Some("305".to_string()),
        };
        assert_eq!(info.title().as_deref(), Some("305"));
        assert_eq!(DeviceInformation::default().title(), None);
    }

    #[test]
    fn test_is_supported() {
        let mut data = HashMap::new();
        data.insert(0x004C, vec![0x02, 0x15]);
        assert!(!is_supported(&data));

        data.insert(1062, vec![0x01]);
        assert!(is_supported(&data));
    }

    #[test]
    fn test_bd_addr_conversion() {
        let address: MacAddress = "C0:11:22:33:44:55".parse().unwrap();
        assert_eq!(bd_addr(&address).to_string(), "C0:11:22:33:44:55");
    }

    #[tokio::test]
    async fn test_disconnected_session_reports_not_connected() {
        let gatt = GattConfig {
            battery_level: None,
            activity: Uuid::nil(),
            state: Uuid::nil(),
            command: Uuid::nil(),
        };
        let mut session = GattSession::new(gatt);
        assert!(!session.is_connected().await);
        assert!(matches!(
            session.battery_level().await,
            Err(TransportError::NotConnected)
        ));
        assert!(session.disconnect().await.is_ok());
    }
}
