//! WinRT GATT client
//!
//! [`Transport`] backed by `Windows.Devices.Bluetooth`. Platform callbacks run
//! on WinRT threads and only forward into the session's [`EventSink`].

use crate::infrastructure::bluetooth::transport::{
    AccessStatus, EventSink, PairingStatus, Transport, TransportError, WriteMode,
};
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Devices::Enumeration::{
    DeviceAccessStatus, DevicePairingProtectionLevel, DevicePairingResultStatus,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform(e.message().to_string())
    }
}

pub fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

pub fn from_guid(guid: &GUID) -> Uuid {
    Uuid::from_fields(guid.data1, guid.data2, guid.data3, &guid.data4)
}

/// Copy a WinRT buffer into an owned byte vector.
pub fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn check_status(status: GattCommunicationStatus) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Status(format!("{:?}", status)))
    }
}

pub struct WinRtConnection {
    device: BluetoothLEDevice,
    status_token: Option<i64>,
}

pub struct WinRtCharacteristic {
    inner: GattCharacteristic,
    value_token: Mutex<Option<i64>>,
}

#[derive(Debug, Default)]
pub struct WinRtTransport;

impl WinRtTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WinRtTransport {
    type Connection = WinRtConnection;
    type Service = GattDeviceService;
    type Characteristic = WinRtCharacteristic;

    async fn connect(
        &self,
        address: u64,
        events: EventSink,
    ) -> Result<WinRtConnection, TransportError> {
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?
            .await
            .map_err(|e| {
                debug!("FromBluetoothAddressAsync failed: {}", e);
                TransportError::Unreachable(address)
            })?;
        info!("Device connected: {:?}", device.Name()?);

        let handler = TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
            if let Some(dev) = dev.as_ref() {
                if let Ok(status) = dev.ConnectionStatus() {
                    events.link_status(status == BluetoothConnectionStatus::Connected);
                }
            }
            Ok(())
        });
        let status_token = match device.ConnectionStatusChanged(&handler) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("Failed to watch connection status: {}", e);
                None
            }
        };

        Ok(WinRtConnection {
            device,
            status_token,
        })
    }

    async fn is_paired(&self, connection: &WinRtConnection) -> Result<bool, TransportError> {
        let pairing = connection.device.DeviceInformation()?.Pairing()?;
        Ok(pairing.IsPaired()?)
    }

    async fn pair(&self, connection: &WinRtConnection) -> Result<PairingStatus, TransportError> {
        let pairing = connection.device.DeviceInformation()?.Pairing()?;
        let result = pairing
            .PairWithProtectionLevelAsync(DevicePairingProtectionLevel::None)?
            .await?;
        let status = result.Status()?;
        info!("Pairing result: {:?}", status);
        Ok(match status {
            DevicePairingResultStatus::Paired => PairingStatus::Paired,
            DevicePairingResultStatus::AlreadyPaired => PairingStatus::AlreadyPaired,
            other => PairingStatus::NotPaired(format!("{:?}", other)),
        })
    }

    async fn discover_services(
        &self,
        connection: &WinRtConnection,
        service: Uuid,
    ) -> Result<Vec<GattDeviceService>, TransportError> {
        let result = connection
            .device
            .GetGattServicesForUuidWithCacheModeAsync(to_guid(service), BluetoothCacheMode::Uncached)?
            .await?;
        check_status(result.Status()?)?;

        let services = result.Services()?;
        let mut found = Vec::with_capacity(services.Size()? as usize);
        for i in 0..services.Size()? {
            found.push(services.GetAt(i)?);
        }
        Ok(found)
    }

    async fn request_access(
        &self,
        service: &GattDeviceService,
    ) -> Result<AccessStatus, TransportError> {
        let status = service.RequestAccessAsync()?.await?;
        debug!("Service access status: {:?}", status);
        Ok(match status {
            DeviceAccessStatus::Allowed => AccessStatus::Allowed,
            other => AccessStatus::Denied(format!("{:?}", other)),
        })
    }

    async fn discover_characteristic(
        &self,
        service: &GattDeviceService,
        characteristic: Uuid,
    ) -> Result<WinRtCharacteristic, TransportError> {
        let result = service
            .GetCharacteristicsForUuidWithCacheModeAsync(
                to_guid(characteristic),
                BluetoothCacheMode::Uncached,
            )?
            .await?;
        check_status(result.Status()?)?;

        let characteristics = result.Characteristics()?;
        if characteristics.Size()? == 0 {
            return Err(TransportError::NotFound(format!(
                "characteristic {}",
                characteristic
            )));
        }
        Ok(WinRtCharacteristic {
            inner: characteristics.GetAt(0)?,
            value_token: Mutex::new(None),
        })
    }

    async fn subscribe(
        &self,
        characteristic: &WinRtCharacteristic,
        events: EventSink,
    ) -> Result<(), TransportError> {
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match args.CharacteristicValue().and_then(|value| read_buffer(&value)) {
                        Ok(payload) => {
                            events.notification(payload);
                        }
                        Err(e) => debug!("Unreadable notification: {}", e),
                    }
                }
                Ok(())
            },
        );
        let token = characteristic.inner.ValueChanged(&handler)?;
        *characteristic
            .value_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(token);

        let status = characteristic
            .inner
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )?
            .await?;
        if let Err(e) = check_status(status) {
            self.unsubscribe(characteristic).await;
            return Err(e);
        }
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: &WinRtCharacteristic) {
        let token = characteristic
            .value_token
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            if let Err(e) = characteristic.inner.RemoveValueChanged(token) {
                debug!("RemoveValueChanged failed: {}", e);
            }
        }

        match characteristic
            .inner
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::None,
            ) {
            Ok(op) => {
                if let Err(e) = op.await {
                    debug!("Clearing CCCD failed: {}", e);
                }
            }
            Err(e) => debug!("Clearing CCCD failed: {}", e),
        }
    }

    async fn write(
        &self,
        characteristic: &WinRtCharacteristic,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(payload)?;
        let buffer = writer.DetachBuffer()?;

        let option = match mode {
            WriteMode::WithResponse => GattWriteOption::WriteWithResponse,
            WriteMode::WithoutResponse => GattWriteOption::WriteWithoutResponse,
        };
        let status = characteristic
            .inner
            .WriteValueWithOptionAsync(&buffer, option)?
            .await?;
        check_status(status)
    }

    fn release_characteristic(&self, characteristic: WinRtCharacteristic) {
        // Characteristics hold no OS handle of their own beyond the service.
        drop(characteristic);
    }

    fn release_service(&self, service: GattDeviceService) {
        if let Err(e) = service.Close() {
            debug!("Closing GATT service failed: {}", e);
        }
    }

    async fn disconnect(&self, connection: WinRtConnection) {
        if let Some(token) = connection.status_token {
            let _ = connection.device.RemoveConnectionStatusChanged(token);
        }
        if let Err(e) = connection.device.Close() {
            debug!("Closing device failed: {}", e);
        }
    }
}
