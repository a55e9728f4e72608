//! BLE Scanner Module
//!
//! Handles Bluetooth LE device discovery for Astro devices.

use crate::domain::peers::Advertisement;
use crate::infrastructure::bluetooth::transport::BleEvent;
use crate::infrastructure::bluetooth::winrt::{from_guid, to_guid};
use anyhow::Result;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tracing::{info, trace};
use uuid::Uuid;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEAdvertisementWatcherStoppedEventArgs, BluetoothLEScanningMode,
};
use windows::Foundation::TypedEventHandler;

/// BLE Scanner for discovering Astro devices
pub struct BleScanner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    ble_sender: mpsc::UnboundedSender<BleEvent>,
}

impl BleScanner {
    pub fn new(ble_sender: mpsc::UnboundedSender<BleEvent>) -> Self {
        Self {
            watcher: None,
            ble_sender,
        }
    }

    /// Start scanning for BLE devices
    ///
    /// # Arguments
    /// * `service_uuid` - Service to look for
    /// * `show_all_devices` - If true, report every peer regardless of the service it advertises
    pub fn start(&mut self, service_uuid: Uuid, show_all_devices: bool) -> Result<()> {
        self.stop()?;
        info!("Starting BLE scan for service UUID: {}", service_uuid);

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.ble_sender.clone();
        let target = to_guid(service_uuid);
        let received = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let advertised = adv.ServiceUuids()?;

                    let mut service_uuids = Vec::with_capacity(advertised.Size()? as usize);
                    let mut found = show_all_devices;
                    for i in 0..advertised.Size()? {
                        let guid = advertised.GetAt(i)?;
                        found |= guid == target;
                        service_uuids.push(from_guid(&guid));
                    }

                    if found {
                        let sighting = Advertisement {
                            address: args.BluetoothAddress()?,
                            local_name: adv.LocalName()?.to_string(),
                            is_connectable: args.IsConnectable().unwrap_or(true),
                            signal_strength: args.RawSignalStrengthInDBm()?,
                            timestamp: SystemTime::now(),
                            service_uuids,
                        };
                        trace!("Advertisement from {:#X}", sighting.address);
                        let _ = sender.send(BleEvent::Advertisement(sighting));
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&received)?;

        let sender = self.ble_sender.clone();
        let stopped = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  _: windows::core::Ref<BluetoothLEAdvertisementWatcherStoppedEventArgs>| {
                let _ = sender.send(BleEvent::ScanStopped);
                Ok(())
            },
        );
        watcher.Stopped(&stopped)?;

        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop scanning. The watcher reports `ScanStopped` once it has halted.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(watcher) = self.watcher.take() {
            info!("Stopping BLE scan...");
            watcher.Stop()?;
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
