//! WinRT Transport
//!
//! Windows Bluetooth LE backend. WinRT completions are awaited on spawned
//! tasks and reported back as [`TransportEvent`]s.

use crate::domain::models::PeerIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{
    AdapterState, Advertisement, BleTransport, GattServiceInfo, ScanFilter, TransportEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattSession, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{
    BluetoothAdapter, BluetoothCacheMode, BluetoothConnectionStatus, BluetoothLEDevice,
};
use windows::Devices::Radios::RadioState;
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform(format!("{:?}", e))
    }
}

/// WinRT objects for the current link. `generation` is bumped by every
/// connect and disconnect; a task whose generation is no longer current
/// closes what it opened and reports nothing.
#[derive(Default)]
struct LinkSlots {
    generation: u64,
    device: Option<BluetoothLEDevice>,
    session: Option<GattSession>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
}

pub struct WinRtTransport {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    slots: Arc<Mutex<LinkSlots>>,
    /// Connect and discovery tasks of the current attempt.
    tasks: Vec<JoinHandle<()>>,
    event_sender: mpsc::UnboundedSender<TransportEvent>,
}

impl WinRtTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                watcher: None,
                slots: Arc::new(Mutex::new(LinkSlots::default())),
                tasks: Vec::new(),
                event_sender: tx,
            },
            rx,
        )
    }

    fn slots(&self) -> Result<MutexGuard<'_, LinkSlots>, TransportError> {
        self.slots
            .lock()
            .map_err(|_| TransportError::Platform("link state poisoned".into()))
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn characteristic(&self, uuid: Uuid) -> Result<GattCharacteristic, TransportError> {
        self.slots()?
            .characteristics
            .get(&uuid)
            .cloned()
            .ok_or(TransportError::NotConnected)
    }
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_address(address: &str) -> Result<u64, TransportError> {
    u64::from_str_radix(&address.replace(':', ""), 16)
        .map_err(|_| TransportError::Platform(format!("bad address '{}'", address)))
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; buffer.Length()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

#[async_trait]
impl BleTransport for WinRtTransport {
    async fn adapter_state(&mut self) -> AdapterState {
        let adapter = match BluetoothAdapter::GetDefaultAsync() {
            Ok(op) => op.await,
            Err(e) => Err(e),
        };
        let adapter = match adapter {
            Ok(adapter) if adapter.IsLowEnergySupported().unwrap_or(false) => adapter,
            _ => return AdapterState::Unavailable,
        };

        let radio = match adapter.GetRadioAsync() {
            Ok(op) => op.await,
            Err(e) => Err(e),
        };
        match radio.and_then(|r| r.State()) {
            Ok(RadioState::On) => AdapterState::Ready,
            Ok(_) => AdapterState::Disabled,
            Err(e) => {
                warn!("Could not read radio state: {:?}", e);
                AdapterState::Unavailable
            }
        }
    }

    fn start_scan(&mut self, _filter: &ScanFilter) -> Result<(), TransportError> {
        self.stop_scan()?;

        let watcher = BluetoothLEAdvertisementWatcher::new()?;
        watcher.SetScanningMode(BluetoothLEScanningMode::Active)?;

        let sender = self.event_sender.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let adv = args.Advertisement()?;
                    let service_uuids = adv.ServiceUuids()?;
                    let mut uuids = Vec::new();
                    for i in 0..service_uuids.Size()? {
                        uuids.push(to_uuid(service_uuids.GetAt(i)?));
                    }

                    let name = adv.LocalName()?.to_string();
                    let _ = sender.send(TransportEvent::Advertisement(Advertisement {
                        peer: PeerIdentity {
                            address: format_address(args.BluetoothAddress()?),
                            name: Some(name).filter(|n| !n.is_empty()),
                        },
                        service_uuids: uuids,
                        rssi: args.RawSignalStrengthInDBm().ok(),
                    }));
                }
                Ok(())
            },
        );

        watcher.Received(&handler)?;
        watcher.Start()?;
        self.watcher = Some(watcher);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        if let Some(watcher) = self.watcher.take() {
            watcher.Stop()?;
        }
        Ok(())
    }

    fn connect(&mut self, peer: &PeerIdentity) -> Result<(), TransportError> {
        let address = parse_address(&peer.address)?;
        let generation = {
            let mut slots = self.slots()?;
            slots.generation += 1;
            slots.generation
        };
        let slots = self.slots.clone();
        let sender = self.event_sender.clone();

        let task = tokio::spawn(async move {
            let result: windows::core::Result<(BluetoothLEDevice, GattSession)> = async {
                let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)?.await?;
                info!("Device opened: {:?}", device.Name()?);

                let status_slots = slots.clone();
                let status_sender = sender.clone();
                let status_handler =
                    TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                        let current = status_slots
                            .lock()
                            .map(|s| s.generation == generation)
                            .unwrap_or(false);
                        if let Some(dev) = dev.as_ref() {
                            if current
                                && dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected
                            {
                                let _ = status_sender.send(TransportEvent::Disconnected {
                                    error: Some("link lost".to_string()),
                                });
                            }
                        }
                        Ok(())
                    });
                device.ConnectionStatusChanged(&status_handler)?;

                // Keeps Windows from dropping an idle GATT link.
                let session = GattSession::FromDeviceIdAsync(&device.BluetoothDeviceId()?)?.await?;
                session.SetMaintainConnection(true)?;
                Ok((device, session))
            }
            .await;

            let Ok(mut slots) = slots.lock() else {
                return;
            };
            if slots.generation != generation {
                debug!("Connect attempt {} was cancelled", generation);
                if let Ok((device, session)) = result {
                    let _ = session.Close();
                    let _ = device.Close();
                }
                return;
            }
            let _ = sender.send(match result {
                Ok((device, session)) => {
                    slots.device = Some(device);
                    slots.session = Some(session);
                    TransportEvent::Connected
                }
                Err(e) => TransportEvent::Disconnected {
                    error: Some(format!("{:?}", e)),
                },
            });
        });
        self.track(task);
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        let (device, generation) = {
            let slots = self.slots()?;
            let device = slots.device.clone().ok_or(TransportError::NotConnected)?;
            (device, slots.generation)
        };
        let slots = self.slots.clone();
        let sender = self.event_sender.clone();

        let task = tokio::spawn(async move {
            let result: windows::core::Result<
                Result<(Vec<GattServiceInfo>, HashMap<Uuid, GattCharacteristic>), String>,
            > = async {
                let services_result = device
                    .GetGattServicesWithCacheModeAsync(BluetoothCacheMode::Uncached)?
                    .await?;
                if services_result.Status()? != GattCommunicationStatus::Success {
                    return Ok(Err(format!("{:?}", services_result.Status()?)));
                }

                let services = services_result.Services()?;
                let mut found = Vec::new();
                let mut characteristics = HashMap::new();
                for i in 0..services.Size()? {
                    let service = services.GetAt(i)?;
                    let chars_result = service.GetCharacteristicsAsync()?.await?;
                    let mut uuids = Vec::new();
                    if chars_result.Status()? == GattCommunicationStatus::Success {
                        let chars = chars_result.Characteristics()?;
                        for j in 0..chars.Size()? {
                            let c = chars.GetAt(j)?;
                            let uuid = to_uuid(c.Uuid()?);
                            uuids.push(uuid);
                            characteristics.insert(uuid, c);
                        }
                    }
                    found.push(GattServiceInfo {
                        uuid: to_uuid(service.Uuid()?),
                        characteristics: uuids,
                    });
                }
                debug!("Discovered {} services", found.len());
                Ok(Ok((found, characteristics)))
            }
            .await;

            let Ok(mut slots) = slots.lock() else {
                return;
            };
            if slots.generation != generation {
                debug!("Discovery for attempt {} was cancelled", generation);
                return;
            }
            let result = match result {
                Ok(Ok((found, characteristics))) => {
                    slots.characteristics = characteristics;
                    Ok(found)
                }
                Ok(Err(status)) => Err(status),
                Err(e) => Err(format!("{:?}", e)),
            };
            let _ = sender.send(TransportEvent::ServicesDiscovered(result));
        });
        self.track(task);
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;

        let sender = self.event_sender.clone();
        let data_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let value = read_buffer(&args.CharacteristicValue()?)?;
                    let _ = sender.send(TransportEvent::Notification {
                        characteristic,
                        value,
                    });
                }
                Ok(())
            },
        );
        c.ValueChanged(&data_handler)?;

        let sender = self.event_sender.clone();
        tokio::spawn(async move {
            let status = match c.WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            ) {
                Ok(op) => op.await,
                Err(e) => Err(e),
            };
            if let Err(e) = &status {
                warn!("CCCD write failed: {:?}", e);
            }
            let ok = matches!(status, Ok(GattCommunicationStatus::Success));
            let _ = sender.send(TransportEvent::DescriptorWritten { ok });
        });
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        // Windows negotiates the MTU itself; report what it settled on.
        let result = match &self.slots()?.session {
            Some(session) => session.MaxPduSize().map_err(|e| format!("{:?}", e)),
            None => Err("no GATT session".to_string()),
        };
        debug!("Requested MTU {}, platform reports {:?}", mtu, result);
        let _ = self.event_sender.send(TransportEvent::MtuChanged(result));
        Ok(())
    }

    fn write_without_response(
        &mut self,
        _service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        let c = self.characteristic(characteristic)?;
        let writer = DataWriter::new()?;
        writer.WriteBytes(value)?;
        let buffer = writer.DetachBuffer()?;

        let sender = self.event_sender.clone();
        tokio::spawn(async move {
            let status =
                match c.WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithoutResponse) {
                    Ok(op) => op.await,
                    Err(e) => Err(e),
                };
            let result = match status {
                Ok(GattCommunicationStatus::Success) => Ok(()),
                Ok(other) => Err(format!("{:?}", other)),
                Err(e) => Err(format!("{:?}", e)),
            };
            let _ = sender.send(TransportEvent::WriteCompleted(result));
        });
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.abort_tasks();
        let mut slots = self.slots()?;
        slots.generation += 1;
        slots.characteristics.clear();
        if let Some(session) = slots.session.take() {
            let _ = session.Close();
        }
        if let Some(device) = slots.device.take() {
            let _ = device.Close();
        }
        Ok(())
    }
}

impl Drop for WinRtTransport {
    fn drop(&mut self) {
        let _ = self.stop_scan();
        let _ = self.disconnect();
    }
}
