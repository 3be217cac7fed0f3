//! BLE Transport Abstraction
//!
//! The connection actor drives the radio through [`BleTransport`]. Every
//! operation only *initiates* work; completions come back as
//! [`TransportEvent`]s on the channel handed to the transport at creation,
//! which keeps all state mutation on the actor's task.

use crate::domain::models::PeerIdentity;
use crate::error::TransportError;
use async_trait::async_trait;
use uuid::Uuid;

/// Local radio availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    /// No Bluetooth LE hardware
    Unavailable,
    /// Present but switched off
    Disabled,
    Ready,
}

/// Scan filter: an advertisement matches on name OR service UUID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub device_name: Option<String>,
    pub service_uuid: Option<Uuid>,
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        let by_name = match (&self.device_name, &advertisement.peer.name) {
            (Some(wanted), Some(name)) => wanted == name,
            _ => false,
        };
        let by_service = self
            .service_uuid
            .map(|uuid| advertisement.service_uuids.contains(&uuid))
            .unwrap_or(false);
        by_name || by_service
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub peer: PeerIdentity,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// One GATT service with the characteristics it exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

/// Asynchronous completions reported by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Advertisement(Advertisement),
    ScanFailed(String),
    Connected,
    /// `error` is `None` for a clean disconnect.
    Disconnected { error: Option<String> },
    ServicesDiscovered(Result<Vec<GattServiceInfo>, String>),
    /// Remote CCCD write confirmation.
    DescriptorWritten { ok: bool },
    MtuChanged(Result<u16, String>),
    Notification { characteristic: Uuid, value: Vec<u8> },
    WriteCompleted(Result<(), String>),
}

#[async_trait]
pub trait BleTransport: Send {
    async fn adapter_state(&mut self) -> AdapterState;

    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), TransportError>;

    fn stop_scan(&mut self) -> Result<(), TransportError>;

    fn connect(&mut self, peer: &PeerIdentity) -> Result<(), TransportError>;

    fn discover_services(&mut self) -> Result<(), TransportError>;

    /// Enable local delivery and write the remote CCCD.
    fn enable_notifications(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError>;

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError>;

    fn write_without_response(
        &mut self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;

    /// Tear the link down. Must be safe to call with no link.
    fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(name: Option<&str>, services: Vec<Uuid>) -> Advertisement {
        Advertisement {
            peer: PeerIdentity {
                address: "24:6F:28:00:00:01".into(),
                name: name.map(str::to_string),
            },
            service_uuids: services,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_filter_matches_name_or_service() {
        let service = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
        let filter = ScanFilter {
            device_name: Some("ESP32-GYRO-ON".into()),
            service_uuid: Some(service),
        };

        assert!(filter.matches(&advertisement(Some("ESP32-GYRO-ON"), vec![])));
        assert!(filter.matches(&advertisement(None, vec![service])));
        assert!(!filter.matches(&advertisement(Some("Headphones"), vec![])));
        assert!(!filter.matches(&advertisement(None, vec![Uuid::nil()])));
    }
}
