//! BLE Connection Module
//!
//! Connection parameters and GATT characteristic resolution for the
//! NUS-style profile.

use crate::domain::settings::BleSettings;
use crate::error::LinkError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{GattServiceInfo, ScanFilter};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Configuration for connection behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Advertised name to match while scanning
    pub device_name: String,
    /// Service UUID to look for
    pub service_uuid: Uuid,
    /// Host → peripheral characteristic
    pub write_char_uuid: Uuid,
    /// Peripheral → host characteristic
    pub notify_char_uuid: Uuid,
    pub scan_timeout: Duration,
    /// Best-effort MTU request after subscribing
    pub requested_mtu: u16,
    /// Cap on an unterminated line, `None` for unbounded
    pub max_line_bytes: Option<usize>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            device_name: protocol::DEVICE_NAME.to_string(),
            service_uuid: protocol::SERVICE_UUID,
            write_char_uuid: protocol::WRITE_CHAR_UUID,
            notify_char_uuid: protocol::NOTIFY_CHAR_UUID,
            scan_timeout: Duration::from_secs(15),
            requested_mtu: 512,
            max_line_bytes: Some(16 * 1024),
        }
    }
}

impl From<&BleSettings> for ConnectionConfig {
    fn from(settings: &BleSettings) -> Self {
        let defaults = Self::default();
        Self {
            device_name: settings.device_name.clone(),
            service_uuid: parse_or(&settings.service_uuid, defaults.service_uuid),
            write_char_uuid: parse_or(&settings.write_char_uuid, defaults.write_char_uuid),
            notify_char_uuid: parse_or(&settings.notify_char_uuid, defaults.notify_char_uuid),
            scan_timeout: Duration::from_millis(settings.scan_timeout_ms),
            requested_mtu: settings.requested_mtu,
            max_line_bytes: settings.max_line_bytes,
        }
    }
}

fn parse_or(text: &str, fallback: Uuid) -> Uuid {
    match Uuid::parse_str(text.trim()) {
        Ok(uuid) => uuid,
        Err(e) => {
            warn!("Invalid UUID '{}' in settings ({}), using {}", text, e, fallback);
            fallback
        }
    }
}

impl ConnectionConfig {
    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            device_name: Some(self.device_name.clone()).filter(|n| !n.is_empty()),
            service_uuid: Some(self.service_uuid),
        }
    }

    /// Locate the profile's service and both characteristics.
    pub fn resolve(&self, services: &[GattServiceInfo]) -> Result<ResolvedLink, LinkError> {
        let service = services
            .iter()
            .find(|s| s.uuid == self.service_uuid)
            .ok_or(LinkError::ServiceNotFound)?;
        info!(
            "Found NUS service with {} characteristics",
            service.characteristics.len()
        );

        let has = |uuid: Uuid| service.characteristics.contains(&uuid);
        if !has(self.write_char_uuid) || !has(self.notify_char_uuid) {
            return Err(LinkError::CharacteristicNotFound);
        }

        Ok(ResolvedLink {
            service: self.service_uuid,
            write: self.write_char_uuid,
            notify: self.notify_char_uuid,
        })
    }
}

/// Characteristics of an established link. Dropped on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLink {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nus(characteristics: Vec<Uuid>) -> GattServiceInfo {
        GattServiceInfo {
            uuid: protocol::SERVICE_UUID,
            characteristics,
        }
    }

    #[test]
    fn test_resolve_full_profile() {
        let config = ConnectionConfig::default();
        let link = config
            .resolve(&[
                GattServiceInfo {
                    uuid: Uuid::from_u128(0x1800),
                    characteristics: vec![],
                },
                nus(vec![protocol::WRITE_CHAR_UUID, protocol::NOTIFY_CHAR_UUID]),
            ])
            .unwrap();
        assert_eq!(link.notify, protocol::NOTIFY_CHAR_UUID);
        assert_eq!(link.write, protocol::WRITE_CHAR_UUID);
    }

    #[test]
    fn test_resolve_reports_mismatch() {
        let config = ConnectionConfig::default();
        assert_eq!(config.resolve(&[]), Err(LinkError::ServiceNotFound));
        assert_eq!(
            config.resolve(&[nus(vec![protocol::WRITE_CHAR_UUID])]),
            Err(LinkError::CharacteristicNotFound)
        );
    }

    #[test]
    fn test_from_settings_falls_back_on_bad_uuid() {
        let settings = BleSettings {
            service_uuid: "not-a-uuid".into(),
            scan_timeout_ms: 2000,
            ..BleSettings::default()
        };
        let config = ConnectionConfig::from(&settings);
        assert_eq!(config.service_uuid, protocol::SERVICE_UUID);
        assert_eq!(config.scan_timeout, Duration::from_secs(2));
        assert_eq!(
            config,
            ConnectionConfig {
                scan_timeout: Duration::from_secs(2),
                ..ConnectionConfig::default()
            }
        );
    }
}
