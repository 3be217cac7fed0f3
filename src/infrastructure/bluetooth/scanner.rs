//! BLE Scanner Module
//!
//! Tracks one bounded discovery scan for the motion peripheral.

use crate::domain::models::PeerIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::transport::{Advertisement, BleTransport, ScanFilter};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Longest scan the timer will arm for
pub const MAX_SCAN_TIMEOUT: Duration = Duration::from_secs(3600);

/// Bounded scan for the motion peripheral
pub struct BleScanner {
    filter: ScanFilter,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl BleScanner {
    pub fn new(filter: ScanFilter, timeout: Duration) -> Self {
        Self {
            filter,
            timeout: timeout.min(MAX_SCAN_TIMEOUT),
            deadline: None,
        }
    }

    /// Start scanning and arm the timeout.
    pub fn start(&mut self, transport: &mut dyn BleTransport) -> Result<(), TransportError> {
        self.stop(transport);

        info!(
            "Starting BLE scan for name {:?} or service {:?} ({:?} timeout)",
            self.filter.device_name, self.filter.service_uuid, self.timeout
        );
        transport.start_scan(&self.filter)?;
        self.deadline = Some(Instant::now() + self.timeout);
        Ok(())
    }

    /// Stop the hardware scan if one is running. Safe to call repeatedly.
    pub fn stop(&mut self, transport: &mut dyn BleTransport) {
        if self.deadline.take().is_some() {
            info!("Stopping BLE scan...");
            if let Err(e) = transport.stop_scan() {
                warn!("Failed to stop scan: {}", e);
            }
        }
    }

    /// The matching peer, if this advertisement is the one we want.
    pub fn accept(&self, advertisement: &Advertisement) -> Option<PeerIdentity> {
        if !self.is_scanning() {
            return None;
        }
        if self.filter.matches(advertisement) {
            info!(
                "Found {} (rssi {:?})",
                advertisement.peer, advertisement.rssi
            );
            Some(advertisement.peer.clone())
        } else {
            debug!("Ignoring advertisement from {}", advertisement.peer);
            None
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_scanning(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::mock::{Call, MockControl, MockTransport};
    use crate::infrastructure::bluetooth::protocol;

    fn advertisement() -> Advertisement {
        Advertisement {
            peer: MockControl::peer(),
            service_uuids: vec![protocol::SERVICE_UUID],
            rssi: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_is_clamped() {
        let (mut transport, control, _events) = MockTransport::new();
        let filter = ConnectionConfig::default().scan_filter();
        let mut scanner = BleScanner::new(filter, Duration::MAX);

        let before = Instant::now();
        scanner.start(&mut transport).unwrap();
        assert!(scanner.is_scanning());
        assert_eq!(scanner.deadline(), Some(before + MAX_SCAN_TIMEOUT));
        assert_eq!(scanner.accept(&advertisement()), Some(MockControl::peer()));

        scanner.stop(&mut transport);
        scanner.stop(&mut transport);
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.accept(&advertisement()), None);
        assert_eq!(control.count(&Call::StopScan), 1);
    }
}
