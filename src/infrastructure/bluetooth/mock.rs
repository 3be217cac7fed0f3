//! Scripted transport for exercising the connection actor.

use crate::domain::models::PeerIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AdapterState, Advertisement, BleTransport, GattServiceInfo, ScanFilter, TransportEvent,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan(ScanFilter),
    StopScan,
    Connect(PeerIdentity),
    DiscoverServices,
    EnableNotifications(Uuid),
    RequestMtu(u16),
    Write(Vec<u8>),
    Disconnect,
}

pub struct MockTransport {
    pub adapter: AdapterState,
    pub fail_writes: bool,
    calls: Arc<Mutex<Vec<Call>>>,
}

/// Test side of a [`MockTransport`]: inspects calls and injects events.
#[derive(Clone)]
pub struct MockControl {
    calls: Arc<Mutex<Vec<Call>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MockTransport {
    pub fn new() -> (Self, MockControl, mpsc::UnboundedReceiver<TransportEvent>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                adapter: AdapterState::Ready,
                fail_writes: false,
                calls: calls.clone(),
            },
            MockControl { calls, events: tx },
            rx,
        )
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn adapter_state(&mut self) -> AdapterState {
        self.adapter
    }

    fn start_scan(&mut self, filter: &ScanFilter) -> Result<(), TransportError> {
        self.record(Call::StartScan(filter.clone()));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        Ok(())
    }

    fn connect(&mut self, peer: &PeerIdentity) -> Result<(), TransportError> {
        self.record(Call::Connect(peer.clone()));
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.record(Call::DiscoverServices);
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        self.record(Call::EnableNotifications(characteristic));
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        self.record(Call::RequestMtu(mtu));
        Ok(())
    }

    fn write_without_response(
        &mut self,
        _service: Uuid,
        _characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.record(Call::Write(value.to_vec()));
        if self.fail_writes {
            return Err(TransportError::Platform("write rejected".into()));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.record(Call::Disconnect);
        Ok(())
    }
}

impl MockControl {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    pub fn peer() -> PeerIdentity {
        PeerIdentity {
            address: "24:6F:28:AA:BB:CC".into(),
            name: Some(protocol::DEVICE_NAME.into()),
        }
    }

    pub fn advertise(&self) {
        self.emit(TransportEvent::Advertisement(Advertisement {
            peer: Self::peer(),
            service_uuids: vec![protocol::SERVICE_UUID],
            rssi: Some(-48),
        }));
    }

    pub fn nus_services() -> Vec<GattServiceInfo> {
        vec![GattServiceInfo {
            uuid: protocol::SERVICE_UUID,
            characteristics: vec![protocol::WRITE_CHAR_UUID, protocol::NOTIFY_CHAR_UUID],
        }]
    }

    /// Walk the link from advertisement to a discovered profile.
    pub fn complete_handshake(&self) {
        self.advertise();
        self.emit(TransportEvent::Connected);
        self.emit(TransportEvent::ServicesDiscovered(Ok(Self::nus_services())));
    }

    pub fn notify(&self, bytes: &[u8]) {
        self.emit(TransportEvent::Notification {
            characteristic: protocol::NOTIFY_CHAR_UUID,
            value: bytes.to_vec(),
        });
    }
}
