//! Replay Transport
//!
//! Simulated peripheral that streams a captured newline-delimited JSON log
//! as notifications, split at default-MTU payload size. Written commands are
//! logged and acknowledged the way the firmware does.

use crate::domain::models::PeerIdentity;
use crate::error::TransportError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    AdapterState, Advertisement, BleTransport, GattServiceInfo, ScanFilter, TransportEvent,
};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// ATT payload with the default 23-byte MTU
pub const CHUNK_SIZE: usize = 20;

const SIMULATED_MTU: u16 = 23;

pub struct ReplayTransport {
    capture: Vec<u8>,
    chunk_interval: Duration,
    event_sender: mpsc::UnboundedSender<TransportEvent>,
    connected: bool,
    playback: Option<JoinHandle<()>>,
}

impl ReplayTransport {
    pub fn new(
        capture: Vec<u8>,
        chunk_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                capture,
                chunk_interval,
                event_sender: tx,
                connected: false,
                playback: None,
            },
            rx,
        )
    }

    pub fn from_file(
        path: &Path,
        chunk_interval: Duration,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let capture = std::fs::read(path)?;
        info!("Loaded {} byte capture from {}", capture.len(), path.display());
        Ok(Self::new(capture, chunk_interval))
    }

    fn peer() -> PeerIdentity {
        PeerIdentity {
            address: "replay".to_string(),
            name: Some(protocol::DEVICE_NAME.to_string()),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.event_sender.send(event);
    }

    fn stop_playback(&mut self) {
        if let Some(task) = self.playback.take() {
            task.abort();
        }
    }

    fn start_playback(&mut self) {
        self.stop_playback();

        let chunks: Vec<Vec<u8>> = self.capture.chunks(CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        let interval = self.chunk_interval;
        let sender = self.event_sender.clone();
        info!("Replaying {} chunks", chunks.len());

        self.playback = Some(tokio::spawn(async move {
            for value in chunks {
                tokio::time::sleep(interval).await;
                let event = TransportEvent::Notification {
                    characteristic: protocol::NOTIFY_CHAR_UUID,
                    value,
                };
                if sender.send(event).is_err() {
                    return;
                }
            }
            info!("Replay finished");
            let _ = sender.send(TransportEvent::Disconnected { error: None });
        }));
    }
}

#[async_trait]
impl BleTransport for ReplayTransport {
    async fn adapter_state(&mut self) -> AdapterState {
        AdapterState::Ready
    }

    fn start_scan(&mut self, _filter: &ScanFilter) -> Result<(), TransportError> {
        self.emit(TransportEvent::Advertisement(Advertisement {
            peer: Self::peer(),
            service_uuids: vec![protocol::SERVICE_UUID],
            rssi: None,
        }));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect(&mut self, _peer: &PeerIdentity) -> Result<(), TransportError> {
        self.connected = true;
        self.emit(TransportEvent::Connected);
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.emit(TransportEvent::ServicesDiscovered(Ok(vec![GattServiceInfo {
            uuid: protocol::SERVICE_UUID,
            characteristics: vec![protocol::WRITE_CHAR_UUID, protocol::NOTIFY_CHAR_UUID],
        }])));
        Ok(())
    }

    fn enable_notifications(
        &mut self,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<(), TransportError> {
        if characteristic != protocol::NOTIFY_CHAR_UUID {
            self.emit(TransportEvent::DescriptorWritten { ok: false });
            return Ok(());
        }
        self.emit(TransportEvent::DescriptorWritten { ok: true });
        self.start_playback();
        Ok(())
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        debug!("Replay keeps default MTU (requested {})", mtu);
        self.emit(TransportEvent::MtuChanged(Ok(SIMULATED_MTU)));
        Ok(())
    }

    fn write_without_response(
        &mut self,
        _service: Uuid,
        _characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let command = String::from_utf8_lossy(value).trim().to_string();
        info!("Replay peripheral received '{}'", command);

        let ack = serde_json::json!({ "event": "ack", "cmd": command });
        self.emit(TransportEvent::Notification {
            characteristic: protocol::NOTIFY_CHAR_UUID,
            value: format!("{}\n", ack).into_bytes(),
        });
        self.emit(TransportEvent::WriteCompleted(Ok(())));
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.stop_playback();
        if std::mem::take(&mut self.connected) {
            self.emit(TransportEvent::Disconnected { error: None });
        }
        Ok(())
    }
}

impl Drop for ReplayTransport {
    fn drop(&mut self) {
        self.stop_playback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConnectionState, DecodedMessage, Direction};
    use crate::infrastructure::bluetooth::connection::ConnectionConfig;
    use crate::infrastructure::bluetooth::service::{self, LinkEvent};

    #[tokio::test(start_paused = true)]
    async fn test_replay_drives_actor_end_to_end() {
        let capture = b"{\"boot\":true,\"gyro\":\"ON\",\"fw\":\"2.0\",\"who\":104}\n\
{\"event\":\"right\",\"left_count\":0,\"right_count\":1,\"forward_count\":0}\n"
            .to_vec();
        let (transport, events) = ReplayTransport::new(capture, Duration::from_millis(10));
        let (handle, mut link_events) =
            service::spawn(Box::new(transport), events, ConnectionConfig::default());

        handle.connect();

        let mut messages = Vec::new();
        while let Some(event) = link_events.recv().await {
            match event {
                LinkEvent::Message { message, .. } => messages.push(message),
                LinkEvent::StateChanged(ConnectionState::Idle) => break,
                _ => {}
            }
        }

        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0], DecodedMessage::BootInfo { .. }));
        assert!(matches!(
            messages[1],
            DecodedMessage::DirectionalEvent {
                kind: Direction::Right,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_writes_are_acknowledged() {
        let (mut transport, mut events) = ReplayTransport::new(Vec::new(), Duration::ZERO);
        transport.connect(&ReplayTransport::peer()).unwrap();
        transport
            .write_without_response(
                protocol::SERVICE_UUID,
                protocol::WRITE_CHAR_UUID,
                b"CAL\n",
            )
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        match events.recv().await {
            Some(TransportEvent::Notification { value, .. }) => {
                let line = String::from_utf8(value).unwrap();
                assert_eq!(
                    protocol::decode_line(line.trim()).unwrap(),
                    DecodedMessage::Ack {
                        command: "CAL".into()
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
