//! Bluetooth Service Module
//!
//! The connection actor. One tokio task owns the transport, the link state
//! and the line framer; callers talk to it through a [`ConnectionHandle`] and
//! transport completions are funneled into the same task, so every state
//! transition happens in one place.

use crate::domain::models::{
    ConnectionState, DecodedMessage, MessageSeverity, PeerIdentity, StatusMessage,
};
use crate::error::{LinkError, ProtocolError};
use crate::infrastructure::bluetooth::{
    connection::{ConnectionConfig, ResolvedLink},
    framer::LineFramer,
    scanner::BleScanner,
    transport::{AdapterState, BleTransport, GattServiceInfo, TransportEvent},
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Requests posted by a [`ConnectionHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkCommand {
    Connect,
    Disconnect,
    Send(String),
    Close,
}

/// Everything the actor reports upward, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    StateChanged(ConnectionState),
    /// One decoded line together with its text.
    Message {
        line: String,
        message: DecodedMessage,
    },
    DecodeError(ProtocolError),
    Log(StatusMessage),
}

/// Cloneable front door to the connection actor. Every method posts and
/// returns immediately.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
    state: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    pub fn connect(&self) {
        self.post(LinkCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.post(LinkCommand::Disconnect);
    }

    /// Queue one command line. The terminator is appended by the actor.
    pub fn send(&self, command: impl Into<String>) {
        self.post(LinkCommand::Send(command.into()));
    }

    /// Disconnect and stop the actor.
    pub fn close(&self) {
        self.post(LinkCommand::Close);
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    fn post(&self, command: LinkCommand) {
        if self.commands.send(command).is_err() {
            debug!("Connection actor has stopped, dropping command");
        }
    }
}

/// Start the connection actor on the current tokio runtime.
pub fn spawn(
    transport: Box<dyn BleTransport>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    config: ConnectionConfig,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<LinkEvent>) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

    let manager = ConnectionManager::new(transport, config, state_tx, event_tx);
    tokio::spawn(manager.run(command_rx, transport_events));

    (
        ConnectionHandle {
            commands: command_tx,
            state: state_rx,
        },
        event_rx,
    )
}

struct ConnectionManager {
    transport: Box<dyn BleTransport>,
    config: ConnectionConfig,
    state: ConnectionState,
    scanner: BleScanner,
    link: Option<ResolvedLink>,
    framer: LineFramer,
    /// Set when the link is dropped; queued transport events then belong
    /// to the old attempt.
    discard_stale: bool,
    state_tx: watch::Sender<ConnectionState>,
    event_sender: mpsc::UnboundedSender<LinkEvent>,
}

impl ConnectionManager {
    fn new(
        transport: Box<dyn BleTransport>,
        config: ConnectionConfig,
        state_tx: watch::Sender<ConnectionState>,
        event_sender: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            scanner: BleScanner::new(config.scan_filter(), config.scan_timeout),
            framer: LineFramer::new(config.max_line_bytes),
            transport,
            config,
            state: ConnectionState::Idle,
            link: None,
            discard_stale: false,
            state_tx,
            event_sender,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Connection actor started");
        loop {
            let deadline = self.scanner.deadline();
            tokio::select! {
                // Commands first, so a disconnect overtakes queued completions.
                biased;
                command = commands.recv() => match command {
                    Some(LinkCommand::Close) | None => {
                        self.disconnect();
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = transport_events.recv() => self.handle_transport_event(event),
                _ = scan_deadline(deadline) => self.on_scan_timeout(),
            }
            if std::mem::take(&mut self.discard_stale) {
                while let Ok(event) = transport_events.try_recv() {
                    debug!("Dropping stale transport event: {:?}", event);
                }
            }
        }
        info!("Connection actor stopped");
    }

    async fn handle_command(&mut self, command: LinkCommand) {
        match command {
            LinkCommand::Connect => self.connect().await,
            LinkCommand::Disconnect => self.disconnect(),
            LinkCommand::Send(text) => self.send(&text),
            LinkCommand::Close => {}
        }
    }

    async fn connect(&mut self) {
        if self.state.is_busy() {
            debug!("Connect ignored while {}", self.state.label());
            return;
        }

        match self.transport.adapter_state().await {
            AdapterState::Unavailable => return self.fail(LinkError::RadioUnavailable),
            AdapterState::Disabled => return self.fail(LinkError::RadioDisabled),
            AdapterState::Ready => {}
        }

        self.link = None;
        self.framer.reset();
        match self.scanner.start(self.transport.as_mut()) {
            Ok(()) => {
                self.send_log("Scanning for peripheral...", MessageSeverity::Info);
                self.set_state(ConnectionState::Scanning);
            }
            Err(e) => self.fail(LinkError::ScanFailed(e.to_string())),
        }
    }

    fn disconnect(&mut self) {
        self.scanner.stop(self.transport.as_mut());

        if self.state.peer().is_some() || self.link.is_some() {
            if let Err(e) = self.transport.disconnect() {
                warn!("Transport disconnect failed: {}", e);
            }
            info!("Disconnected from device");
            self.send_log("Disconnected from device", MessageSeverity::Info);
        }

        self.link = None;
        self.framer.reset();
        self.discard_stale = true;
        self.set_state(ConnectionState::Idle);
    }

    fn send(&mut self, text: &str) {
        let link = match (&self.state, self.link) {
            (ConnectionState::Connected(_), Some(link)) => link,
            _ => {
                warn!("Not connected, dropping command '{}'", text);
                return;
            }
        };

        let line = format!("{}\n", text);
        debug!("TX {}", text);
        if let Err(e) = self
            .transport
            .write_without_response(link.service, link.write, line.as_bytes())
        {
            self.report_write_failure(e.to_string());
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(advertisement) => {
                if !matches!(self.state, ConnectionState::Scanning) {
                    return;
                }
                if let Some(peer) = self.scanner.accept(&advertisement) {
                    self.scanner.stop(self.transport.as_mut());
                    self.open_link(peer);
                }
            }
            TransportEvent::ScanFailed(code) => {
                if matches!(self.state, ConnectionState::Scanning) {
                    self.scanner.stop(self.transport.as_mut());
                    self.fail(LinkError::ScanFailed(code));
                }
            }
            TransportEvent::Connected => self.on_link_up(),
            TransportEvent::ServicesDiscovered(result) => self.on_services_discovered(result),
            TransportEvent::DescriptorWritten { ok } => {
                if ok {
                    debug!("Notification descriptor written");
                } else {
                    // Telemetry may still flow, so the link stays up.
                    warn!("Remote notification subscription failed");
                    self.send_log("Notification subscription failed", MessageSeverity::Warning);
                }
            }
            TransportEvent::MtuChanged(Ok(mtu)) => info!("MTU negotiated: {}", mtu),
            TransportEvent::MtuChanged(Err(e)) => warn!("MTU request failed: {}", e),
            TransportEvent::Notification {
                characteristic,
                value,
            } => self.on_notification(characteristic, &value),
            TransportEvent::WriteCompleted(Ok(())) => {}
            TransportEvent::WriteCompleted(Err(e)) => self.report_write_failure(e),
            TransportEvent::Disconnected { error } => self.on_transport_disconnected(error),
        }
    }

    fn open_link(&mut self, peer: PeerIdentity) {
        info!("Connecting to {}", peer);
        self.set_state(ConnectionState::Connecting(peer.clone()));
        if let Err(e) = self.transport.connect(&peer) {
            self.teardown(LinkError::ConnectFailed(e.to_string()));
        }
    }

    fn on_link_up(&mut self) {
        let ConnectionState::Connecting(peer) = &self.state else {
            debug!("Ignoring link-up while {}", self.state.label());
            return;
        };
        info!("Link up with {}, discovering services", peer);
        if let Err(e) = self.transport.discover_services() {
            self.teardown(LinkError::DiscoveryFailed(e.to_string()));
        }
    }

    fn on_services_discovered(&mut self, result: Result<Vec<GattServiceInfo>, String>) {
        let ConnectionState::Connecting(peer) = self.state.clone() else {
            debug!("Ignoring discovery result while {}", self.state.label());
            return;
        };

        let services = match result {
            Ok(services) => services,
            Err(status) => return self.teardown(LinkError::DiscoveryFailed(status)),
        };
        let link = match self.config.resolve(&services) {
            Ok(link) => link,
            Err(reason) => return self.teardown(reason),
        };

        if let Err(e) = self.transport.enable_notifications(link.service, link.notify) {
            warn!("Could not enable notifications: {}", e);
            self.send_log("Notification subscription failed", MessageSeverity::Warning);
        }
        if let Err(e) = self.transport.request_mtu(self.config.requested_mtu) {
            warn!("MTU request failed: {}", e);
        }

        self.link = Some(link);
        self.framer.reset();
        info!("Connected to {}", peer);
        self.send_log("Connection established!", MessageSeverity::Success);
        self.set_state(ConnectionState::Connected(peer));
    }

    fn on_notification(&mut self, characteristic: Uuid, value: &[u8]) {
        match self.link {
            Some(link) if link.notify == characteristic => {}
            Some(_) => {
                warn!("Notification from unexpected characteristic {}", characteristic);
                return;
            }
            None => {
                debug!("Notification with no active link, dropped");
                return;
            }
        }

        let mut frames = self.framer.feed(value);
        while let Some(frame) = frames.next_with_line() {
            let event = match frame {
                Ok((line, message)) => LinkEvent::Message { line, message },
                Err(e) => {
                    debug!("Decode error: {}", e);
                    LinkEvent::DecodeError(e)
                }
            };
            let _ = self.event_sender.send(event);
        }
    }

    fn on_transport_disconnected(&mut self, error: Option<String>) {
        if self.state.peer().is_none() {
            // Late callback after a local disconnect or a fatal failure.
            debug!("Ignoring transport disconnect while {}", self.state.label());
            return;
        }

        self.link = None;
        self.framer.reset();
        match error {
            Some(status) => self.fail(LinkError::TransportDisconnected(status)),
            None => {
                info!("Peripheral closed the link");
                self.send_log("Disconnected from device", MessageSeverity::Info);
                self.set_state(ConnectionState::Idle);
            }
        }
    }

    fn on_scan_timeout(&mut self) {
        warn!("No peripheral found within {:?}", self.config.scan_timeout);
        self.scanner.stop(self.transport.as_mut());
        self.fail(LinkError::ScanTimeout);
    }

    /// Fatal failure on an open link: drop it before reporting.
    fn teardown(&mut self, reason: LinkError) {
        if let Err(e) = self.transport.disconnect() {
            warn!("Transport disconnect failed: {}", e);
        }
        self.link = None;
        self.framer.reset();
        self.discard_stale = true;
        self.fail(reason);
    }

    fn fail(&mut self, reason: LinkError) {
        error!("Connection failed: {}", reason);
        self.send_log(&format!("Connection failed: {}", reason), MessageSeverity::Error);
        self.set_state(ConnectionState::Failed(reason));
    }

    fn report_write_failure(&mut self, reason: String) {
        let error = LinkError::WriteFailed(reason);
        warn!("{}", error);
        self.send_log(&error.to_string(), MessageSeverity::Warning);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!("Link state: {} -> {}", self.state.label(), state.label());
        self.state = state.clone();
        self.state_tx.send_replace(state.clone());
        let _ = self.event_sender.send(LinkEvent::StateChanged(state));
    }

    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(LinkEvent::Log(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

async fn scan_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
