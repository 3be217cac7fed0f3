//! Motion Orchestrator
//!
//! Reconciles link telemetry, host pose transitions and activity
//! classification into one [`MotionSnapshot`], and drives the movement and
//! calibration callbacks of a [`MotionListener`].

use crate::domain::classifier::{ActivityClassifier, Classification};
use crate::domain::models::{
    colors, Axes, CalibrationPrompt, ConnectionState, Counts, DecodedMessage, Direction,
    MessageSeverity, MotionSnapshot, MovementRecord, MovementSource, SensorMode,
};
use crate::domain::pose::{PoseEngine, PoseEvent, PoseSample, PoseState};
use crate::domain::settings::Settings;
use crate::error::{ClassifierError, ProtocolError};
use crate::infrastructure::bluetooth::protocol::{Command, LedColor, MAX_RATE_HZ, MIN_RATE_HZ};
use crate::infrastructure::bluetooth::{ConnectionHandle, LinkEvent};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Maximum lines kept in the snapshot log
pub const LOG_LIMIT: usize = 100;

/// How often calibration is advanced when no samples arrive
const CALIBRATION_TICK: Duration = Duration::from_millis(100);

/// Upper bound on the configured prompt hide delay
const MAX_PROMPT_HIDE: Duration = Duration::from_secs(3600);

/// Movement and calibration hooks for the display layer. Every method
/// defaults to a no-op.
pub trait MotionListener: Send {
    fn on_left(&mut self) {}
    fn on_right(&mut self) {}
    fn on_forward(&mut self) {}
    fn on_back(&mut self) {}
    fn on_calibration_start(&mut self) {}
    fn on_calibration_phase(&mut self, _text: &str, _color: u32) {}
    fn on_calibration_complete(&mut self) {}
}

pub struct MotionOrchestrator {
    link: ConnectionHandle,
    pose: PoseEngine,
    classifier: ActivityClassifier,
    listener: Box<dyn MotionListener>,
    snapshot: watch::Sender<MotionSnapshot>,
    prompt_hide_delay: Duration,
    prompt_hide_at: Option<Instant>,
}

impl MotionOrchestrator {
    pub fn new(
        link: ConnectionHandle,
        pose: PoseEngine,
        classifier: ActivityClassifier,
        listener: Box<dyn MotionListener>,
        settings: &Settings,
    ) -> Self {
        let initial = MotionSnapshot {
            brightness: settings.brightness,
            sample_rate_hz: settings.sample_rate_hz.clamp(MIN_RATE_HZ, MAX_RATE_HZ),
            ai_model_loaded: classifier.is_loaded(),
            ..MotionSnapshot::default()
        };
        info!(
            "Orchestrator ready (activity model loaded: {})",
            initial.ai_model_loaded
        );

        Self {
            link,
            pose,
            classifier,
            listener,
            snapshot: watch::Sender::new(initial),
            prompt_hide_delay: Duration::from_millis(settings.calibration_prompt_hide_ms)
                .min(MAX_PROMPT_HIDE),
            prompt_hide_at: None,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<MotionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> MotionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Process link events, pose samples and timers until the link actor
    /// goes away.
    pub async fn run(
        &mut self,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut pose_samples: mpsc::UnboundedReceiver<PoseSample>,
    ) {
        let mut calibration_tick = tokio::time::interval(CALIBRATION_TICK);
        calibration_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let calibrating = self.pose.is_calibrating();
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(event) => self.handle_link_event(event),
                    None => break,
                },
                Some(sample) = pose_samples.recv() => self.handle_pose_sample(sample),
                _ = calibration_tick.tick(), if calibrating => {
                    if let Some(event) = self.pose.tick() {
                        self.handle_pose_event(event);
                    }
                }
                _ = prompt_deadline(self.prompt_hide_at) => self.hide_calibration_prompt(),
            }
        }
        debug!("Link event stream closed");
    }

    // ---- commands ----

    pub fn connect(&self) {
        self.link.connect();
    }

    pub fn disconnect(&self) {
        self.link.disconnect();
    }

    /// Stop the link actor and pose processing.
    pub fn close(&mut self) {
        self.pose.set_processing_enabled(false);
        self.link.close();
    }

    /// Send free text typed by an operator.
    pub fn send_core_command(&mut self, text: &str) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }
        self.append_log(format!("[TX] {}", trimmed));
        match Command::parse(trimmed) {
            Command::On => self.update(|s| s.gyro_state = "ON".to_string()),
            Command::Off => self.update(|s| s.gyro_state = "OFF".to_string()),
            _ => {}
        }
        self.link.send(trimmed);
    }

    pub fn send_led_command(&mut self, color: LedColor) {
        self.transmit(Command::Led(color));
    }

    pub fn set_brightness(&mut self, value: i32) {
        let clamped = value.clamp(0, 255) as u8;
        self.update(|s| s.brightness = clamped);
        self.transmit(Command::Brightness(clamped));
    }

    pub fn set_sample_rate(&mut self, hz: u32) {
        let clamped = hz.clamp(MIN_RATE_HZ as u32, MAX_RATE_HZ as u32) as u16;
        self.update(|s| s.sample_rate_hz = clamped);
        self.transmit(Command::Rate(clamped));
    }

    pub fn reset_counts(&mut self) {
        self.send_core_command(&Command::ResetCounts.to_string());
        self.update(|s| {
            s.left_count = 0;
            s.right_count = 0;
            s.forward_count = 0;
            s.back_count = 0;
        });
    }

    /// Switching to the host gyroscope starts a calibration run.
    pub fn set_sensor_mode(&mut self, mode: SensorMode) {
        if self.snapshot.borrow().sensor_mode == mode {
            return;
        }
        info!("Switched to sensor mode: {:?}", mode);

        let events = self
            .pose
            .set_processing_enabled(mode == SensorMode::HostGyro);
        self.update(|s| s.sensor_mode = mode);
        if mode == SensorMode::Peripheral {
            self.prompt_hide_at = None;
            self.update(|s| s.calibration_prompt.visible = false);
        }
        for event in events {
            self.handle_pose_event(event);
        }
    }

    // ---- inbound ----

    pub fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::StateChanged(state) => self.on_connection_state(&state),
            LinkEvent::Message { line, message } => {
                self.append_log(format!("[RX] {}", line));
                self.on_message(message);
            }
            LinkEvent::DecodeError(e) => {
                match &e {
                    ProtocolError::Malformed { line, .. } | ProtocolError::NotAnObject(line) => {
                        self.append_log(format!("[RX] {}", line));
                    }
                    ProtocolError::LineTooLong { .. } => {}
                }
                warn!("Decode error: {}", e);
                self.append_log(format!("[ERR] parse: {}", e));
            }
            LinkEvent::Log(status) => match status.severity {
                MessageSeverity::Warning | MessageSeverity::Error => {
                    warn!("{}", status.message);
                    if status.severity == MessageSeverity::Warning {
                        self.append_log(format!("[ERR] {}", status.message));
                    }
                }
                MessageSeverity::Info | MessageSeverity::Success => {
                    debug!("{}", status.message)
                }
            },
        }
    }

    pub fn handle_pose_sample(&mut self, sample: PoseSample) {
        if self.snapshot.borrow().sensor_mode != SensorMode::HostGyro {
            return;
        }
        if let Some(event) = self.pose.process(sample) {
            self.handle_pose_event(event);
        }
    }

    fn on_connection_state(&mut self, state: &ConnectionState) {
        let label = state.label().to_string();
        let failure = state.failure().map(|e| e.to_string());
        self.update(|s| {
            s.connection_state = label;
            s.connection_error = failure.clone();
        });
        if let Some(reason) = failure {
            error!("Link failed: {}", reason);
            self.append_log(format!("[ERR] {}", reason));
        }

        // The peripheral boots with its own defaults.
        if state.is_connected() {
            let (brightness, rate) = {
                let snapshot = self.snapshot.borrow();
                (snapshot.brightness, snapshot.sample_rate_hz)
            };
            self.transmit(Command::Brightness(brightness));
            self.transmit(Command::Rate(rate));
        }
    }

    fn on_message(&mut self, message: DecodedMessage) {
        match message {
            DecodedMessage::Motion {
                counts,
                accel,
                gyro,
            } => {
                debug!("motion: {:?} accel={:?} gyro={:?}", counts, accel, gyro);
                self.update(|s| {
                    merge_counts(s, counts);
                    merge_axes(&mut s.last_accel, accel);
                    merge_axes(&mut s.last_gyro, gyro);
                });
                if let Some([ax, ay, az]) = accel.complete() {
                    if self.classifier.is_loaded() {
                        self.classify(ax, ay, az);
                    }
                }
            }
            DecodedMessage::DirectionalEvent { kind, counts } => {
                debug!("Peripheral movement event: {:?}, counts: {:?}", kind, counts);
                self.update(|s| {
                    merge_counts(s, counts);
                    s.last_event = Some(kind);
                });
                self.on_movement(kind, MovementSource::Peripheral);
            }
            DecodedMessage::Ack { command } => {
                self.append_log(format!("[RX] ack cmd={}", command));
                match command.to_ascii_uppercase().as_str() {
                    "ON" => self.update(|s| s.gyro_state = "ON".to_string()),
                    "OFF" => self.update(|s| s.gyro_state = "OFF".to_string()),
                    _ => {}
                }
            }
            DecodedMessage::BootInfo {
                firmware_version,
                sensor_id,
                sensor_enabled,
            } => {
                info!(
                    "Peripheral booted: fw={:?} who={:?} gyro={:?}",
                    firmware_version, sensor_id, sensor_enabled
                );
                self.update(|s| {
                    if let Some(enabled) = sensor_enabled {
                        s.imu_status = if enabled { "OK" } else { "IMU OFF" }.to_string();
                        s.gyro_state = on_off(enabled);
                    }
                    if let Some(fw) = firmware_version {
                        s.firmware_version = Some(fw);
                    }
                    if let Some(id) = sensor_id {
                        s.who_am_i = Some(format!("0x{:X}", id));
                    }
                });
            }
            DecodedMessage::StateChange { enabled } => {
                self.update(|s| s.gyro_state = on_off(enabled));
            }
            DecodedMessage::ErrorText(text) => {
                warn!("Peripheral error: {}", text);
                self.append_log(format!("[ERR] {}", text));
            }
            DecodedMessage::ImuStatus(text) => {
                self.append_log(format!("[RX] imu={}", text));
            }
            DecodedMessage::Unrecognized(raw) => debug!("Unrecognized line: {}", raw),
        }
    }

    fn classify(&mut self, ax: f32, ay: f32, az: f32) {
        match self.classifier.process(ax, ay, az) {
            Ok(Classification::Collecting) => {
                self.update(|s| {
                    s.ai_activity = None;
                    s.ai_confidence = 0.0;
                });
            }
            Ok(Classification::Activity(result)) => {
                info!(
                    "Activity: {} ({:.0}%)",
                    result.activity.label(),
                    result.confidence * 100.0
                );
                // Display only, never counted.
                if let Some(direction) = result.activity.display_direction() {
                    self.update(|s| {
                        s.ai_activity = Some(direction);
                        s.ai_confidence = result.confidence;
                    });
                }
            }
            Err(e) => {
                match e {
                    ClassifierError::InvalidSample { .. } => debug!("{}", e),
                    _ => warn!("Activity classification failed: {}", e),
                }
                self.update(|s| {
                    s.ai_activity = None;
                    s.ai_confidence = 0.0;
                });
            }
        }
    }

    fn handle_pose_event(&mut self, event: PoseEvent) {
        match event {
            PoseEvent::CalibrationStarted => {
                self.prompt_hide_at = None;
                self.show_prompt("Calibration starting...", colors::WHITE);
                self.listener.on_calibration_start();
            }
            PoseEvent::CalibrationPhase {
                instruction, color, ..
            } => {
                self.show_prompt(instruction, color);
                self.listener.on_calibration_phase(instruction, color);
            }
            PoseEvent::CalibrationComplete => {
                self.show_prompt(
                    "Calibration complete! Motion detection active.",
                    colors::GREEN,
                );
                self.listener.on_calibration_complete();
                self.prompt_hide_at = Some(Instant::now() + self.prompt_hide_delay);
            }
            PoseEvent::Transition(pose) => {
                let direction = match pose {
                    PoseState::Left => Direction::Left,
                    PoseState::Right => Direction::Right,
                    PoseState::Middle => Direction::Forward,
                    PoseState::Back => Direction::Back,
                };
                self.on_movement(direction, MovementSource::HostGyro);
            }
        }
    }

    fn on_movement(&mut self, direction: Direction, source: MovementSource) {
        info!("Movement: {} from {:?}", direction.as_str(), source);

        // The peripheral reports its own totals.
        let counted = source != MovementSource::Peripheral;
        let record = MovementRecord {
            direction,
            source,
            timestamp: chrono::Local::now().format("%H:%M:%S").to_string(),
            color: direction.color(),
        };
        self.update(|s| {
            if counted {
                match direction {
                    Direction::Left => s.left_count += 1,
                    Direction::Right => s.right_count += 1,
                    Direction::Forward => s.forward_count += 1,
                    Direction::Back => s.back_count += 1,
                }
            }
            s.last_movement = Some(record);
        });

        match direction {
            Direction::Left => self.listener.on_left(),
            Direction::Right => self.listener.on_right(),
            Direction::Forward => self.listener.on_forward(),
            Direction::Back => self.listener.on_back(),
        }
        self.send_led_command(LedColor::for_direction(direction));
    }

    fn show_prompt(&mut self, text: &str, color: u32) {
        let prompt = CalibrationPrompt {
            text: text.to_string(),
            color,
            visible: true,
        };
        self.update(|s| s.calibration_prompt = prompt);
    }

    fn hide_calibration_prompt(&mut self) {
        self.prompt_hide_at = None;
        self.update(|s| s.calibration_prompt.visible = false);
    }

    fn transmit(&mut self, command: Command) {
        let text = command.to_string();
        self.append_log(format!("[TX] {}", text));
        self.link.send(text);
    }

    fn append_log(&mut self, line: String) {
        self.update(|s| {
            s.log_lines.push(line);
            if s.log_lines.len() > LOG_LIMIT {
                let excess = s.log_lines.len() - LOG_LIMIT;
                s.log_lines.drain(..excess);
            }
        });
    }

    /// Rebuild the snapshot from the current one and publish it.
    fn update(&self, transform: impl FnOnce(&mut MotionSnapshot)) {
        let mut next = self.snapshot.borrow().clone();
        transform(&mut next);
        self.snapshot.send_replace(next);
    }
}

fn on_off(enabled: bool) -> String {
    if enabled { "ON" } else { "OFF" }.to_string()
}

fn merge_counts(snapshot: &mut MotionSnapshot, counts: Counts) {
    if let Some(left) = counts.left {
        snapshot.left_count = left;
    }
    if let Some(right) = counts.right {
        snapshot.right_count = right;
    }
    if let Some(forward) = counts.forward {
        snapshot.forward_count = forward;
    }
}

fn merge_axes(target: &mut [f32; 3], axes: Axes) {
    for (slot, value) in target.iter_mut().zip([axes.x, axes.y, axes.z]) {
        if let Some(v) = value {
            *slot = v;
        }
    }
}

async fn prompt_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
