use crate::error::LinkError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ARGB colour hints handed to the display layer.
pub mod colors {
    pub const WHITE: u32 = 0xFFFF_FFFF;
    pub const YELLOW: u32 = 0xFFFF_FF00;
    pub const GREEN: u32 = 0xFF00_FF00;
    pub const MAGENTA: u32 = 0xFFFF_00FF;
    pub const BLUE: u32 = 0xFF00_00FF;
    pub const RED: u32 = 0xFFFF_0000;
}

/// A discovered peripheral. Immutable once seen in an advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerIdentity {
    pub address: String,
    pub name: Option<String>,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting(PeerIdentity),
    Connected(PeerIdentity),
    Failed(LinkError),
}

impl ConnectionState {
    /// Short label rendered directly by the display layer.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "Disconnected",
            Self::Scanning => "Scanning",
            Self::Connecting(_) => "Connecting",
            Self::Connected(_) => "Connected",
            Self::Failed(_) => "Error",
        }
    }

    /// True while a connect attempt is in flight or established.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting(_) | Self::Connected(_)
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }

    pub fn peer(&self) -> Option<&PeerIdentity> {
        match self {
            Self::Connecting(peer) | Self::Connected(peer) => Some(peer),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&LinkError> {
        match self {
            Self::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Per-direction totals as reported by the peripheral. Each field is optional
/// because firmware revisions send partial payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub left: Option<u32>,
    pub right: Option<u32>,
    pub forward: Option<u32>,
}

/// One three-axis reading with individually optional components.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Axes {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
}

impl Axes {
    /// All three components, if every one was present.
    pub fn complete(&self) -> Option<[f32; 3]> {
        Some([self.x?, self.y?, self.z?])
    }
}

/// Movement directions shared by the peripheral, the pose engine and the
/// display layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
    Forward,
    Back,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "LEFT",
            Self::Right => "RIGHT",
            Self::Forward => "FORWARD",
            Self::Back => "BACK",
        }
    }

    /// Colour used for the last-movement banner.
    pub fn color(&self) -> u32 {
        match self {
            Self::Left => colors::BLUE,
            Self::Right => colors::GREEN,
            Self::Forward => colors::WHITE,
            Self::Back => colors::RED,
        }
    }
}

/// One line of peripheral output, decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Motion {
        counts: Counts,
        accel: Axes,
        gyro: Axes,
    },
    /// `left`, `right` or `forward` counted on the peripheral itself.
    DirectionalEvent {
        kind: Direction,
        counts: Counts,
    },
    Ack {
        command: String,
    },
    BootInfo {
        firmware_version: Option<String>,
        sensor_id: Option<u32>,
        sensor_enabled: Option<bool>,
    },
    StateChange {
        enabled: bool,
    },
    ErrorText(String),
    ImuStatus(String),
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Where movement events come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SensorMode {
    /// The peripheral's own accelerometer-based counter.
    #[default]
    Peripheral,
    /// The host gyroscope feeding the pose engine.
    HostGyro,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementSource {
    Peripheral,
    HostGyro,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementRecord {
    pub direction: Direction,
    pub source: MovementSource,
    /// Local wall clock, `HH:MM:SS`.
    pub timestamp: String,
    pub color: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationPrompt {
    pub text: String,
    pub color: u32,
    pub visible: bool,
}

impl Default for CalibrationPrompt {
    fn default() -> Self {
        Self {
            text: String::new(),
            color: colors::WHITE,
            visible: false,
        }
    }
}

/// Read-only view handed to the display layer. Rebuilt on every change.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSnapshot {
    pub connection_state: String,
    pub connection_error: Option<String>,
    pub imu_status: String,
    pub gyro_state: String,
    pub who_am_i: Option<String>,
    pub firmware_version: Option<String>,

    pub left_count: u32,
    pub right_count: u32,
    pub forward_count: u32,
    pub back_count: u32,
    pub last_event: Option<Direction>,

    pub last_accel: [f32; 3],
    pub last_gyro: [f32; 3],

    pub brightness: u8,
    pub sample_rate_hz: u16,
    pub log_lines: Vec<String>,

    pub last_movement: Option<MovementRecord>,
    pub calibration_prompt: CalibrationPrompt,
    pub sensor_mode: SensorMode,

    // Activity classification, display only
    pub ai_activity: Option<Direction>,
    pub ai_confidence: f32,
    pub ai_model_loaded: bool,
}

impl Default for MotionSnapshot {
    fn default() -> Self {
        Self {
            connection_state: ConnectionState::Idle.label().to_string(),
            connection_error: None,
            imu_status: "Unknown".to_string(),
            gyro_state: "OFF".to_string(),
            who_am_i: None,
            firmware_version: None,
            left_count: 0,
            right_count: 0,
            forward_count: 0,
            back_count: 0,
            last_event: None,
            last_accel: [0.0; 3],
            last_gyro: [0.0; 3],
            brightness: 128,
            sample_rate_hz: 50,
            log_lines: Vec::new(),
            last_movement: None,
            calibration_prompt: CalibrationPrompt::default(),
            sensor_mode: SensorMode::default(),
            ai_activity: None,
            ai_confidence: 0.0,
            ai_model_loaded: false,
        }
    }
}
