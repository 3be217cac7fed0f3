//! Peripheral Protocol
//!
//! This module contains the profile identifiers, outbound command vocabulary
//! and line decoder for the ESP32 motion peripheral. Each notification line
//! is one UTF-8 JSON object.

use crate::domain::models::{Axes, Counts, DecodedMessage, Direction};
use crate::error::ProtocolError;
use serde_json::{Map, Value};
use std::fmt;
use tracing::trace;
use uuid::Uuid;

/// Nordic UART-style service
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Host → peripheral, write without response
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Peripheral → host, notify
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// Client Characteristic Configuration Descriptor
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Advertised name of the stock firmware
pub const DEVICE_NAME: &str = "ESP32-GYRO-ON";

/// LED colours understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedColor {
    Red,
    Green,
    Blue,
    White,
    Yellow,
    Teal,
    Lime,
    Navy,
    Magenta,
    Orange,
    Off,
}

impl LedColor {
    pub fn code(&self) -> char {
        match self {
            Self::Red => 'r',
            Self::Green => 'g',
            Self::Blue => 'b',
            Self::White => 'w',
            Self::Yellow => 'y',
            Self::Teal => 't',
            Self::Lime => 'l',
            Self::Navy => 'n',
            Self::Magenta => 'm',
            Self::Orange => 'o',
            Self::Off => 's',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Some(match code {
            'r' => Self::Red,
            'g' => Self::Green,
            'b' => Self::Blue,
            'w' => Self::White,
            'y' => Self::Yellow,
            't' => Self::Teal,
            'l' => Self::Lime,
            'n' => Self::Navy,
            'm' => Self::Magenta,
            'o' => Self::Orange,
            's' => Self::Off,
            _ => return None,
        })
    }

    /// Colour flashed for a counted movement.
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Left => Self::Blue,
            Direction::Right => Self::Green,
            Direction::Forward => Self::White,
            Direction::Back => Self::Red,
        }
    }
}

/// Outbound text commands. The line terminator is added by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start streaming gyro/motion data
    On,
    /// Stop streaming
    Off,
    /// Run the on-board IMU calibration
    Calibrate,
    /// Zero the peripheral's movement counters
    ResetCounts,
    Led(LedColor),
    /// LED brightness, 0-255
    Brightness(u8),
    /// Sample rate in Hz, clamped to 10-200
    Rate(u16),
    Raw(String),
}

pub const MIN_RATE_HZ: u16 = 10;
pub const MAX_RATE_HZ: u16 = 200;

impl Command {
    pub fn rate(hz: u32) -> Self {
        Self::Rate(hz.clamp(MIN_RATE_HZ as u32, MAX_RATE_HZ as u32) as u16)
    }

    pub fn brightness(value: i32) -> Self {
        Self::Brightness(value.clamp(0, 255) as u8)
    }

    /// Parse free text typed by an operator, falling back to `Raw`.
    pub fn parse(text: &str) -> Self {
        let trimmed = text.trim();
        match trimmed.to_ascii_uppercase().as_str() {
            "ON" => return Self::On,
            "OFF" => return Self::Off,
            "CAL" => return Self::Calibrate,
            "RESET_COUNTS" => return Self::ResetCounts,
            _ => {}
        }

        let mut chars = trimmed.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if let Some(color) = LedColor::from_code(c) {
                return Self::Led(color);
            }
        }

        if let Some(value) = trimmed.strip_prefix("BRIGHT:") {
            if let Ok(v) = value.trim().parse::<i32>() {
                return Self::brightness(v);
            }
        }
        if let Some(value) = trimmed.strip_prefix("RATE ") {
            if let Ok(v) = value.trim().parse::<u32>() {
                return Self::rate(v);
            }
        }

        Self::Raw(trimmed.to_string())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::On => write!(f, "ON"),
            Self::Off => write!(f, "OFF"),
            Self::Calibrate => write!(f, "CAL"),
            Self::ResetCounts => write!(f, "RESET_COUNTS"),
            Self::Led(color) => write!(f, "{}", color.code()),
            Self::Brightness(v) => write!(f, "BRIGHT:{}", v),
            Self::Rate(hz) => write!(f, "RATE {}", hz),
            Self::Raw(text) => write!(f, "{}", text),
        }
    }
}

/// Decode one complete, trimmed, non-empty line.
///
/// Missing or mistyped keys never fail the line: unknown shapes come back as
/// [`DecodedMessage::Unrecognized`].
pub fn decode_line(line: &str) -> Result<DecodedMessage, ProtocolError> {
    let value: Value = serde_json::from_str(line).map_err(|e| ProtocolError::Malformed {
        line: line.to_string(),
        reason: e.to_string(),
    })?;
    let Value::Object(obj) = value else {
        return Err(ProtocolError::NotAnObject(line.to_string()));
    };

    trace!("Decoding: {}", line);

    if obj.contains_key("boot") {
        return Ok(decode_boot(&obj));
    }

    if let Some(event) = string_field(&obj, "event") {
        return Ok(match event {
            "motion" => DecodedMessage::Motion {
                counts: counts(&obj),
                accel: axes(&obj, ["ax", "ay", "az"]),
                gyro: axes(&obj, ["gx", "gy", "gz"]),
            },
            "left" | "right" | "forward" => DecodedMessage::DirectionalEvent {
                kind: match event {
                    "left" => Direction::Left,
                    "right" => Direction::Right,
                    _ => Direction::Forward,
                },
                counts: counts(&obj),
            },
            "ack" => DecodedMessage::Ack {
                command: string_field(&obj, "cmd").unwrap_or("?").to_string(),
            },
            _ => DecodedMessage::Unrecognized(line.to_string()),
        });
    }

    if let Some(state) = string_field(&obj, "state") {
        match state {
            "GYRO_ON" => return Ok(DecodedMessage::StateChange { enabled: true }),
            "GYRO_OFF" => return Ok(DecodedMessage::StateChange { enabled: false }),
            _ => {}
        }
    }

    if let Some(error) = string_field(&obj, "error") {
        return Ok(DecodedMessage::ErrorText(error.to_string()));
    }

    if let Some(imu) = string_field(&obj, "imu") {
        return Ok(DecodedMessage::ImuStatus(imu.to_string()));
    }

    if let Some(enabled) = string_field(&obj, "gyro").and_then(on_off) {
        return Ok(DecodedMessage::StateChange { enabled });
    }

    Ok(DecodedMessage::Unrecognized(line.to_string()))
}

fn decode_boot(obj: &Map<String, Value>) -> DecodedMessage {
    DecodedMessage::BootInfo {
        firmware_version: string_field(obj, "fw").map(str::to_string),
        sensor_id: int_field(obj, "who"),
        sensor_enabled: string_field(obj, "gyro").and_then(on_off),
    }
}

fn on_off(text: &str) -> Option<bool> {
    match text.to_ascii_uppercase().as_str() {
        "ON" => Some(true),
        "OFF" => Some(false),
        _ => None,
    }
}

fn counts(obj: &Map<String, Value>) -> Counts {
    Counts {
        left: int_field(obj, "left_count"),
        right: int_field(obj, "right_count"),
        forward: int_field(obj, "forward_count"),
    }
}

fn axes(obj: &Map<String, Value>, keys: [&str; 3]) -> Axes {
    Axes {
        x: float_field(obj, keys[0]),
        y: float_field(obj, keys[1]),
        z: float_field(obj, keys[2]),
    }
}

fn string_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)?.as_str()
}

/// Numbers or numeric strings, integer or floating.
fn number_field(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

fn float_field(obj: &Map<String, Value>, key: &str) -> Option<f32> {
    number_field(obj, key).map(|v| v as f32)
}

/// Floats round to the nearest integer; negatives are rejected.
fn int_field(obj: &Map<String, Value>, key: &str) -> Option<u32> {
    let v = number_field(obj, key)?.round();
    if v < 0.0 || v > u32::MAX as f64 {
        return None;
    }
    Some(v as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_motion_line() {
        let msg = decode_line(
            r#"{"event":"motion","left_count":2,"right_count":1,"forward_count":0,"ax":0.5,"ay":-9.7,"az":1,"gx":0.01,"gy":0,"gz":-0.2}"#,
        )
        .unwrap();
        match msg {
            DecodedMessage::Motion {
                counts,
                accel,
                gyro,
            } => {
                assert_eq!(counts.left, Some(2));
                assert_eq!(counts.right, Some(1));
                assert_eq!(counts.forward, Some(0));
                assert_eq!(accel.complete(), Some([0.5, -9.7, 1.0]));
                assert_eq!(gyro.z, Some(-0.2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_numeric_strings_coerce() {
        let a = decode_line(r#"{"event":"motion","ax":"1.5","left_count":"3"}"#).unwrap();
        let b = decode_line(r#"{"event":"motion","ax":1.5,"left_count":3}"#).unwrap();
        assert_eq!(a, b);

        let c = decode_line(r#"{"event":"motion","ax":"1.5","left_count":"3.0"}"#).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_float_counts_round() {
        let msg = decode_line(r#"{"event":"left","left_count":4.6}"#).unwrap();
        assert_eq!(
            msg,
            DecodedMessage::DirectionalEvent {
                kind: Direction::Left,
                counts: Counts {
                    left: Some(5),
                    right: None,
                    forward: None
                }
            }
        );
    }

    #[test]
    fn test_partial_motion_is_tolerated() {
        let msg = decode_line(r#"{"event":"motion","ax":"oops","extra":[1,2]}"#).unwrap();
        match msg {
            DecodedMessage::Motion { counts, accel, .. } => {
                assert_eq!(counts, Counts::default());
                assert_eq!(accel.x, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_control_shapes() {
        assert_eq!(
            decode_line(r#"{"event":"ack","cmd":"ON"}"#).unwrap(),
            DecodedMessage::Ack {
                command: "ON".into()
            }
        );
        assert_eq!(
            decode_line(r#"{"state":"GYRO_OFF"}"#).unwrap(),
            DecodedMessage::StateChange { enabled: false }
        );
        assert_eq!(
            decode_line(r#"{"gyro":"ON"}"#).unwrap(),
            DecodedMessage::StateChange { enabled: true }
        );
        assert_eq!(
            decode_line(r#"{"error":"imu fault"}"#).unwrap(),
            DecodedMessage::ErrorText("imu fault".into())
        );
        assert_eq!(
            decode_line(r#"{"imu":"ready"}"#).unwrap(),
            DecodedMessage::ImuStatus("ready".into())
        );
    }

    #[test]
    fn test_boot_takes_precedence_over_gyro() {
        assert_eq!(
            decode_line(r#"{"boot":true,"gyro":"OFF","fw":"1.4.2","who":104}"#).unwrap(),
            DecodedMessage::BootInfo {
                firmware_version: Some("1.4.2".into()),
                sensor_id: Some(0x68),
                sensor_enabled: Some(false),
            }
        );
    }

    #[test]
    fn test_unknown_shapes_are_unrecognized() {
        assert!(matches!(
            decode_line(r#"{"event":"jump"}"#).unwrap(),
            DecodedMessage::Unrecognized(_)
        ));
        assert!(matches!(
            decode_line(r#"{"temperature":21}"#).unwrap(),
            DecodedMessage::Unrecognized(_)
        ));
        assert!(matches!(
            decode_line(r#"{"state":"SLEEP"}"#).unwrap(),
            DecodedMessage::Unrecognized(_)
        ));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            decode_line("{\"event\":"),
            Err(ProtocolError::Malformed { .. })
        ));
        assert!(matches!(
            decode_line("[1,2,3]"),
            Err(ProtocolError::NotAnObject(_))
        ));
    }

    #[test]
    fn test_command_text() {
        assert_eq!(Command::On.to_string(), "ON");
        assert_eq!(Command::ResetCounts.to_string(), "RESET_COUNTS");
        assert_eq!(Command::Led(LedColor::Off).to_string(), "s");
        assert_eq!(Command::brightness(300).to_string(), "BRIGHT:255");
        assert_eq!(Command::brightness(-4).to_string(), "BRIGHT:0");
        assert_eq!(Command::rate(5).to_string(), "RATE 10");
        assert_eq!(Command::rate(500).to_string(), "RATE 200");
    }

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse(" on "), Command::On);
        assert_eq!(Command::parse("cal"), Command::Calibrate);
        assert_eq!(Command::parse("g"), Command::Led(LedColor::Green));
        assert_eq!(Command::parse("BRIGHT:64"), Command::Brightness(64));
        assert_eq!(Command::parse("RATE 250"), Command::Rate(200));
        assert_eq!(Command::parse("PING"), Command::Raw("PING".into()));
    }

    #[test]
    fn test_uuids_match_nus_profile() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
        );
        assert_eq!(
            CCCD_UUID.to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
    }
}
