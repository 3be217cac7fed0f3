//! Error types shared across the link, protocol and classifier layers.

use thiserror::Error;

/// Reasons a peripheral link ends up in the `Failed` state.
///
/// These never cross the public boundary as `Err` values: the connection
/// manager stores them in [`crate::domain::models::ConnectionState::Failed`]
/// and waits for the caller to retry with a fresh `connect()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Bluetooth not supported")]
    RadioUnavailable,

    #[error("Bluetooth disabled")]
    RadioDisabled,

    #[error("Device not found")]
    ScanTimeout,

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Disconnected: {0}")]
    TransportDisconnected(String),

    #[error("Service discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("NUS service not found")]
    ServiceNotFound,

    #[error("NUS characteristics not found")]
    CharacteristicNotFound,

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

impl LinkError {
    /// The peripheral answered but does not speak our profile.
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(self, Self::ServiceNotFound | Self::CharacteristicNotFound)
    }
}

/// Failures reported by a [`crate::infrastructure::bluetooth::transport::BleTransport`]
/// when an operation cannot even be started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("{0}")]
    Platform(String),
}

/// Per-line decode failures. Non-fatal: framing continues with the next line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed line '{line}': {reason}")]
    Malformed { line: String, reason: String },

    #[error("line is not a JSON object: '{0}'")]
    NotAnObject(String),

    #[error("unterminated line exceeded {limit} bytes, {dropped} bytes discarded")]
    LineTooLong { limit: usize, dropped: usize },
}

/// Activity classifier failures, reported per call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifierError {
    #[error("invalid sensor sample: x={x}, y={y}, z={z}")]
    InvalidSample { x: f32, y: f32, z: f32 },

    #[error("activity model not loaded")]
    ModelUnavailable,

    #[error("classification error: {0}")]
    Inference(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons_render_for_display() {
        assert_eq!(LinkError::ScanTimeout.to_string(), "Device not found");
        assert_eq!(LinkError::RadioDisabled.to_string(), "Bluetooth disabled");
        assert_eq!(
            LinkError::TransportDisconnected("133".into()).to_string(),
            "Disconnected: 133"
        );
    }

    #[test]
    fn test_protocol_mismatch_grouping() {
        assert!(LinkError::ServiceNotFound.is_protocol_mismatch());
        assert!(LinkError::CharacteristicNotFound.is_protocol_mismatch());
        assert!(!LinkError::ScanTimeout.is_protocol_mismatch());
    }
}
