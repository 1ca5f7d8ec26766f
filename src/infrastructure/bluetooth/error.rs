//! Bluetooth error taxonomy

use crate::domain::models::DeviceAddress;

#[derive(Debug, thiserror::Error)]
pub enum BluetoothError {
    /// Missing Bluetooth capability; abort the phase, never retry
    #[error("Bluetooth permission denied")]
    PermissionDenied,

    /// Radio switched off mid-operation; re-enable and retry
    #[error("Bluetooth radio unavailable")]
    RadioUnavailable,

    #[error("Could not connect to {address} after {attempts} attempts")]
    ConnectionFailed {
        address: DeviceAddress,
        attempts: u32,
    },

    #[error("A connection to {0} is already open")]
    Busy(DeviceAddress),

    #[error("Protocol violation: expected {expected:#04X}, got {actual:#04X}")]
    ProtocolViolation { expected: u8, actual: u8 },

    #[error("Stream closed by peer")]
    StreamClosed,

    #[error("Read timed out")]
    Timeout,

    #[error("Bluetooth I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BluetoothError {
    /// Errors that end the current protocol exchange outright
    pub fn is_stream_loss(&self) -> bool {
        matches!(self, Self::StreamClosed | Self::Timeout | Self::Io(_))
    }
}
