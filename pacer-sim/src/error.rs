//! Simulator error types.

use pacer_protocol::{DeviceType, ErrorCode, QueueErrorCode, QueueStatus};
use thiserror::Error;

/// Simulator errors.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] pacer_protocol::ProtocolError),

    #[error("unknown order 0x{0:02x}")]
    UnknownOrder(u8),

    #[error("bad parameter format: {0}")]
    BadParameterFormat(&'static str),

    #[error("bad parameter value: {0}")]
    BadParameterValue(&'static str),

    #[error("invalid device type 0x{0:02x}")]
    InvalidDeviceType(u8),

    #[error("no {device} numbered {number}")]
    InvalidDeviceNumber { device: DeviceType, number: u8 },

    #[error("queue rejected block {accepted}: {code:?}")]
    QueueRejected {
        code: QueueErrorCode,
        accepted: u16,
        status: QueueStatus,
    },
}

impl SimError {
    /// Converts to the application error sub-code sent to the host.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            SimError::Io(_) => ErrorCode::Failed,
            SimError::Protocol(_) => ErrorCode::BadParameterFormat,
            SimError::UnknownOrder(_) => ErrorCode::UnknownOrder,
            SimError::BadParameterFormat(_) => ErrorCode::BadParameterFormat,
            SimError::BadParameterValue(_) => ErrorCode::BadParameterValue,
            SimError::InvalidDeviceType(_) => ErrorCode::InvalidDeviceType,
            SimError::InvalidDeviceNumber { .. } => ErrorCode::InvalidDeviceNumber,
            SimError::QueueRejected { .. } => ErrorCode::Failed,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            SimError::QueueRejected { code, .. } => *code == QueueErrorCode::QueueFull,
            other => other.error_code().is_retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SimError::UnknownOrder(0x42).error_code(), ErrorCode::UnknownOrder);
        assert_eq!(
            SimError::InvalidDeviceNumber {
                device: DeviceType::Heater,
                number: 9
            }
            .error_code(),
            ErrorCode::InvalidDeviceNumber
        );
        assert_eq!(
            SimError::InvalidDeviceNumber {
                device: DeviceType::Heater,
                number: 9
            }
            .to_string(),
            "no heater numbered 9"
        );
    }

    #[test]
    fn test_queue_full_is_retryable() {
        let err = SimError::QueueRejected {
            code: QueueErrorCode::QueueFull,
            accepted: 3,
            status: QueueStatus::default(),
        };
        assert!(err.is_retryable());
        assert!(!SimError::BadParameterValue("state").is_retryable());
    }
}
