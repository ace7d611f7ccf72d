//! Protocol error types and application error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid sync byte: expected {expected:#04x}, got {actual:#04x}")]
    InvalidSync { expected: u8, actual: u8 },

    #[error("lost sync after a valid frame, discarded {discarded} bytes")]
    SyncLost { discarded: usize },

    #[error("invalid frame length: {0}")]
    InvalidLength(u8),

    #[error("CRC mismatch: expected {expected:#04x}, got {actual:#04x}")]
    CrcMismatch {
        /// Control byte of the damaged frame, so the receiver can echo it.
        control: u8,
        expected: u8,
        actual: u8,
    },

    #[error("parameters too large: {size} bytes (max {max})")]
    ParamsTooLarge { size: usize, max: usize },

    #[error("unknown order code: {0:#04x}")]
    UnknownOrder(u8),

    #[error("unknown reply code: {0:#04x}")]
    UnknownReplyCode(u8),

    #[error("unknown device type: {0:#04x}")]
    UnknownDeviceType(u8),

    #[error("malformed reply payload: {0}")]
    MalformedPayload(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the receiver can recover by discarding and resyncing.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidSync { .. }
                | ProtocolError::SyncLost { .. }
                | ProtocolError::InvalidLength(_)
                | ProtocolError::CrcMismatch { .. }
        )
    }
}

/// Application error sub-codes carried by an `ApplicationError` reply.
///
/// These codes are part of the wire contract and must remain stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    UnknownOrder = 0x01,
    BadParameterFormat = 0x02,
    BadParameterValue = 0x03,
    InvalidDeviceType = 0x04,
    InvalidDeviceNumber = 0x05,
    IncorrectMode = 0x06,
    Busy = 0x07,
    Failed = 0x08,
}

impl ErrorCode {
    /// Returns whether a later identical request might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::Busy)
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ErrorCode::UnknownOrder),
            0x02 => Ok(ErrorCode::BadParameterFormat),
            0x03 => Ok(ErrorCode::BadParameterValue),
            0x04 => Ok(ErrorCode::InvalidDeviceType),
            0x05 => Ok(ErrorCode::InvalidDeviceNumber),
            0x06 => Ok(ErrorCode::IncorrectMode),
            0x07 => Ok(ErrorCode::Busy),
            0x08 => Ok(ErrorCode::Failed),
            _ => Err(ProtocolError::MalformedPayload("unknown application error code")),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::UnknownOrder => write!(f, "UNKNOWN_ORDER"),
            ErrorCode::BadParameterFormat => write!(f, "BAD_PARAMETER_FORMAT"),
            ErrorCode::BadParameterValue => write!(f, "BAD_PARAMETER_VALUE"),
            ErrorCode::InvalidDeviceType => write!(f, "INVALID_DEVICE_TYPE"),
            ErrorCode::InvalidDeviceNumber => write!(f, "INVALID_DEVICE_NUMBER"),
            ErrorCode::IncorrectMode => write!(f, "INCORRECT_MODE"),
            ErrorCode::Busy => write!(f, "BUSY"),
            ErrorCode::Failed => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::Busy.is_retryable());

        assert!(!ErrorCode::UnknownOrder.is_retryable());
        assert!(!ErrorCode::BadParameterValue.is_retryable());
        assert!(!ErrorCode::InvalidDeviceNumber.is_retryable());
        assert!(!ErrorCode::IncorrectMode.is_retryable());
    }

    #[test]
    fn test_error_code_wire_values() {
        for code in [
            ErrorCode::UnknownOrder,
            ErrorCode::BadParameterFormat,
            ErrorCode::BadParameterValue,
            ErrorCode::InvalidDeviceType,
            ErrorCode::InvalidDeviceNumber,
            ErrorCode::IncorrectMode,
            ErrorCode::Busy,
            ErrorCode::Failed,
        ] {
            assert_eq!(ErrorCode::try_from(code as u8).unwrap(), code);
        }
        assert!(ErrorCode::try_from(0x00).is_err());
        assert!(ErrorCode::try_from(0x42).is_err());
    }

    #[test]
    fn test_error_code_display() {
        assert_eq!(format!("{}", ErrorCode::UnknownOrder), "UNKNOWN_ORDER");
        assert_eq!(
            format!("{}", ErrorCode::InvalidDeviceType),
            "INVALID_DEVICE_TYPE"
        );
        assert_eq!(format!("{}", ErrorCode::IncorrectMode), "INCORRECT_MODE");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidSync {
            expected: 0x23,
            actual: 0x99,
        };
        assert!(err.to_string().contains("0x99"));

        let err = ProtocolError::CrcMismatch {
            control: 0x01,
            expected: 0xAB,
            actual: 0xCD,
        };
        let msg = err.to_string();
        assert!(msg.contains("0xab") && msg.contains("0xcd"));

        let err = ProtocolError::ParamsTooLarge { size: 300, max: 253 };
        assert!(err.to_string().contains("300"));
    }

    #[test]
    fn test_framing_classification() {
        assert!(ProtocolError::SyncLost { discarded: 3 }.is_framing());
        assert!(ProtocolError::InvalidLength(1).is_framing());
        assert!(!ProtocolError::UnknownOrder(0x55).is_framing());
    }
}
