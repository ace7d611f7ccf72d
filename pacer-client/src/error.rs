//! Client error types.

use pacer_protocol::{ErrorCode, Order, QueueErrorCode, QueueStatus, StoppedInfo};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] pacer_protocol::ProtocolError),

    #[error("slot error: {0}")]
    Slot(#[from] pacer_core::CoreError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("link faulted after {attempts} attempts")]
    Faulted { attempts: u32 },

    #[error("{order} failed: {code}")]
    Application { order: Order, code: ErrorCode },

    #[error("controller {0}")]
    Stopped(StoppedInfo),

    #[error("queue rejected block {accepted}: {code:?}")]
    QueueRejected {
        code: QueueErrorCode,
        accepted: u16,
        status: QueueStatus,
    },

    #[error("{order} failed with order-specific error {params:02x?}")]
    OrderSpecific { order: Order, params: Vec<u8> },

    #[error("unexpected reply: {0}")]
    UnexpectedReply(&'static str),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Application { code, .. } => code.is_retryable(),
            ClientError::QueueRejected { code, .. } => *code == QueueErrorCode::QueueFull,
            _ => false,
        }
    }

    /// Returns whether the link can no longer be used.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::NotConnected
                | ClientError::ConnectionClosed
                | ClientError::Faulted { .. }
        )
    }
}
