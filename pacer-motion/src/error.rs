//! Motion error types.

use crate::axis::Axis;
use pacer_client::ClientError;
use pacer_core::CoreError;
use thiserror::Error;

/// Motion planning errors.
#[derive(Debug, Error)]
pub enum MotionError {
    #[error("controller error: {0}")]
    Client(#[from] ClientError),

    #[error("slot encoding error: {0}")]
    Encode(#[from] CoreError),

    #[error("unknown axis '{0}'")]
    UnknownAxis(char),

    #[error("axis {0} is not configured")]
    NotConfigured(Axis),

    #[error("axis {0} has no homing switch")]
    NoHomingSwitch(Axis),

    #[error("no controller with index {0}")]
    NoController(usize),

    #[error("homing axis {0} timed out")]
    HomingTimeout(Axis),

    #[error("invalid move: {0}")]
    InvalidMove(&'static str),
}

impl MotionError {
    /// Returns whether the controller reported a stop.
    pub fn is_stopped(&self) -> bool {
        matches!(self, MotionError::Client(ClientError::Stopped(_)))
    }
}
