//! Core error types.

use pacer_protocol::QueueErrorCode;
use std::fmt;
use thiserror::Error;

/// Errors from slot encoding and the command queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("malformed slot: {0}")]
    MalformedSlot(&'static str),

    #[error("malformed block {index}: {reason}")]
    MalformedBlock { index: usize, reason: &'static str },

    #[error("command queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("axis {0} out of range")]
    AxisOutOfRange(u8),

    #[error("step count {steps} on axis {axis} exceeds the slot field")]
    StepsOutOfRange { axis: u8, steps: i64 },

    #[error("slot payload too large: {size} bytes")]
    SlotTooLarge { size: usize },
}

impl CoreError {
    /// Returns the queue sub-code reported to the host.
    pub fn queue_error_code(&self) -> QueueErrorCode {
        match self {
            CoreError::QueueFull { .. } => QueueErrorCode::QueueFull,
            _ => QueueErrorCode::MalformedBlock,
        }
    }

    /// Returns whether the same submission may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::QueueFull { .. })
    }
}

/// Out-of-range slot fields that are reported but never stop decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotWarning {
    EndSpeedExceedsNominal { nominal: u8, end: u8 },
    AccelerationExceedsSteps { primary_steps: u32, ramp_steps: u32 },
    PrimaryAxisNotSelected { axis: u8 },
}

impl fmt::Display for SlotWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotWarning::EndSpeedExceedsNominal { nominal, end } => {
                write!(f, "end speed {} exceeds nominal speed {}", end, nominal)
            }
            SlotWarning::AccelerationExceedsSteps {
                primary_steps,
                ramp_steps,
            } => write!(
                f,
                "acceleration and deceleration need {} steps but the primary axis moves {}",
                ramp_steps, primary_steps
            ),
            SlotWarning::PrimaryAxisNotSelected { axis } => {
                write!(f, "primary axis {} is not selected", axis)
            }
        }
    }
}
