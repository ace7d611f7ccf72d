//! # pacer-protocol
//!
//! Wire protocol implementation for pacer, the host/controller link used to
//! drive stepper-motor machines.
//!
//! This crate provides:
//! - Byte-level framing with sync bytes, length prefix and CRC-8 validation
//! - A streaming decoder that resynchronizes after garbage or corruption
//! - Order, reply code and device vocabularies
//! - Error codes and protocol constants

pub mod codec;
pub mod crc;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use crc::crc8;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{Control, Direction, Frame, CLIENT_SYNC, HOST_SYNC};
pub use message::{
    DeviceType, FrameReceiptCode, InfoKind, Order, QueueErrorCode, QueueStatus, Reply, ReplyCode,
    ResumeFlags, StopCause, StopRecovery, StoppedInfo,
};

/// Protocol version implemented by this crate (major, minor).
pub const PROTOCOL_VERSION: (u8, u8) = (1, 0);

/// Default TCP port a simulated controller listens on.
pub const DEFAULT_PORT: u16 = 7410;

/// Maximum parameter bytes in one frame (the length byte caps at 255).
pub const MAX_PARAMS_LEN: usize = 253;

/// Number of distinct sequence numbers carried in the control byte.
pub const SEQUENCE_MODULUS: u8 = 16;
