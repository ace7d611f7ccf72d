//! # pacer-core
//!
//! Command queue and slot model for pacer.
//!
//! This crate provides:
//! - Tagged slot variants with a table-driven sub-block decoder
//! - Bit-packed, variable-width linear move encoding
//! - Non-fatal slot validation warnings
//! - A bounded FIFO command queue with wire-format status counters

pub mod error;
pub mod queue;
pub mod slot;

pub use error::{CoreError, SlotWarning};
pub use queue::{CommandQueue, EnqueueOutcome, DEFAULT_QUEUE_CAPACITY};
pub use slot::{BasicLinearMove, Slot, SlotType, MAX_AXES, MAX_SLOT_PAYLOAD, MAX_SLOT_STEPS};
