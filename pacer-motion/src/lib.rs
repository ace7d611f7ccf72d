//! # pacer-motion
//!
//! Host-side motion planning for pacer controllers.
//!
//! This crate provides:
//! - YAML machine configuration mapping axes to controller steppers and switches
//! - Millimetre to step conversion with per-motor fractional carry
//! - Acceleration ceilings per axis combination and cornering end speeds
//! - Splitting of long moves into ordered per-controller slots
//! - Homing against minimum switches with a timeout

pub mod axis;
pub mod config;
pub mod error;
pub mod planner;
pub mod stepper;

pub use axis::{Axis, AxisArray, AXIS_COUNT};
pub use config::{
    AxisConfig, ConfigError, ControllerConfig, HeaterConfig, MachineConfig, MotionConfig,
    StepperMapping, SwitchConfig,
};
pub use error::MotionError;
pub use planner::{query_abilities, AccelerationCeilings, PlannedSlot, Planner, RelativeMove};
pub use stepper::{ControllerAbilities, Motor, Stepper};
