//! # pacer-sim
//!
//! Simulated pacer controller.
//!
//! This crate provides:
//! - A TCP (or any byte stream) responder speaking the pacer protocol
//! - The retry cache that makes retransmitted requests idempotent
//! - The stopped-state machine gating every order
//! - A device table with inputs, outputs, PWM, steppers, heaters and sensors
//! - A queue executor and a thermal model running in the background

pub mod config;
pub mod device;
pub mod error;
pub mod executor;
pub mod handler;
pub mod server;
pub mod session;

pub use config::{Config, ConfigError, DeviceConfig, FirmwareConfig, NetworkConfig};
pub use device::{Devices, OutputDrive};
pub use error::SimError;
pub use executor::{SlotExecutor, ThermalModel};
pub use handler::{OrderHandler, Response};
pub use server::{ServerStats, Simulator};
pub use session::ConnectionState;
