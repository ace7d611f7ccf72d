//! # pacer-client
//!
//! Host-side protocol engine for pacer.
//!
//! This crate provides:
//! - Sequenced request/reply over TCP or in-memory links
//! - Retransmission with identical bytes on timeout or damaged frames
//! - A typed API for controller orders
//! - Command queue submission with backpressure

pub mod client;
pub mod connection;
pub mod error;
pub mod stream;

pub use client::{Client, OutputState, TEMPERATURE_UNAVAILABLE};
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
pub use stream::ClientStream;
