//! Shared wire types for the agora coordination broker.
//!
//! This crate defines the message envelope, the coordination event taxonomy,
//! and the records the broker keeps in its backing stores. Everything here is
//! plain serde data: both the Redis-backed real-time plane and the
//! Kafka-backed audit plane carry these shapes as JSON, and dashboard or
//! agent-adapter processes deserialize them without linking the broker.

#![warn(missing_docs)]

pub mod payload;
pub mod types;

pub use payload::*;
pub use types::*;
