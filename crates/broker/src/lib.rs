//! Agora broker core.
//!
//! A coordination broker for multi-agent collaborative workspaces: a hybrid
//! of a Redis-backed real-time plane (locks, presence, streams) and a
//! Kafka-backed append-only audit plane, unified behind the
//! [`bridge::CoordinationBridge`], with an in-process fallback lock manager
//! and a health/reconnect supervisor keeping the broker serving through
//! backend outages.

#![warn(missing_docs)]

pub mod audit;
pub mod bridge;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod fallback;
pub mod health;
pub mod lock;
pub mod realtime;
pub mod store;

pub use agora_proto as proto;
pub use bridge::{CoordinationBridge, OperationKind, WorkspaceOperation};
pub use config::{BrokerConfig, ConfigError};
pub use error::{BrokerError, Result};
pub use events::{BrokerEvent, EventBus};
