//! Error types for broker operations.

use agora_proto::Backend;
use thiserror::Error;

/// Errors surfaced by the orchestrators and the bridge.
///
/// Policy violations (unauthorized release, lock contention) are not errors:
/// they come back as `false` / `None` from the operation itself. This enum
/// covers backend and codec failures only.
#[derive(Debug, Error)]
pub enum BrokerError {
	/// Fast-store command or connection failure.
	#[error("redis: {0}")]
	Redis(#[from] redis::RedisError),

	/// Durable-store produce or consume failure.
	#[error("kafka: {0}")]
	Kafka(#[from] rdkafka::error::KafkaError),

	/// Envelope (de)serialization failure.
	#[error("envelope codec: {0}")]
	Codec(#[from] serde_json::Error),

	/// Operation invoked against a backend with no live connection.
	#[error("{backend} backend is not connected")]
	NotConnected {
		/// Which backend was unavailable.
		backend: Backend,
	},
}

/// Result alias for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;
