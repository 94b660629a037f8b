//! The broker's public event surface.
//!
//! Orchestrators own emitters, observers own receivers, and nothing holds a
//! back-pointer: the bus is a one-way broadcast channel carrying
//! [`BrokerEvent`]. Emission never blocks and never fails; an event with no
//! subscribers is simply dropped.

use agora_proto::{Backend, Envelope, OverallHealth, Waiter, WorkspaceId};
use tokio::sync::broadcast;

use crate::bridge::WorkspaceOperation;

/// Everything the broker announces to the outside world.
///
/// Dashboards and agent adapters subscribe to the bus and filter on
/// [`BrokerEvent::name`].
#[derive(Debug, Clone)]
pub enum BrokerEvent {
	/// The bridge finished starting up.
	Initialized,
	/// The bridge shut down.
	Shutdown,
	/// A bridge operation was routed; emitted after both paths ran.
	WorkspaceOperation(WorkspaceOperation),
	/// A backend connected.
	BackendConnected {
		/// Which backend.
		backend: Backend,
	},
	/// A backend disconnected.
	BackendDisconnected {
		/// Which backend.
		backend: Backend,
	},
	/// A backend operation failed.
	BackendError {
		/// Which backend.
		backend: Backend,
		/// Failure message.
		message: String,
	},
	/// The health rollup changed.
	HealthChanged {
		/// The new rollup.
		overall: OverallHealth,
	},
	/// A lock release woke one queued waiter; the waiter may now re-request.
	LockRetry {
		/// Workspace of the contended file.
		workspace_id: WorkspaceId,
		/// The contended file.
		file_path: String,
		/// The woken queue entry.
		waiter: Waiter,
	},
	/// One reconnect attempt failed; more may follow.
	ReconnectAttemptFailed {
		/// Which backend.
		backend: Backend,
		/// 1-based attempt number.
		attempt: u32,
		/// Failure message.
		message: String,
	},
	/// Reconnection gave up after the configured attempts; terminal until an
	/// external reset.
	ReconnectFailed {
		/// Which backend.
		backend: Backend,
	},
	/// An envelope arrived on a fast-store stream.
	StreamMessage {
		/// Logical stream name (without prefix).
		stream: String,
		/// The delivered envelope.
		envelope: Envelope,
	},
	/// An envelope arrived on a durable-store topic.
	TopicMessage {
		/// Topic name.
		topic: String,
		/// The delivered envelope.
		envelope: Envelope,
	},
}

impl BrokerEvent {
	/// Stable wire name of the event, used by subscribers to filter.
	#[must_use]
	pub fn name(&self) -> &'static str {
		match self {
			Self::Initialized => "initialized",
			Self::Shutdown => "shutdown",
			Self::WorkspaceOperation(_) => "workspace_operation",
			Self::BackendConnected { backend: Backend::Redis } => "redis_connected",
			Self::BackendConnected { backend: Backend::Kafka } => "kafka_connected",
			Self::BackendDisconnected { backend: Backend::Redis } => "redis_disconnected",
			Self::BackendDisconnected { backend: Backend::Kafka } => "kafka_disconnected",
			Self::BackendError { backend: Backend::Redis, .. } => "redis_error",
			Self::BackendError { backend: Backend::Kafka, .. } => "kafka_error",
			Self::HealthChanged { .. } => "health_changed",
			Self::LockRetry { .. } => "lock_retry",
			Self::ReconnectAttemptFailed { .. } => "reconnect_attempt_failed",
			Self::ReconnectFailed { .. } => "reconnect_failed",
			Self::StreamMessage { .. } => "redis_message",
			Self::TopicMessage { .. } => "kafka_message",
		}
	}
}

/// One-way broadcast bus for [`BrokerEvent`].
///
/// Cloning is cheap; every clone feeds the same subscribers. Slow subscribers
/// lag and drop the oldest events rather than applying backpressure to the
/// broker.
#[derive(Debug, Clone)]
pub struct EventBus {
	tx: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
	/// Create a bus retaining up to `capacity` undelivered events per
	/// subscriber.
	#[must_use]
	pub fn new(capacity: usize) -> Self {
		let (tx, _rx) = broadcast::channel(capacity);
		Self { tx }
	}

	/// Emit an event to all current subscribers.
	pub fn emit(&self, event: BrokerEvent) {
		tracing::trace!(event = event.name(), "emit");
		// A send error only means nobody is subscribed right now.
		let _ = self.tx.send(event);
	}

	/// Subscribe to all events from this point on.
	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
		self.tx.subscribe()
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new(256)
	}
}
