//! Durable-store orchestrator: the append-only audit trail.
//!
//! Every coordination event worth keeping is composed into an envelope,
//! stamped with this producer's next sequence number, and appended to a fixed
//! Kafka topic keyed by workspace id (which preserves per-workspace order).
//! Nothing here is ever read back by the broker itself; the consumer tail
//! exists to re-emit the trail to bus subscribers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_proto::{
	Backend, ConflictResolution, ConsensusDecision, Coordination, Envelope, FileEdit,
	MessageKind, Metadata, Priority, SessionEventKind, SessionLifecycle, WorkspaceSnapshot,
};
use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;

use crate::config::DurableStoreConfig;
use crate::consensus;
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, EventBus};
use crate::store::{AuditStore, Connectable, OpScope};

/// Fixed audit topic names.
pub mod topics {
	/// Edit history entries.
	pub const EDIT_HISTORY: &str = "autogen-edit-history";
	/// Workspace snapshots.
	pub const WORKSPACE_SNAPSHOTS: &str = "autogen-workspace-snapshots";
	/// Closed consensus decisions.
	pub const CONSENSUS_DECISIONS: &str = "autogen-consensus-decisions";
	/// Agent-to-agent coordination entries.
	pub const AGENT_COORDINATION: &str = "autogen-agent-coordination";
	/// Conflicts and their resolutions.
	pub const CONFLICT_RESOLUTION: &str = "autogen-conflict-resolution";
	/// Session start/end markers.
	pub const SESSION_MANAGEMENT: &str = "autogen-session-management";
	/// Workspace create/archive notices, written by tooling above the broker.
	pub const WORKSPACE_LIFECYCLE: &str = "autogen-workspace-lifecycle";
	/// Free-form audit entries, written by tooling above the broker.
	pub const AUDIT_TRAIL: &str = "autogen-audit-trail";
	/// Free-form decision log, written by tooling above the broker.
	pub const DECISION_LOG: &str = "autogen-decision-log";

	/// Everything the consumer tail subscribes to.
	pub const ALL: [&str; 9] = [
		EDIT_HISTORY,
		WORKSPACE_SNAPSHOTS,
		CONSENSUS_DECISIONS,
		AGENT_COORDINATION,
		CONFLICT_RESOLUTION,
		SESSION_MANAGEMENT,
		WORKSPACE_LIFECYCLE,
		AUDIT_TRAIL,
		DECISION_LOG,
	];
}

/// Envelope composition, separated from transport so the audit shapes are
/// testable without a cluster.
mod compose {
	use super::*;

	fn base(kind: MessageKind, scope: &OpScope, seq: u64) -> Envelope {
		let mut metadata = Metadata::new(scope.agent.clone(), scope.workspace.clone());
		metadata.session_id = Some(scope.session_id.clone());
		metadata.sequence_number = seq;
		Envelope::new(kind, scope.agent.clone(), metadata)
	}

	pub fn edit_history(scope: &OpScope, seq: u64, edit: &FileEdit) -> Result<Envelope> {
		let mut env = base(MessageKind::EditHistory, scope, seq);
		env.metadata.file_path = Some(edit.file_path.clone());
		env.set_payload(edit)?;
		Ok(env)
	}

	pub fn snapshot(scope: &OpScope, seq: u64, snap: &WorkspaceSnapshot) -> Result<Envelope> {
		let mut env = base(MessageKind::WorkspaceSnapshot, scope, seq);
		env.priority = Priority::Low;
		env.set_payload(snap)?;
		Ok(env)
	}

	pub fn consensus_decision(
		scope: &OpScope,
		seq: u64,
		decision: &ConsensusDecision,
	) -> Result<Envelope> {
		let mut env = base(MessageKind::ConsensusDecision, scope, seq);
		env.metadata.correlation_id = Some(consensus::correlation_id(&decision.proposal_id));
		env.metadata.consensus_round = Some(consensus::round_of(&decision.proposal_id));
		env.set_payload(decision)?;
		Ok(env)
	}

	pub fn coordination(scope: &OpScope, seq: u64, entry: &Coordination) -> Result<Envelope> {
		let mut env = base(MessageKind::AgentCoordination, scope, seq);
		env.target = entry.target.clone();
		env.priority = entry.priority;
		env.metadata.requires_response = Some(entry.kind.requires_response());
		env.set_payload(entry)?;
		Ok(env)
	}

	pub fn conflict(scope: &OpScope, seq: u64, entry: &ConflictResolution) -> Result<Envelope> {
		let mut env = base(MessageKind::ConflictResolution, scope, seq);
		env.priority = Priority::High;
		env.metadata.correlation_id = Some(entry.conflict_id.clone());
		env.set_payload(entry)?;
		Ok(env)
	}

	pub fn session_marker(
		scope: &OpScope,
		seq: u64,
		event: SessionEventKind,
	) -> Result<Envelope> {
		// Session lifecycle rides the snapshot kind, discriminated by the
		// eventType payload field.
		let mut env = base(MessageKind::WorkspaceSnapshot, scope, seq);
		env.metadata.correlation_id = Some(scope.session_id.clone());
		env.set_payload(&SessionLifecycle {
			event,
			session_id: scope.session_id.clone(),
		})?;
		Ok(env)
	}
}

/// Kafka-backed audit producer and consumer tail.
pub struct KafkaAuditTrail {
	config: DurableStoreConfig,
	bus: EventBus,
	producer: Mutex<Option<FutureProducer>>,
	seq: AtomicU64,
}

impl KafkaAuditTrail {
	/// Create an unconnected audit trail.
	#[must_use]
	pub fn new(config: DurableStoreConfig, bus: EventBus) -> Arc<Self> {
		Arc::new(Self {
			config,
			bus,
			producer: Mutex::new(None),
			seq: AtomicU64::new(0),
		})
	}

	/// Next per-producer sequence number; strictly monotonic across topics.
	fn next_seq(&self) -> u64 {
		self.seq.fetch_add(1, Ordering::Relaxed) + 1
	}

	fn common_client_config(&self) -> ClientConfig {
		let mut cfg = ClientConfig::new();
		cfg.set("bootstrap.servers", self.config.brokers.join(","))
			.set("client.id", &self.config.client_id);

		let protocol = match (self.config.ssl, &self.config.auth) {
			(true, Some(_)) => "SASL_SSL",
			(false, Some(_)) => "SASL_PLAINTEXT",
			(true, None) => "SSL",
			(false, None) => "PLAINTEXT",
		};
		cfg.set("security.protocol", protocol);

		if let Some(auth) = &self.config.auth {
			cfg.set("sasl.mechanisms", auth.mechanism.as_str())
				.set("sasl.username", &auth.user)
				.set("sasl.password", &auth.pass);
		}
		cfg
	}

	fn producer_config(&self) -> ClientConfig {
		let mut cfg = self.common_client_config();
		cfg.set("retries", self.config.retry.retries.to_string())
			.set("retry.backoff.ms", self.config.retry.initial_ms.to_string())
			.set("retry.backoff.max.ms", self.config.retry.max_ms.to_string())
			.set("linger.ms", self.config.batch.linger_ms.to_string())
			.set("batch.num.messages", self.config.batch.size.to_string());
		cfg
	}

	fn consumer_config(&self) -> ClientConfig {
		let mut cfg = self.common_client_config();
		cfg.set("group.id", &self.config.group_id)
			.set("session.timeout.ms", self.config.session_timeout_ms.to_string())
			.set("heartbeat.interval.ms", self.config.heartbeat_interval_ms.to_string())
			.set("enable.auto.commit", "false")
			.set("auto.offset.reset", "earliest")
			.set("allow.auto.create.topics", "true");
		cfg
	}

	/// Append one envelope to a topic, keyed by its workspace id.
	async fn append(&self, topic: &'static str, envelope: Envelope) -> Result<()> {
		let producer = {
			let guard = self.producer.lock().unwrap();
			guard.clone()
		};
		let Some(producer) = producer else {
			return Err(BrokerError::NotConnected {
				backend: Backend::Kafka,
			});
		};

		let payload = serde_json::to_string(&envelope)?;
		let key = envelope.metadata.workspace_id.to_string();
		let mut headers = OwnedHeaders::new()
			.insert(Header {
				key: "messageType",
				value: Some(envelope.kind.as_str()),
			})
			.insert(Header {
				key: "agentId",
				value: Some(envelope.metadata.agent_id.as_str()),
			});
		if let Some(correlation) = &envelope.metadata.correlation_id {
			headers = headers.insert(Header {
				key: "correlationId",
				value: Some(correlation.as_str()),
			});
		}

		let record = FutureRecord::to(topic)
			.key(&key)
			.payload(&payload)
			.headers(headers);
		let queue_timeout = Timeout::After(Duration::from_millis(self.config.retry.max_ms));

		match producer.send(record, queue_timeout).await {
			Ok(_) => {
				tracing::debug!(
					topic,
					seq = envelope.metadata.sequence_number,
					id = %envelope.id,
					"audit entry appended"
				);
				Ok(())
			}
			Err((error, _lost)) => {
				tracing::warn!(topic, %error, "audit append failed");
				self.bus.emit(BrokerEvent::BackendError {
					backend: Backend::Kafka,
					message: error.to_string(),
				});
				Err(error.into())
			}
		}
	}

	/// Start the consumer tail over every audit topic.
	///
	/// Each message is parsed back into an envelope and re-emitted on the
	/// bus; the offset is committed only after the emit, and a message that
	/// fails to parse is reported, committed, and dropped without taking the
	/// loop down.
	pub fn spawn_consumer(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
		let consumer: StreamConsumer = self.consumer_config().create()?;
		consumer.subscribe(&topics::ALL)?;

		let trail = self.clone();
		tokio::spawn(async move {
			loop {
				let received = tokio::select! {
					() = shutdown.cancelled() => return,
					received = consumer.recv() => received,
				};

				match received {
					Ok(message) => {
						let topic = message.topic().to_string();
						let payload = message.payload().unwrap_or_default();
						match serde_json::from_slice::<Envelope>(payload) {
							Ok(envelope) => {
								trail.bus.emit(BrokerEvent::TopicMessage {
									topic,
									envelope,
								});
							}
							Err(error) => {
								tracing::warn!(%topic, %error, "dropping unparseable audit entry");
							}
						}
						if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
							tracing::warn!(%error, "audit commit failed");
						}
					}
					Err(error) => {
						trail.bus.emit(BrokerEvent::BackendError {
							backend: Backend::Kafka,
							message: error.to_string(),
						});
						tokio::time::sleep(Duration::from_secs(1)).await;
					}
				}
			}
		});
		Ok(())
	}
}

impl std::fmt::Debug for KafkaAuditTrail {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("KafkaAuditTrail")
			.field("client_id", &self.config.client_id)
			.field("seq", &self.seq)
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl Connectable for KafkaAuditTrail {
	async fn connect(&self) -> Result<()> {
		{
			let guard = self.producer.lock().unwrap();
			if guard.is_some() {
				return Ok(());
			}
		}

		let producer: FutureProducer = self.producer_config().create()?;
		{
			let mut guard = self.producer.lock().unwrap();
			*guard = Some(producer);
		}
		tracing::info!(brokers = ?self.config.brokers, "kafka producer ready");
		self.bus.emit(BrokerEvent::BackendConnected {
			backend: Backend::Kafka,
		});
		Ok(())
	}

	async fn disconnect(&self) {
		let had = {
			let mut guard = self.producer.lock().unwrap();
			guard.take().is_some()
		};
		if had {
			self.bus.emit(BrokerEvent::BackendDisconnected {
				backend: Backend::Kafka,
			});
		}
	}

	fn backend(&self) -> Backend {
		Backend::Kafka
	}
}

#[async_trait]
impl AuditStore for KafkaAuditTrail {
	async fn log_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()> {
		let env = compose::edit_history(scope, self.next_seq(), &edit)?;
		self.append(topics::EDIT_HISTORY, env).await
	}

	async fn save_workspace_snapshot(
		&self,
		scope: &OpScope,
		snapshot: WorkspaceSnapshot,
	) -> Result<()> {
		let env = compose::snapshot(scope, self.next_seq(), &snapshot)?;
		self.append(topics::WORKSPACE_SNAPSHOTS, env).await
	}

	async fn log_consensus_decision(
		&self,
		scope: &OpScope,
		decision: ConsensusDecision,
	) -> Result<()> {
		let env = compose::consensus_decision(scope, self.next_seq(), &decision)?;
		self.append(topics::CONSENSUS_DECISIONS, env).await
	}

	async fn log_agent_coordination(
		&self,
		scope: &OpScope,
		coordination: Coordination,
	) -> Result<()> {
		let env = compose::coordination(scope, self.next_seq(), &coordination)?;
		self.append(topics::AGENT_COORDINATION, env).await
	}

	async fn log_conflict_resolution(
		&self,
		scope: &OpScope,
		conflict: ConflictResolution,
	) -> Result<()> {
		let env = compose::conflict(scope, self.next_seq(), &conflict)?;
		self.append(topics::CONFLICT_RESOLUTION, env).await
	}

	async fn start_session(&self, scope: &OpScope) -> Result<()> {
		let env = compose::session_marker(scope, self.next_seq(), SessionEventKind::SessionStart)?;
		self.append(topics::SESSION_MANAGEMENT, env).await
	}

	async fn end_session(&self, scope: &OpScope) -> Result<()> {
		let env = compose::session_marker(scope, self.next_seq(), SessionEventKind::SessionEnd)?;
		self.append(topics::SESSION_MANAGEMENT, env).await
	}
}
