//! In-process doubles for both planes, plus bridge assembly helpers.
//!
//! The doubles go through the same decision functions as the production
//! stores, so the bridge tests exercise the real protocol while staying
//! hermetic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agora_proto::{
	AgentId, AgentRecord, AgentStatus, Backend, ConflictResolution, ConsensusDecision,
	Coordination, Envelope, FileEdit, LockEvent, LockEventKind, LockHolder, LockId, LockRecord,
	LockType, MessageKind, Metadata, VoteCast, Waiter, WorkspaceId, WorkspaceSnapshot, now_ms,
};
use async_trait::async_trait;

use crate::config::BrokerConfig;
use crate::consensus;
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, EventBus};
use crate::lock::{self, AcquireDecision, ParsedLockId};
use crate::store::{AuditStore, Connectable, OpScope, RealtimeStore};

type Key = (WorkspaceId, String);

/// In-memory stand-in for the Redis coordinator.
///
/// Shares the lock decision logic with production and emits the same
/// `lock_retry` signal on release.
#[derive(Default)]
pub struct MemoryRealtime {
	bus: Option<EventBus>,
	seq: AtomicU64,
	pub fail_all: AtomicBool,
	locks: Mutex<HashMap<Key, LockRecord>>,
	waiters: Mutex<HashMap<Key, VecDeque<Waiter>>>,
	agents: Mutex<HashMap<AgentId, AgentRecord>>,
	pub published: Mutex<Vec<(String, Envelope)>>,
}

impl MemoryRealtime {
	pub fn new(bus: EventBus) -> Arc<Self> {
		Arc::new(Self {
			bus: Some(bus),
			..Self::default()
		})
	}

	fn check_up(&self) -> Result<()> {
		if self.fail_all.load(Ordering::SeqCst) {
			Err(BrokerError::NotConnected {
				backend: Backend::Redis,
			})
		} else {
			Ok(())
		}
	}

	fn envelope(&self, kind: MessageKind, scope: &OpScope) -> Envelope {
		let mut metadata = Metadata::new(scope.agent.clone(), scope.workspace.clone());
		metadata.session_id = Some(scope.session_id.clone());
		metadata.sequence_number = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
		Envelope::new(kind, scope.agent.clone(), metadata)
	}

	fn record_publish(&self, stream: &str, envelope: Envelope) {
		self.published
			.lock()
			.unwrap()
			.push((stream.to_string(), envelope));
	}

	pub fn published_on(&self, stream: &str) -> Vec<Envelope> {
		self.published
			.lock()
			.unwrap()
			.iter()
			.filter(|(s, _)| s == stream)
			.map(|(_, e)| e.clone())
			.collect()
	}

	pub fn holds_record(&self, workspace: &WorkspaceId, path: &str) -> bool {
		self.locks
			.lock()
			.unwrap()
			.contains_key(&(workspace.clone(), path.to_string()))
	}

	pub fn queued_waiters(&self, workspace: &WorkspaceId, path: &str) -> usize {
		self.waiters
			.lock()
			.unwrap()
			.get(&(workspace.clone(), path.to_string()))
			.map_or(0, VecDeque::len)
	}

	pub fn agent(&self, agent: &AgentId) -> Option<AgentRecord> {
		self.agents.lock().unwrap().get(agent).cloned()
	}

	fn publish_lock_event(
		&self,
		scope: &OpScope,
		lock_id: &LockId,
		kind: LockType,
		event: LockEventKind,
	) {
		let mut env = self.envelope(MessageKind::FileLock, scope);
		env.set_payload(&LockEvent {
			event,
			lock_id: lock_id.clone(),
			lock_type: kind,
		})
		.unwrap();
		self.record_publish("locks", env);
	}
}

#[async_trait]
impl Connectable for MemoryRealtime {
	async fn connect(&self) -> Result<()> {
		self.check_up()
	}

	async fn disconnect(&self) {}

	fn backend(&self) -> Backend {
		Backend::Redis
	}
}

#[async_trait]
impl RealtimeStore for MemoryRealtime {
	async fn register_agent(&self, record: AgentRecord) -> Result<()> {
		self.check_up()?;
		self.agents
			.lock()
			.unwrap()
			.insert(record.agent_id.clone(), record);
		Ok(())
	}

	async fn update_agent_status(
		&self,
		agent: &AgentId,
		status: AgentStatus,
		current_task: Option<String>,
	) -> Result<()> {
		self.check_up()?;
		if let Some(record) = self.agents.lock().unwrap().get_mut(agent) {
			record.status = status;
			record.current_task = current_task;
			record.last_heartbeat = now_ms();
		}
		Ok(())
	}

	async fn deregister_agent(&self, agent: &AgentId, _workspace: &WorkspaceId) -> Result<()> {
		self.check_up()?;
		self.agents.lock().unwrap().remove(agent);
		Ok(())
	}

	async fn active_agents(&self, workspace: &WorkspaceId) -> Result<Vec<AgentRecord>> {
		self.check_up()?;
		Ok(self
			.agents
			.lock()
			.unwrap()
			.values()
			.filter(|record| record.workspace_id == *workspace)
			.cloned()
			.collect())
	}

	async fn request_file_lock(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
	) -> Result<Option<LockId>> {
		self.check_up()?;
		let key = (workspace.clone(), path.to_string());
		let scope = OpScope::new(agent.clone(), workspace.clone(), "");

		let queued_writer_at_head = kind == LockType::Read
			&& self
				.waiters
				.lock()
				.unwrap()
				.get(&key)
				.and_then(VecDeque::front)
				.is_some_and(|waiter| waiter.lock_type.is_exclusive());

		let mut locks = self.locks.lock().unwrap();
		match lock::decide_acquire(locks.get(&key), kind, now_ms(), queued_writer_at_head) {
			AcquireDecision::Install => {
				let record = lock::build_record(workspace, path, kind, agent, now_ms(), 30_000);
				let lock_id = record.lock_id.clone();
				locks.insert(key, record);
				drop(locks);
				self.publish_lock_event(&scope, &lock_id, kind, LockEventKind::LockAcquired);
				Ok(Some(lock_id))
			}
			AcquireDecision::JoinReaders => {
				if let Some(record) = locks.get_mut(&key)
					&& let LockHolder::Readers { readers } = &mut record.holder
					&& !readers.contains(agent)
				{
					readers.push(agent.clone());
				}
				drop(locks);
				let lock_id = lock::reader_lock_id(workspace, path, agent);
				self.publish_lock_event(&scope, &lock_id, kind, LockEventKind::LockAcquired);
				Ok(Some(lock_id))
			}
			AcquireDecision::Conflict => {
				drop(locks);
				self.waiters
					.lock()
					.unwrap()
					.entry((workspace.clone(), path.to_string()))
					.or_default()
					.push_back(Waiter {
						agent_id: agent.clone(),
						lock_type: kind,
						enqueued_at: now_ms(),
					});
				Ok(None)
			}
		}
	}

	async fn release_file_lock(&self, lock_id: &LockId, agent: &AgentId) -> Result<bool> {
		self.check_up()?;
		let Some(parsed) = lock::parse_lock_id(lock_id) else {
			return Ok(false);
		};

		let (workspace, path, kind, released) = {
			let mut locks = self.locks.lock().unwrap();
			match parsed {
				ParsedLockId::Reader { workspace, path, agent: slot } => {
					let key = (workspace.clone(), path.clone());
					let mut released = false;
					let mut emptied = false;
					if slot == *agent
						&& let Some(record) = locks.get_mut(&key)
						&& let LockHolder::Readers { readers } = &mut record.holder
					{
						let before = readers.len();
						readers.retain(|r| r != agent);
						released = readers.len() < before;
						emptied = released && readers.is_empty();
					}
					if emptied {
						locks.remove(&key);
					}
					(workspace, path, LockType::Read, released)
				}
				ParsedLockId::Holder { workspace, path, kind } => {
					let key = (workspace.clone(), path.clone());
					let held = matches!(
						locks.get(&key).map(|r| &r.holder),
						Some(LockHolder::Exclusive { agent_id }) if agent_id == agent
					);
					if held {
						locks.remove(&key);
					}
					(workspace, path, kind, held)
				}
			}
		};

		if released {
			let scope = OpScope::new(agent.clone(), workspace.clone(), "");
			self.publish_lock_event(&scope, lock_id, kind, LockEventKind::LockReleased);

			let woken = self
				.waiters
				.lock()
				.unwrap()
				.get_mut(&(workspace.clone(), path.clone()))
				.and_then(VecDeque::pop_front);
			if let (Some(waiter), Some(bus)) = (woken, &self.bus) {
				bus.emit(BrokerEvent::LockRetry {
					workspace_id: workspace,
					file_path: path,
					waiter,
				});
			}
		}
		Ok(released)
	}

	async fn publish_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()> {
		self.check_up()?;
		let mut env = self.envelope(MessageKind::FileEdit, scope);
		env.metadata.file_path = Some(edit.file_path.clone());
		env.set_payload(&edit).unwrap();
		self.record_publish("edits", env);
		Ok(())
	}

	async fn publish_consensus_vote(&self, scope: &OpScope, vote: VoteCast) -> Result<()> {
		self.check_up()?;
		let mut env = self.envelope(MessageKind::ConsensusVote, scope);
		env.metadata.correlation_id = Some(consensus::correlation_id(&vote.proposal_id));
		env.metadata.consensus_round = Some(consensus::round_of(&vote.proposal_id));
		env.set_payload(&vote).unwrap();
		self.record_publish("consensus", env);
		Ok(())
	}

	async fn publish_workspace_event(
		&self,
		scope: &OpScope,
		payload: serde_json::Map<String, serde_json::Value>,
	) -> Result<()> {
		self.check_up()?;
		let mut env = self.envelope(MessageKind::WorkspaceEvent, scope);
		env.payload = payload;
		self.record_publish("workspace", env);
		Ok(())
	}
}

/// One recorded audit append.
#[derive(Debug, Clone)]
pub struct AuditEntry {
	pub topic: &'static str,
	pub scope: OpScope,
	pub payload: serde_json::Value,
}

/// In-memory stand-in for the Kafka audit trail.
#[derive(Default)]
pub struct MemoryAudit {
	bus: Option<EventBus>,
	pub fail_all: AtomicBool,
	pub entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAudit {
	pub fn new(bus: EventBus) -> Arc<Self> {
		Arc::new(Self {
			bus: Some(bus),
			..Self::default()
		})
	}

	fn append<T: serde::Serialize>(
		&self,
		topic: &'static str,
		scope: &OpScope,
		payload: &T,
	) -> Result<()> {
		if self.fail_all.load(Ordering::SeqCst) {
			// The production orchestrator reports send failures on the bus.
			if let Some(bus) = &self.bus {
				bus.emit(BrokerEvent::BackendError {
					backend: Backend::Kafka,
					message: "injected outage".to_string(),
				});
			}
			return Err(BrokerError::NotConnected {
				backend: Backend::Kafka,
			});
		}
		self.entries.lock().unwrap().push(AuditEntry {
			topic,
			scope: scope.clone(),
			payload: serde_json::to_value(payload)?,
		});
		Ok(())
	}

	pub fn entries_on(&self, topic: &str) -> Vec<AuditEntry> {
		self.entries
			.lock()
			.unwrap()
			.iter()
			.filter(|entry| entry.topic == topic)
			.cloned()
			.collect()
	}
}

#[async_trait]
impl Connectable for MemoryAudit {
	async fn connect(&self) -> Result<()> {
		Ok(())
	}

	async fn disconnect(&self) {}

	fn backend(&self) -> Backend {
		Backend::Kafka
	}
}

#[async_trait]
impl AuditStore for MemoryAudit {
	async fn log_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()> {
		self.append(crate::audit::topics::EDIT_HISTORY, scope, &edit)
	}

	async fn save_workspace_snapshot(
		&self,
		scope: &OpScope,
		snapshot: WorkspaceSnapshot,
	) -> Result<()> {
		self.append(crate::audit::topics::WORKSPACE_SNAPSHOTS, scope, &snapshot)
	}

	async fn log_consensus_decision(
		&self,
		scope: &OpScope,
		decision: ConsensusDecision,
	) -> Result<()> {
		self.append(crate::audit::topics::CONSENSUS_DECISIONS, scope, &decision)
	}

	async fn log_agent_coordination(
		&self,
		scope: &OpScope,
		coordination: Coordination,
	) -> Result<()> {
		self.append(crate::audit::topics::AGENT_COORDINATION, scope, &coordination)
	}

	async fn log_conflict_resolution(
		&self,
		scope: &OpScope,
		conflict: ConflictResolution,
	) -> Result<()> {
		self.append(crate::audit::topics::CONFLICT_RESOLUTION, scope, &conflict)
	}

	async fn start_session(&self, scope: &OpScope) -> Result<()> {
		self.append(
			crate::audit::topics::SESSION_MANAGEMENT,
			scope,
			&serde_json::json!({ "eventType": "session_start" }),
		)
	}

	async fn end_session(&self, scope: &OpScope) -> Result<()> {
		self.append(
			crate::audit::topics::SESSION_MANAGEMENT,
			scope,
			&serde_json::json!({ "eventType": "session_end" }),
		)
	}
}

/// A bridge over fresh doubles, with both backends marked connected.
pub struct Harness {
	pub bridge: Arc<crate::bridge::CoordinationBridge>,
	pub realtime: Arc<MemoryRealtime>,
	pub audit: Arc<MemoryAudit>,
	pub bus: EventBus,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_config(BrokerConfig::default())
	}

	pub fn with_config(config: BrokerConfig) -> Self {
		let bus = EventBus::default();
		let realtime = MemoryRealtime::new(bus.clone());
		let audit = MemoryAudit::new(bus.clone());
		let bridge = crate::bridge::CoordinationBridge::with_stores(
			realtime.clone(),
			audit.clone(),
			config,
			bus.clone(),
		);
		bridge.supervisor().note_connected(Backend::Redis);
		bridge.supervisor().note_connected(Backend::Kafka);
		Self {
			bridge,
			realtime,
			audit,
			bus,
		}
	}

	pub fn take_redis_down(&self) {
		self.bridge.supervisor().note_down(Backend::Redis, "test outage");
		self.realtime.fail_all.store(true, Ordering::SeqCst);
	}

	pub fn take_kafka_down(&self) {
		self.bridge.supervisor().note_down(Backend::Kafka, "test outage");
		self.audit.fail_all.store(true, Ordering::SeqCst);
	}
}

pub fn ws() -> WorkspaceId {
	"ws-1".into()
}

pub fn agent(name: &str) -> AgentId {
	name.into()
}
