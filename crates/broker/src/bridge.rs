//! Coordination bridge: the single public API over both planes.
//!
//! # Purpose
//!
//! - Define the one entry point agents call for locks, presence, edits, votes, and audit writes.
//! - Route every operation to the real-time plane, the audit plane, or both, per the routing matrix.
//! - Keep the broker serving whenever either backing store is unavailable, degrading instead of failing.
//! - Exclude agent text synthesis, vote judgment, and file persistence; payloads pass through opaque.
//!
//! # Mental model
//!
//! - The bridge owns no coordination state. Locks and presence live in the fast store; history lives
//!   in the audit topics; the only process-local state is the fallback lock table and the health
//!   records.
//! - Every call builds a [`WorkspaceOperation`] and emits it on the bus after routing, whether or not
//!   either path succeeded.
//! - Health is observational. The bridge consults it to pick a path but never blocks on it; a wrong
//!   guess surfaces as a tolerated backend error, not a caller failure.
//! - A failure on one path never fails the other. A failure on both is logged and surfaced as events;
//!   the caller only notices where a return value exists (`request_file_lock` may return `None`).
//! - While the fast store is down, lock traffic lands in the in-process fallback manager. Recovery
//!   does not migrate fallback locks; they are orphaned and drain as their holders release them.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`CoordinationBridge`] | Public API surface and routing | MUST hold stores only behind the trait seam | `CoordinationBridge::start`, `CoordinationBridge::with_stores` |
//! | [`WorkspaceOperation`] | One routed call, as observers see it | MUST be emitted after routing, exactly once per call | `CoordinationBridge::emit_operation` |
//! | [`OperationKind`] | Closed set of routable operations | MUST map 1:1 to public bridge methods | `CoordinationBridge::*` |
//! | `OpScope` | Caller identity for one call | MUST carry a session id, synthesized when absent | `CoordinationBridge::scope` |
//!
//! # Invariants
//!
//! 1. Lock mutual exclusion MUST hold per (workspace, path): one exclusive holder or one readers set,
//!    never both.
//!    - Enforced in: `lock::decide_acquire`, conditional store mutation in `realtime`, `fallback`
//!    - Tested by: `bridge::tests::locking`, `fallback::tests`, `lock::tests`
//!    - Failure symptom: two writers edit one file concurrently and the audit trail shows interleaved
//!      edits.
//! 2. A conflicting lock request MUST return `None` and enqueue exactly one waiter; it never blocks.
//!    - Enforced in: `RedisCoordinator::request_file_lock`
//!    - Tested by: `bridge::tests::locking::writer_blocked_by_readers_is_queued_and_retried`
//!    - Failure symptom: callers hang inside the broker instead of retrying on `lock_retry`.
//! 3. A release MUST verify the caller against the stored holder and leave the record intact on
//!    mismatch.
//!    - Enforced in: scripted compare-and-delete in `realtime`, ownership check in `fallback`
//!    - Tested by: `fallback::tests::release_by_non_holder_is_refused`
//!    - Failure symptom: any agent can free any lock and exclusion silently disappears.
//! 4. Exactly one waiter MUST be woken per successful release, in FIFO order.
//!    - Enforced in: `RedisCoordinator::wake_one_waiter`
//!    - Tested by: `bridge::tests::locking::waiters_are_woken_fifo_one_per_release`
//!    - Failure symptom: thundering-herd retries, or a queued writer starves forever.
//! 5. Durable envelopes MUST carry a strictly monotonic per-producer sequence number across all
//!    topics.
//!    - Enforced in: `KafkaAuditTrail::next_seq`
//!    - Tested by: `audit::tests::sequence_is_strictly_monotonic_across_kinds`
//!    - Failure symptom: consumers cannot detect reordering within one producer.
//! 6. A failure on one routing path MUST NOT fail the other, and no backend failure may reach the
//!    caller as an error.
//!    - Enforced in: `CoordinationBridge::*` (every durable mirror is fire-and-tolerate)
//!    - Tested by: `bridge::tests::routing::durable_outage_leaves_realtime_path_working`
//!    - Failure symptom: an audit outage takes down live coordination.
//! 7. Health rollup MUST be healthy iff both backends are connected, offline iff neither is, degraded
//!    otherwise, at every transition.
//!    - Enforced in: `HealthSupervisor::note_connected`, `HealthSupervisor::note_down`
//!    - Tested by: `health::tests::rollup_truth_table`
//!    - Failure symptom: the bridge routes to a dead store or ignores a live one.
//! 8. Reconnect attempts per backend MUST be capped, deduplicated, and linearly backed off, ending in
//!    a single terminal `reconnect_failed` until an external reset.
//!    - Enforced in: `HealthSupervisor::note_down`, `HealthSupervisor::spawn_reconnect`
//!    - Tested by: `health::tests::reconnect_caps_attempts_with_linear_backoff`
//!    - Failure symptom: reconnect storms against a dead backend, or silent permanent outage.
//!
//! # Data flow
//!
//! 1. A caller invokes a bridge method with an agent id, a workspace, and an optional session id.
//! 2. The bridge builds an `OpScope` (synthesizing the session id if needed) and consults health.
//! 3. Real-time work goes to the fast store, or to the fallback lock manager when the fast store is
//!    down (locks only; status updates and votes drop silently).
//! 4. Durable work goes to the audit plane; outages there are tolerated and reported as events.
//! 5. The bridge emits `workspace_operation`, then returns the caller's value if the operation has
//!    one.
//! 6. Independently, both consumer loops re-emit stream and topic envelopes as `redis_message` /
//!    `kafka_message` events, and a released lock pops one waiter into a `lock_retry` event.
//!
//! # Lifecycle
//!
//! - Startup: `start` builds both orchestrators, the supervisor, and the bus; spawns the consumer
//!   loops, the heartbeat, and the health stamp timer; attempts both connects (failure degrades,
//!   never aborts); emits `initialized`.
//! - Running: callers invoke operations; the supervisor watches connection events and drives capped
//!   reconnects.
//! - Shutdown: `shutdown` cancels every task, disconnects both stores, and emits `shutdown`.
//!
//! # Concurrency and ordering
//!
//! - All bridge state is behind short-lived std mutexes; no lock is held across an await.
//! - Lock acquisition suspends only for its own store round trips; contention returns `None`
//!   immediately rather than waiting.
//! - There is no ordering guarantee between the two planes for one logical event; consumers
//!   correlate with `correlation_id`.
//!
//! # Failure modes and recovery
//!
//! - Fast store down: locks degrade to the fallback manager; presence updates and votes drop
//!   silently; everything durable continues.
//! - Audit plane down: real-time coordination continues; durable mirrors drop with a warn and a
//!   `kafka_error` event.
//! - Both down: lock requests still succeed locally (memory fallback); every other operation drops
//!   with events; health reports offline.
//! - Backend recovers: the supervisor reconnects, health transitions, and routing follows on the
//!   next call.

use std::sync::Arc;

use agora_proto::{
	AgentId, AgentProfile, AgentRecord, AgentStatus, Backend, ConflictResolution,
	ConsensusDecision, Coordination, CoordinationKind, FileEdit, HealthReport, LockId, LockType,
	Priority, VoteCast, WorkspaceId, WorkspaceSnapshot, now_ms, new_envelope_id,
};
use tokio_util::sync::CancellationToken;

use crate::audit::KafkaAuditTrail;
use crate::config::{BrokerConfig, FallbackMode};
use crate::error::Result;
use crate::events::{BrokerEvent, EventBus};
use crate::fallback::FallbackLockManager;
use crate::health::HealthSupervisor;
use crate::lock;
use crate::realtime::RedisCoordinator;
use crate::store::{AuditStore, Connectable, OpScope, RealtimeStore};

/// One routed bridge call, as emitted to observers.
#[derive(Debug, Clone)]
pub struct WorkspaceOperation {
	/// Unique id of this operation.
	pub id: String,
	/// When the bridge routed it, epoch millis.
	pub timestamp: u64,
	/// Which operation ran.
	pub kind: OperationKind,
	/// Acting agent.
	pub agent_id: AgentId,
	/// Workspace the operation targeted.
	pub workspace_id: WorkspaceId,
	/// Operation-specific summary fields.
	pub data: serde_json::Map<String, serde_json::Value>,
	/// Whether the routing matrix sends this kind to the audit plane.
	pub requires_persistence: bool,
	/// Whether the routing matrix sends this kind to the real-time plane.
	pub requires_realtime: bool,
}

/// The closed set of bridge operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum OperationKind {
	RequestFileLock,
	ReleaseFileLock,
	PublishFileEdit,
	PublishWorkspaceEvent,
	RegisterAgent,
	DeregisterAgent,
	UpdateAgentStatus,
	PublishConsensusVote,
	LogConsensusDecision,
	LogAgentCoordination,
	LogConflictResolution,
	SaveWorkspaceSnapshot,
	StartSession,
	EndSession,
}

impl OperationKind {
	/// Wire name of the operation.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::RequestFileLock => "request_file_lock",
			Self::ReleaseFileLock => "release_file_lock",
			Self::PublishFileEdit => "publish_file_edit",
			Self::PublishWorkspaceEvent => "publish_workspace_event",
			Self::RegisterAgent => "register_agent",
			Self::DeregisterAgent => "deregister_agent",
			Self::UpdateAgentStatus => "update_agent_status",
			Self::PublishConsensusVote => "publish_consensus_vote",
			Self::LogConsensusDecision => "log_consensus_decision",
			Self::LogAgentCoordination => "log_agent_coordination",
			Self::LogConflictResolution => "log_conflict_resolution",
			Self::SaveWorkspaceSnapshot => "save_workspace_snapshot",
			Self::StartSession => "start_session",
			Self::EndSession => "end_session",
		}
	}

	fn paths(self) -> (bool, bool) {
		// (requires_realtime, requires_persistence)
		match self {
			Self::RequestFileLock | Self::ReleaseFileLock | Self::PublishFileEdit
			| Self::RegisterAgent | Self::DeregisterAgent => (true, true),
			Self::UpdateAgentStatus | Self::PublishConsensusVote
			| Self::PublishWorkspaceEvent => (true, false),
			Self::LogConsensusDecision | Self::LogAgentCoordination
			| Self::LogConflictResolution | Self::SaveWorkspaceSnapshot
			| Self::StartSession | Self::EndSession => (false, true),
		}
	}
}

/// The single entry point over both planes.
pub struct CoordinationBridge {
	realtime: Arc<dyn RealtimeStore>,
	audit: Arc<dyn AuditStore>,
	fallback: FallbackLockManager,
	supervisor: Arc<HealthSupervisor>,
	bus: EventBus,
	config: BrokerConfig,
	shutdown: CancellationToken,
}

impl std::fmt::Debug for CoordinationBridge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CoordinationBridge")
			.field("overall", &self.supervisor.overall())
			.finish_non_exhaustive()
	}
}

impl CoordinationBridge {
	/// Build the production bridge and start its background machinery.
	///
	/// Backend connect failures do not abort startup: the broker comes up
	/// degraded and the supervisor keeps trying.
	pub async fn start(config: BrokerConfig) -> Result<Arc<Self>> {
		let bus = EventBus::default();
		let shutdown = CancellationToken::new();

		let realtime = RedisCoordinator::new(config.fast_store.clone(), bus.clone());
		let audit = KafkaAuditTrail::new(config.durable_store.clone(), bus.clone());
		let supervisor = HealthSupervisor::new(config.supervisor.clone(), bus.clone());

		supervisor.watch(realtime.clone(), audit.clone(), shutdown.clone());
		supervisor.spawn_stamp_timer(shutdown.clone());
		realtime.spawn_consumer(shutdown.clone());
		realtime.spawn_heartbeat(shutdown.clone());
		if let Err(error) = audit.spawn_consumer(shutdown.clone()) {
			tracing::error!(%error, "audit consumer failed to start");
			bus.emit(BrokerEvent::BackendError {
				backend: Backend::Kafka,
				message: error.to_string(),
			});
		}

		match realtime.connect().await {
			Ok(()) => supervisor.note_connected(Backend::Redis),
			Err(error) => {
				tracing::warn!(%error, "fast store unavailable at startup");
				if supervisor.note_down(Backend::Redis, &error.to_string()) {
					supervisor.spawn_reconnect(
						Backend::Redis,
						realtime.clone(),
						shutdown.clone(),
					);
				}
			}
		}
		match audit.connect().await {
			Ok(()) => supervisor.note_connected(Backend::Kafka),
			Err(error) => {
				tracing::warn!(%error, "durable store unavailable at startup");
				if supervisor.note_down(Backend::Kafka, &error.to_string()) {
					supervisor.spawn_reconnect(Backend::Kafka, audit.clone(), shutdown.clone());
				}
			}
		}

		if config.supervisor.fallback_mode == FallbackMode::File {
			tracing::warn!("fallback_mode = \"file\" is treated as \"memory\"");
		}

		let bridge = Arc::new(Self {
			realtime,
			audit,
			fallback: FallbackLockManager::new(),
			supervisor,
			bus: bus.clone(),
			config,
			shutdown,
		});
		bus.emit(BrokerEvent::Initialized);
		tracing::info!(overall = ?bridge.supervisor.overall(), "coordination bridge initialized");
		Ok(bridge)
	}

	/// Build a bridge over caller-supplied stores.
	///
	/// The seam the tests (and embedders with their own backends) use: no
	/// background tasks are spawned and no connects are attempted.
	#[doc(hidden)]
	#[must_use]
	pub fn with_stores(
		realtime: Arc<dyn RealtimeStore>,
		audit: Arc<dyn AuditStore>,
		config: BrokerConfig,
		bus: EventBus,
	) -> Arc<Self> {
		let supervisor = HealthSupervisor::new(config.supervisor.clone(), bus.clone());
		Arc::new(Self {
			realtime,
			audit,
			fallback: FallbackLockManager::new(),
			supervisor,
			bus,
			config,
			shutdown: CancellationToken::new(),
		})
	}

	/// The event bus observers subscribe to.
	#[must_use]
	pub fn events(&self) -> &EventBus {
		&self.bus
	}

	/// The health supervisor (also the external reset surface).
	#[must_use]
	pub fn supervisor(&self) -> &Arc<HealthSupervisor> {
		&self.supervisor
	}

	/// Current health of both backends and the rollup.
	#[must_use]
	pub fn get_health(&self) -> HealthReport {
		self.supervisor.report()
	}

	/// Stop background machinery, disconnect both stores, announce shutdown.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		self.realtime.disconnect().await;
		self.audit.disconnect().await;
		self.bus.emit(BrokerEvent::Shutdown);
		tracing::info!("coordination bridge shut down");
	}

	fn realtime_up(&self) -> bool {
		self.supervisor.is_connected(Backend::Redis)
	}

	fn scope(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		session: Option<String>,
	) -> OpScope {
		OpScope {
			agent: agent.clone(),
			workspace: workspace.clone(),
			session_id: session.unwrap_or_else(|| format!("session_{}", new_envelope_id())),
		}
	}

	fn emit_operation(
		&self,
		kind: OperationKind,
		agent: &AgentId,
		workspace: &WorkspaceId,
		data: serde_json::Map<String, serde_json::Value>,
	) {
		let (requires_realtime, requires_persistence) = kind.paths();
		self.bus.emit(BrokerEvent::WorkspaceOperation(WorkspaceOperation {
			id: new_envelope_id(),
			timestamp: now_ms(),
			kind,
			agent_id: agent.clone(),
			workspace_id: workspace.clone(),
			data,
			requires_persistence,
			requires_realtime,
		}));
	}

	fn fallback_acquire(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
	) -> Option<LockId> {
		match self.config.supervisor.fallback_mode {
			FallbackMode::Memory | FallbackMode::File => {
				self.fallback.acquire(agent, workspace, path, kind)
			}
			FallbackMode::Disabled => {
				tracing::warn!(
					workspace = %workspace,
					path,
					"lock refused: fast store down and fallback disabled"
				);
				None
			}
		}
	}

	/// Run the lock protocol for a file.
	///
	/// `None` means the request conflicted (a waiter was queued; retry on
	/// the `lock_retry` event) or that everything that could grant it is
	/// down.
	pub async fn request_file_lock(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
		session: Option<String>,
	) -> Option<LockId> {
		let kind = if kind == LockType::Read && !self.config.security.allow_concurrent_reads {
			// Shared reads disabled: every read competes as a writer.
			LockType::Write
		} else {
			kind
		};

		if !self.config.security.enable_file_locking {
			// Locking disabled: grant locally without coordination.
			let lock_id = if kind.is_exclusive() {
				lock::holder_lock_id(workspace, path, kind)
			} else {
				lock::reader_lock_id(workspace, path, agent)
			};
			return Some(lock_id);
		}

		let scope = self.scope(agent, workspace, session);
		let granted = if self.realtime_up() {
			match self
				.realtime
				.request_file_lock(agent, workspace, path, kind)
				.await
			{
				Ok(granted) => granted,
				Err(error) => {
					tracing::warn!(%error, "lock request fell back to the local manager");
					self.fallback_acquire(agent, workspace, path, kind)
				}
			}
		} else {
			self.fallback_acquire(agent, workspace, path, kind)
		};

		if let Some(lock_id) = &granted
			&& self.config.security.enable_edit_history
		{
			let edit = FileEdit {
				file_path: path.to_string(),
				operation: agora_proto::EditOp::Update,
				reason: Some(format!("Lock acquired: {kind}")),
				..FileEdit::default()
			};
			if let Err(error) = self.audit.log_file_edit(&scope, edit).await {
				tracing::debug!(%error, lock = lock_id.as_str(), "lock audit entry dropped");
			}
		}

		let mut data = serde_json::Map::new();
		data.insert("file_path".into(), path.into());
		data.insert("lock_type".into(), kind.as_str().into());
		data.insert("granted".into(), granted.is_some().into());
		self.emit_operation(OperationKind::RequestFileLock, agent, workspace, data);
		granted
	}

	/// Release a lock taken through this bridge.
	///
	/// Checks the distributed record first, then the fallback table, so locks
	/// orphaned by an outage can still be released. False means the caller
	/// held nothing.
	pub async fn release_file_lock(
		&self,
		lock_id: &LockId,
		agent: &AgentId,
		session: Option<String>,
	) -> bool {
		if !self.config.security.enable_file_locking {
			return true;
		}

		let (workspace, path) = match lock::parse_lock_id(lock_id) {
			Some(
				lock::ParsedLockId::Holder { workspace, path, .. }
				| lock::ParsedLockId::Reader { workspace, path, .. },
			) => (workspace, path),
			None => (WorkspaceId::from(""), String::new()),
		};

		let mut released = false;
		if self.realtime_up() {
			match self.realtime.release_file_lock(lock_id, agent).await {
				Ok(done) => released = done,
				Err(error) => {
					tracing::warn!(%error, "distributed release failed; trying fallback");
				}
			}
		}
		if !released {
			released = self.fallback.release(lock_id, agent);
		}

		if released && self.config.security.enable_edit_history {
			let scope = self.scope(agent, &workspace, session);
			let edit = FileEdit {
				file_path: path.clone(),
				operation: agora_proto::EditOp::Update,
				reason: Some("Lock released".to_string()),
				..FileEdit::default()
			};
			if let Err(error) = self.audit.log_file_edit(&scope, edit).await {
				tracing::debug!(%error, "release audit entry dropped");
			}
		}

		let mut data = serde_json::Map::new();
		data.insert("file_path".into(), path.into());
		data.insert("released".into(), released.into());
		self.emit_operation(OperationKind::ReleaseFileLock, agent, &workspace, data);
		released
	}

	/// Publish an edit to the live stream and mirror it into edit history.
	pub async fn publish_file_edit(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		edit: FileEdit,
		session: Option<String>,
	) {
		let payload_len = edit
			.new_content
			.as_deref()
			.or(edit.previous_content.as_deref())
			.map_or(0, str::len) as u64;
		if payload_len > self.config.workspace.max_file_size_bytes {
			tracing::warn!(
				path = %edit.file_path,
				payload_len,
				"edit dropped: payload exceeds max_file_size_bytes"
			);
			return;
		}

		let scope = self.scope(agent, workspace, session);
		if self.realtime_up()
			&& let Err(error) = self.realtime.publish_file_edit(&scope, edit.clone()).await
		{
			tracing::warn!(%error, "live edit publication dropped");
		}
		if self.config.security.enable_edit_history
			&& let Err(error) = self.audit.log_file_edit(&scope, edit.clone()).await
		{
			tracing::warn!(%error, "edit history entry dropped");
		}

		let mut data = serde_json::Map::new();
		data.insert("file_path".into(), edit.file_path.as_str().into());
		self.emit_operation(OperationKind::PublishFileEdit, agent, workspace, data);
	}

	/// Publish a workspace-scoped announcement.
	pub async fn publish_workspace_event(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		payload: serde_json::Map<String, serde_json::Value>,
		session: Option<String>,
	) {
		let scope = self.scope(agent, workspace, session);
		if self.realtime_up() {
			if let Err(error) = self
				.realtime
				.publish_workspace_event(&scope, payload)
				.await
			{
				tracing::warn!(%error, "workspace event dropped");
			}
		} else {
			tracing::debug!(workspace = %workspace, "workspace event dropped: fast store down");
		}
		self.emit_operation(
			OperationKind::PublishWorkspaceEvent,
			agent,
			workspace,
			serde_json::Map::new(),
		);
	}

	/// Register an agent into a workspace.
	///
	/// Idempotent per agent id: re-registering refreshes the row. Rejected
	/// (with a warn, not an error) when the workspace is at its agent cap.
	pub async fn register_agent(
		&self,
		profile: AgentProfile,
		workspace: &WorkspaceId,
		session: Option<String>,
	) {
		let agent = profile.agent_id.clone();
		let scope = self.scope(&agent, workspace, session);

		if self.realtime_up() {
			match self.realtime.active_agents(workspace).await {
				Ok(existing) => {
					let other = existing.iter().filter(|r| r.agent_id != agent).count();
					if other >= self.config.workspace.max_agents_per_workspace as usize {
						tracing::warn!(
							workspace = %workspace,
							agent = %agent,
							cap = self.config.workspace.max_agents_per_workspace,
							"registration refused: workspace at capacity"
						);
						let mut data = serde_json::Map::new();
						data.insert("agent_id".into(), agent.as_str().into());
						data.insert("refused".into(), true.into());
						self.emit_operation(OperationKind::RegisterAgent, &agent, workspace, data);
						return;
					}
				}
				Err(error) => tracing::debug!(%error, "capacity check skipped"),
			}

			let record = AgentRecord::register(profile, workspace.clone());
			if let Err(error) = self.realtime.register_agent(record).await {
				tracing::warn!(%error, agent = %agent, "registry write dropped");
			}
		} else {
			tracing::debug!(agent = %agent, "registering durable-only: fast store down");
		}

		if self.config.security.enable_audit_logging {
			let coordination = Coordination {
				kind: CoordinationKind::Synchronization,
				target: None,
				task: "agent_registration".to_string(),
				dependencies: vec![],
				expected_duration_ms: None,
				priority: Priority::Medium,
			};
			if let Err(error) = self.audit.log_agent_coordination(&scope, coordination).await {
				tracing::warn!(%error, "registration audit entry dropped");
			}
		}

		let mut data = serde_json::Map::new();
		data.insert("agent_id".into(), agent.as_str().into());
		self.emit_operation(OperationKind::RegisterAgent, &agent, workspace, data);
	}

	/// Remove an agent from a workspace and announce it offline.
	pub async fn deregister_agent(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		session: Option<String>,
	) {
		let scope = self.scope(agent, workspace, session);
		if self.realtime_up()
			&& let Err(error) = self.realtime.deregister_agent(agent, workspace).await
		{
			tracing::warn!(%error, agent = %agent, "deregistration dropped from registry");
		}

		if self.config.security.enable_audit_logging {
			let coordination = Coordination {
				kind: CoordinationKind::Synchronization,
				target: None,
				task: "agent_deregistration".to_string(),
				dependencies: vec![],
				expected_duration_ms: None,
				priority: Priority::Medium,
			};
			if let Err(error) = self.audit.log_agent_coordination(&scope, coordination).await {
				tracing::warn!(%error, "deregistration audit entry dropped");
			}
		}

		self.emit_operation(
			OperationKind::DeregisterAgent,
			agent,
			workspace,
			serde_json::Map::new(),
		);
	}

	/// Update an agent's presence. Dropped silently while the fast store is
	/// down; presence is not worth persisting.
	pub async fn update_agent_status(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		status: AgentStatus,
		current_task: Option<String>,
	) {
		if self.realtime_up() {
			if let Err(error) = self
				.realtime
				.update_agent_status(agent, status, current_task)
				.await
			{
				tracing::debug!(%error, agent = %agent, "status update dropped");
			}
		} else {
			tracing::debug!(agent = %agent, "status update dropped: fast store down");
		}

		let mut data = serde_json::Map::new();
		data.insert("status".into(), status.as_str().into());
		self.emit_operation(OperationKind::UpdateAgentStatus, agent, workspace, data);
	}

	/// Registry rows of agents currently in a workspace; empty when the fast
	/// store is down.
	pub async fn get_active_agents(&self, workspace: &WorkspaceId) -> Vec<AgentRecord> {
		if !self.realtime_up() {
			return Vec::new();
		}
		match self.realtime.active_agents(workspace).await {
			Ok(agents) => agents,
			Err(error) => {
				tracing::debug!(%error, "active agent listing unavailable");
				Vec::new()
			}
		}
	}

	/// Publish a vote onto the consensus stream. Dropped silently while the
	/// fast store is down.
	pub async fn publish_consensus_vote(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		vote: VoteCast,
		session: Option<String>,
	) {
		let proposal = vote.proposal_id.clone();
		if self.realtime_up() {
			let scope = self.scope(agent, workspace, session);
			if let Err(error) = self.realtime.publish_consensus_vote(&scope, vote).await {
				tracing::debug!(%error, "vote dropped");
			}
		} else {
			tracing::debug!(proposal = %proposal, "vote dropped: fast store down");
		}

		let mut data = serde_json::Map::new();
		data.insert("proposal_id".into(), proposal.into());
		self.emit_operation(OperationKind::PublishConsensusVote, agent, workspace, data);
	}

	/// Persist a closed consensus decision.
	pub async fn log_consensus_decision(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		decision: ConsensusDecision,
		session: Option<String>,
	) {
		let proposal = decision.proposal_id.clone();
		if self.config.security.enable_audit_logging {
			let scope = self.scope(agent, workspace, session);
			if let Err(error) = self.audit.log_consensus_decision(&scope, decision).await {
				tracing::warn!(%error, proposal = %proposal, "consensus decision dropped");
			}
		}

		let mut data = serde_json::Map::new();
		data.insert("proposal_id".into(), proposal.into());
		self.emit_operation(OperationKind::LogConsensusDecision, agent, workspace, data);
	}

	/// Persist an agent-coordination entry.
	pub async fn log_agent_coordination(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		coordination: Coordination,
		session: Option<String>,
	) {
		if self.config.security.enable_audit_logging {
			let scope = self.scope(agent, workspace, session);
			if let Err(error) = self.audit.log_agent_coordination(&scope, coordination).await {
				tracing::warn!(%error, "coordination entry dropped");
			}
		}
		self.emit_operation(
			OperationKind::LogAgentCoordination,
			agent,
			workspace,
			serde_json::Map::new(),
		);
	}

	/// Persist a conflict and its resolution.
	pub async fn log_conflict_resolution(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		conflict: ConflictResolution,
		session: Option<String>,
	) {
		let conflict_id = conflict.conflict_id.clone();
		if self.config.security.enable_audit_logging {
			let scope = self.scope(agent, workspace, session);
			if let Err(error) = self.audit.log_conflict_resolution(&scope, conflict).await {
				tracing::warn!(%error, conflict = %conflict_id, "conflict entry dropped");
			}
		}

		let mut data = serde_json::Map::new();
		data.insert("conflict_id".into(), conflict_id.into());
		self.emit_operation(OperationKind::LogConflictResolution, agent, workspace, data);
	}

	/// Persist a full workspace snapshot.
	pub async fn save_workspace_snapshot(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		snapshot: WorkspaceSnapshot,
		session: Option<String>,
	) {
		if self.config.security.enable_audit_logging {
			let scope = self.scope(agent, workspace, session);
			if let Err(error) = self.audit.save_workspace_snapshot(&scope, snapshot).await {
				tracing::warn!(%error, "snapshot dropped");
			}
		}
		self.emit_operation(
			OperationKind::SaveWorkspaceSnapshot,
			agent,
			workspace,
			serde_json::Map::new(),
		);
	}

	/// Open a session and return its id (synthesized when not supplied).
	pub async fn start_session(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		session: Option<String>,
	) -> String {
		let scope = self.scope(agent, workspace, session);
		if self.config.security.enable_audit_logging
			&& let Err(error) = self.audit.start_session(&scope).await
		{
			tracing::warn!(%error, "session start marker dropped");
		}

		let mut data = serde_json::Map::new();
		data.insert("session_id".into(), scope.session_id.as_str().into());
		self.emit_operation(OperationKind::StartSession, agent, workspace, data);
		scope.session_id
	}

	/// Close a session.
	pub async fn end_session(&self, agent: &AgentId, workspace: &WorkspaceId, session: String) {
		let scope = self.scope(agent, workspace, Some(session));
		if self.config.security.enable_audit_logging
			&& let Err(error) = self.audit.end_session(&scope).await
		{
			tracing::warn!(%error, "session end marker dropped");
		}

		let mut data = serde_json::Map::new();
		data.insert("session_id".into(), scope.session_id.as_str().into());
		self.emit_operation(OperationKind::EndSession, agent, workspace, data);
	}
}

#[cfg(test)]
mod tests;
