//! Backend store contracts.
//!
//! The bridge consumes both planes through these traits. The abstraction
//! allows the broker to use the real Redis and Kafka orchestrators in
//! production and in-process doubles for testing, and it is what the health
//! supervisor holds when it drives reconnects.

use agora_proto::{
	AgentId, AgentRecord, AgentStatus, Backend, ConflictResolution, ConsensusDecision,
	Coordination, FileEdit, LockId, LockType, VoteCast, WorkspaceId, WorkspaceSnapshot,
};
use async_trait::async_trait;

use crate::error::Result;

/// Who an operation runs as, where, and under which session.
///
/// The bridge synthesizes a session id when the caller supplies none, so
/// every envelope downstream of it carries one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpScope {
	/// Acting agent.
	pub agent: AgentId,
	/// Workspace the operation targets.
	pub workspace: WorkspaceId,
	/// Session the operation runs under.
	pub session_id: String,
}

impl OpScope {
	/// Build a scope.
	#[must_use]
	pub fn new(
		agent: impl Into<AgentId>,
		workspace: impl Into<WorkspaceId>,
		session_id: impl Into<String>,
	) -> Self {
		Self {
			agent: agent.into(),
			workspace: workspace.into(),
			session_id: session_id.into(),
		}
	}
}

/// Connection lifecycle shared by both planes.
///
/// Supertrait of the store contracts so the supervisor can drive reconnects
/// without knowing which plane it holds.
#[async_trait]
pub trait Connectable: Send + Sync {
	/// Establish the backend connection. Idempotent: connecting while
	/// connected returns immediately.
	async fn connect(&self) -> Result<()>;

	/// Tear the connection down. Safe to call when not connected.
	async fn disconnect(&self);

	/// Which backend this is, for events and log fields.
	fn backend(&self) -> Backend;
}

/// The real-time coordination plane (fast store).
///
/// Locks, presence, and stream publication. All lock state lives in the
/// store itself; implementations keep no authoritative state of their own.
#[async_trait]
pub trait RealtimeStore: Connectable {
	/// Insert or overwrite an agent registry row. Re-registering is
	/// idempotent: the row reflects the latest call.
	async fn register_agent(&self, record: AgentRecord) -> Result<()>;

	/// Update status and current task of a registered agent.
	async fn update_agent_status(
		&self,
		agent: &AgentId,
		status: AgentStatus,
		current_task: Option<String>,
	) -> Result<()>;

	/// Remove an agent registry row and announce it offline.
	async fn deregister_agent(&self, agent: &AgentId, workspace: &WorkspaceId) -> Result<()>;

	/// Registry rows of every agent currently in a workspace.
	async fn active_agents(&self, workspace: &WorkspaceId) -> Result<Vec<AgentRecord>>;

	/// Run the lock protocol. `None` means the request conflicted and was
	/// queued; the caller retries when it observes a lock-retry signal.
	async fn request_file_lock(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
	) -> Result<Option<LockId>>;

	/// Release a held lock. False means the caller was not the holder; the
	/// record is left intact in that case.
	async fn release_file_lock(&self, lock_id: &LockId, agent: &AgentId) -> Result<bool>;

	/// Publish an edit onto the edits stream.
	async fn publish_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()>;

	/// Publish a vote onto the consensus stream.
	async fn publish_consensus_vote(&self, scope: &OpScope, vote: VoteCast) -> Result<()>;

	/// Publish a workspace-scoped announcement onto the workspace stream.
	async fn publish_workspace_event(
		&self,
		scope: &OpScope,
		payload: serde_json::Map<String, serde_json::Value>,
	) -> Result<()>;
}

/// The append-only audit plane (durable store).
///
/// Every method appends exactly one envelope to its topic; nothing here is
/// ever read back by the broker.
#[async_trait]
pub trait AuditStore: Connectable {
	/// Append an edit-history entry.
	async fn log_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()>;

	/// Append a full workspace snapshot.
	async fn save_workspace_snapshot(
		&self,
		scope: &OpScope,
		snapshot: WorkspaceSnapshot,
	) -> Result<()>;

	/// Append a closed consensus decision.
	async fn log_consensus_decision(
		&self,
		scope: &OpScope,
		decision: ConsensusDecision,
	) -> Result<()>;

	/// Append an agent-coordination entry.
	async fn log_agent_coordination(
		&self,
		scope: &OpScope,
		coordination: Coordination,
	) -> Result<()>;

	/// Append a conflict-resolution entry.
	async fn log_conflict_resolution(
		&self,
		scope: &OpScope,
		conflict: ConflictResolution,
	) -> Result<()>;

	/// Append a session-start marker.
	async fn start_session(&self, scope: &OpScope) -> Result<()>;

	/// Append a session-end marker.
	async fn end_session(&self, scope: &OpScope) -> Result<()>;
}
