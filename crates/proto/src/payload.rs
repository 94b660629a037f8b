//! Typed views over the opaque envelope payload.
//!
//! Envelopes carry a plain JSON map; these structs are the per-kind schemas
//! validated at the boundary with [`Envelope::payload_as`] and installed with
//! [`Envelope::set_payload`]. Producers and consumers never pattern-match raw
//! maps.

use serde::{Deserialize, Serialize};

use crate::types::{AgentId, AgentStatus, Ballot, DecisionKind, DecisionMethod, LockId, LockType,
	Priority, Vote};

#[cfg(doc)]
use crate::types::Envelope;

/// Operation recorded by an edit-history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EditOp {
	/// The file was created.
	Create,
	/// The file was modified.
	Update,
	/// The file was removed.
	Delete,
}

/// Payload of `file_edit` and `edit_history` envelopes.
///
/// Content fields are opaque to the broker: it never diffs or validates
/// them, only carries them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
	/// Edited path.
	pub file_path: String,
	/// What happened to the file.
	#[serde(rename = "op")]
	pub operation: EditOp,
	/// Content before the edit, when the publisher supplies it.
	#[serde(rename = "previous", default, skip_serializing_if = "Option::is_none")]
	pub previous_content: Option<String>,
	/// Content after the edit.
	#[serde(rename = "new", default, skip_serializing_if = "Option::is_none")]
	pub new_content: Option<String>,
	/// Patch form of the edit, for publishers that diff upstream.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub patch: Option<String>,
	/// First affected line.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub start_line: Option<u32>,
	/// Last affected line.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub end_line: Option<u32>,
	/// Free-form description of why the edit happened.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
}

impl Default for EditOp {
	fn default() -> Self {
		Self::Update
	}
}

/// Payload of `file_lock` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEvent {
	/// `lock_acquired` or `lock_released`.
	#[serde(rename = "eventType")]
	pub event: LockEventKind,
	/// The lock handle involved.
	pub lock_id: LockId,
	/// Flavor of the lock.
	pub lock_type: LockType,
}

/// Discriminator of a [`LockEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockEventKind {
	/// The lock was granted.
	LockAcquired,
	/// The lock was released.
	LockReleased,
}

/// Payload of `agent_status` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatusEvent {
	/// What changed.
	#[serde(rename = "eventType")]
	pub event: AgentStatusEventKind,
	/// Status after the change.
	pub status: AgentStatus,
	/// Task the agent reported, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_task: Option<String>,
}

/// Discriminator of an [`AgentStatusEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatusEventKind {
	/// The agent registered into the workspace.
	Registered,
	/// The agent changed status or task.
	StatusChanged,
	/// The agent deregistered.
	Deregistered,
}

/// Payload of `consensus_vote` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteCast {
	/// Proposal the vote belongs to.
	pub proposal_id: String,
	/// The position.
	pub vote: Vote,
	/// Free-form justification, never inspected by the broker.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<String>,
}

/// Payload of `consensus_decision` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusDecision {
	/// Proposal the decision closes.
	pub proposal_id: String,
	/// What was proposed.
	pub description: String,
	/// Every vote cast, keyed by agent id.
	#[serde(default)]
	pub votes: std::collections::BTreeMap<String, Ballot>,
	/// The recorded outcome.
	pub final_decision: DecisionKind,
	/// How the outcome was reached.
	pub method: DecisionMethod,
	/// Agents that took part.
	#[serde(default)]
	pub participating_agents: Vec<AgentId>,
	/// Reasoning of agents that dissented from the outcome.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dissenting_opinions: Option<Vec<String>>,
}

/// Payload of `agent_coordination` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordination {
	/// Flavor of coordination.
	#[serde(rename = "type")]
	pub kind: CoordinationKind,
	/// Addressed agent, for directed coordination.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target: Option<AgentId>,
	/// The task being coordinated.
	pub task: String,
	/// Tasks or artifacts this one depends on.
	#[serde(default)]
	pub dependencies: Vec<String>,
	/// Expected duration in millis, when the initiator estimates one.
	#[serde(rename = "expected_duration", default, skip_serializing_if = "Option::is_none")]
	pub expected_duration_ms: Option<u64>,
	/// Priority of the coordinated task.
	#[serde(default)]
	pub priority: Priority,
}

/// Discriminator of a [`Coordination`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinationKind {
	/// Work moves from one agent to another.
	Handoff,
	/// Agents work a task together.
	Collaboration,
	/// An agent assigns work and expects an answer.
	Delegation,
	/// Agents align state without transferring work.
	Synchronization,
}

impl CoordinationKind {
	/// Delegations expect a response from the target.
	#[must_use]
	pub fn requires_response(self) -> bool {
		matches!(self, Self::Delegation)
	}
}

/// Payload of `conflict_resolution` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
	/// Stable id of the conflict; doubles as the correlation id.
	pub conflict_id: String,
	/// Flavor of conflict (free-form, e.g. `merge`, `lock_contention`).
	#[serde(rename = "type")]
	pub kind: String,
	/// Agents involved.
	#[serde(default)]
	pub involved_agents: Vec<AgentId>,
	/// Free-form details of the conflict.
	#[serde(default)]
	pub details: serde_json::Map<String, serde_json::Value>,
	/// How it was resolved (free-form, e.g. `vote`, `priority`).
	pub method: String,
	/// What the resolution was.
	pub resolution: String,
	/// Final outcome statement.
	pub outcome: String,
}

/// Payload of session-lifecycle envelopes.
///
/// Session entries ride the `workspace_snapshot` kind on the
/// session-management topic, discriminated by `eventType`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLifecycle {
	/// Start or end marker.
	#[serde(rename = "eventType")]
	pub event: SessionEventKind,
	/// The session in question.
	pub session_id: String,
}

/// Discriminator of a [`SessionLifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEventKind {
	/// The session opened.
	SessionStart,
	/// The session closed.
	SessionEnd,
}
