//! Core identifiers, records, and the message envelope.
//!
//! The envelope is the one shape every coordination event uses, on either
//! store. The `kind` field ("type" on the wire) is a closed taxonomy
//! partitioned between the real-time plane and the audit plane; payloads stay
//! an opaque JSON map at this layer and are given typed views in
//! [`crate::payload`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of an external agent process.
///
/// Supplied by the agent on registration and trusted as-is; the broker does
/// not authenticate it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

/// Identifier of a logical workspace scoping locks, presence, and streams.
///
/// Must not contain `:`; it is embedded in store keys and lock ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceId(pub String);

/// Opaque-to-callers lock handle.
///
/// Encodes the workspace, file path, and holder kind so a release needs no
/// lookup table. See the broker's lock module for the encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub String);

macro_rules! string_id_impls {
	($ty:ident) => {
		impl $ty {
			/// View the id as a string slice.
			#[must_use]
			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $ty {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $ty {
			fn from(s: &str) -> Self {
				Self(s.to_string())
			}
		}

		impl From<String> for $ty {
			fn from(s: String) -> Self {
				Self(s)
			}
		}
	};
}

string_id_impls!(AgentId);
string_id_impls!(WorkspaceId);
string_id_impls!(LockId);

/// Milliseconds since the Unix epoch.
///
/// Wire timestamps are plain `u64` millis everywhere; this is the single
/// clock read used when stamping them.
#[must_use]
pub fn now_ms() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

/// Allocate a fresh globally unique envelope id.
#[must_use]
pub fn new_envelope_id() -> String {
	uuid::Uuid::new_v4().to_string()
}

/// Delivery priority carried on every envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	/// Coordination-critical traffic (locks, conflicts).
	High,
	/// Regular traffic.
	#[default]
	Medium,
	/// Housekeeping traffic (status refreshes, snapshots).
	Low,
}

/// The closed event taxonomy, partitioned by store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	/// Real-time: lock acquisition and release notices.
	FileLock,
	/// Real-time: published file edits.
	FileEdit,
	/// Real-time: agent presence and status changes.
	AgentStatus,
	/// Real-time: workspace-scoped announcements.
	WorkspaceEvent,
	/// Real-time: a single cast vote.
	ConsensusVote,
	/// Durable: one entry of the edit audit trail.
	EditHistory,
	/// Durable: a full workspace snapshot; also carries session lifecycle
	/// entries discriminated by an `eventType` payload field.
	WorkspaceSnapshot,
	/// Durable: the closed outcome of a consensus round.
	ConsensusDecision,
	/// Durable: handoffs, delegations, and other agent-to-agent coordination.
	AgentCoordination,
	/// Durable: a recorded conflict and its resolution.
	ConflictResolution,
}

impl MessageKind {
	/// Wire name of the kind, identical to its serde encoding.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::FileLock => "file_lock",
			Self::FileEdit => "file_edit",
			Self::AgentStatus => "agent_status",
			Self::WorkspaceEvent => "workspace_event",
			Self::ConsensusVote => "consensus_vote",
			Self::EditHistory => "edit_history",
			Self::WorkspaceSnapshot => "workspace_snapshot",
			Self::ConsensusDecision => "consensus_decision",
			Self::AgentCoordination => "agent_coordination",
			Self::ConflictResolution => "conflict_resolution",
		}
	}

	/// True for kinds published on the real-time plane.
	#[must_use]
	pub fn is_realtime(self) -> bool {
		matches!(
			self,
			Self::FileLock
				| Self::FileEdit
				| Self::AgentStatus
				| Self::WorkspaceEvent
				| Self::ConsensusVote
		)
	}

	/// True for kinds appended to the audit plane.
	#[must_use]
	pub fn is_durable(self) -> bool {
		!self.is_realtime()
	}
}

/// Requested or held lock flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockType {
	/// Shared: any number of readers coexist.
	Read,
	/// Exclusive against readers and writers.
	Write,
	/// Alias of write in this system; kept distinct on the wire.
	Exclusive,
}

impl LockType {
	/// Wire name of the lock type.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Read => "read",
			Self::Write => "write",
			Self::Exclusive => "exclusive",
		}
	}

	/// True for the flavors that demand sole ownership.
	#[must_use]
	pub fn is_exclusive(self) -> bool {
		matches!(self, Self::Write | Self::Exclusive)
	}

	/// Parse a wire name back into a lock type.
	#[must_use]
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"read" => Some(Self::Read),
			"write" => Some(Self::Write),
			"exclusive" => Some(Self::Exclusive),
			_ => None,
		}
	}
}

impl fmt::Display for LockType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Per-envelope routing and correlation metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
	/// Agent the envelope is about (usually equal to the source).
	pub agent_id: AgentId,
	/// Workspace the envelope belongs to; the audit plane partitions on it.
	pub workspace_id: WorkspaceId,
	/// Session the operation ran under, when one exists.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session_id: Option<String>,
	/// File the envelope concerns, for lock and edit traffic.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub file_path: Option<String>,
	/// Lock flavor, for lock traffic.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub lock_type: Option<LockType>,
	/// Groups related envelopes, e.g. all votes on one proposal.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub correlation_id: Option<String>,
	/// Strictly monotonic per producer instance, across all kinds.
	pub sequence_number: u64,
	/// Redelivery count stamped by consumers on retry paths.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub retry_count: Option<u32>,
	/// True when the receiver is expected to answer (delegations).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub requires_response: Option<bool>,
	/// Consensus round the envelope belongs to, for vote/decision traffic.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub consensus_round: Option<u32>,
}

impl Metadata {
	/// Minimal metadata for an agent acting in a workspace.
	#[must_use]
	pub fn new(agent_id: AgentId, workspace_id: WorkspaceId) -> Self {
		Self {
			agent_id,
			workspace_id,
			session_id: None,
			file_path: None,
			lock_type: None,
			correlation_id: None,
			sequence_number: 0,
			retry_count: None,
			requires_response: None,
			consensus_round: None,
		}
	}
}

/// The uniform shape of every coordination event, on either store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	/// Locally unique id; consumers deduplicate on it (delivery is
	/// at-least-once).
	pub id: String,
	/// Producer clock at publication, epoch millis.
	pub timestamp: u64,
	/// Taxonomy tag.
	#[serde(rename = "type")]
	pub kind: MessageKind,
	/// Agent that produced the envelope.
	pub source: AgentId,
	/// Addressed agent, for directed coordination.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub target: Option<AgentId>,
	/// Delivery priority.
	#[serde(default)]
	pub priority: Priority,
	/// Opaque payload map; see [`crate::payload`] for the typed views.
	pub payload: serde_json::Map<String, serde_json::Value>,
	/// Routing and correlation metadata.
	pub metadata: Metadata,
}

impl Envelope {
	/// Build a fresh envelope with a new id and a current timestamp.
	#[must_use]
	pub fn new(kind: MessageKind, source: AgentId, metadata: Metadata) -> Self {
		Self {
			id: new_envelope_id(),
			timestamp: now_ms(),
			kind,
			source,
			target: None,
			priority: Priority::default(),
			payload: serde_json::Map::new(),
			metadata,
		}
	}

	/// Replace the payload with the JSON object form of `value`.
	///
	/// Fails if `value` does not serialize to a JSON object; the envelope is
	/// left untouched in that case.
	pub fn set_payload<T: Serialize>(&mut self, value: &T) -> Result<(), serde_json::Error> {
		self.payload = to_payload(value)?;
		Ok(())
	}

	/// Decode the payload into a typed view, validating it at the boundary.
	pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		serde_json::from_value(serde_json::Value::Object(self.payload.clone()))
	}
}

/// Serialize a value into the opaque payload map form.
pub fn to_payload<T: Serialize>(
	value: &T,
) -> Result<serde_json::Map<String, serde_json::Value>, serde_json::Error> {
	match serde_json::to_value(value)? {
		serde_json::Value::Object(map) => Ok(map),
		other => Err(serde::ser::Error::custom(format!(
			"payload must be a JSON object, got {other}"
		))),
	}
}

/// Presence state of a registered agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
	/// Registered and responsive.
	#[default]
	Active,
	/// Working on a task.
	Busy,
	/// Registered but not currently working.
	Idle,
	/// Deregistered or expired.
	Offline,
}

impl AgentStatus {
	/// Wire name of the status.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Active => "active",
			Self::Busy => "busy",
			Self::Idle => "idle",
			Self::Offline => "offline",
		}
	}

	/// Parse a wire name back into a status.
	#[must_use]
	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"active" => Some(Self::Active),
			"busy" => Some(Self::Busy),
			"idle" => Some(Self::Idle),
			"offline" => Some(Self::Offline),
			_ => None,
		}
	}
}

/// What an agent announces about itself at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
	/// Stable agent id.
	pub agent_id: AgentId,
	/// Human-readable name.
	pub name: String,
	/// Model or runtime backing the agent.
	pub model: String,
	/// Capability tags used for task routing above the broker.
	#[serde(default)]
	pub capabilities: BTreeSet<String>,
}

/// One row of the agent registry, owned exclusively by the fast store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
	/// Stable agent id.
	pub agent_id: AgentId,
	/// Human-readable name.
	pub name: String,
	/// Model or runtime backing the agent.
	pub model: String,
	/// Capability tags.
	#[serde(default)]
	pub capabilities: BTreeSet<String>,
	/// Workspace the agent registered into.
	pub workspace_id: WorkspaceId,
	/// Current presence state.
	pub status: AgentStatus,
	/// Task the agent reported last, if any.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub current_task: Option<String>,
	/// Registration time, epoch millis.
	pub registered_at: u64,
	/// Last status or heartbeat update, epoch millis.
	pub last_heartbeat: u64,
}

impl AgentRecord {
	/// Build a registry row for a profile registering now.
	#[must_use]
	pub fn register(profile: AgentProfile, workspace_id: WorkspaceId) -> Self {
		let now = now_ms();
		Self {
			agent_id: profile.agent_id,
			name: profile.name,
			model: profile.model,
			capabilities: profile.capabilities,
			workspace_id,
			status: AgentStatus::Active,
			current_task: None,
			registered_at: now,
			last_heartbeat: now,
		}
	}
}

/// Who holds a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockHolder {
	/// A single write/exclusive holder.
	Exclusive {
		/// The holding agent.
		agent_id: AgentId,
	},
	/// A non-empty set of shared readers.
	Readers {
		/// The reading agents, insertion-ordered.
		readers: Vec<AgentId>,
	},
}

/// One distributed lock record.
///
/// Per `(workspace_id, file_path)` at most one record exists, either
/// exclusive or readers, never both. An expired record is treated as absent
/// by new acquirers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
	/// Handle encoding workspace, path, and holder kind.
	pub lock_id: LockId,
	/// Owning workspace.
	pub workspace_id: WorkspaceId,
	/// Locked file path.
	pub file_path: String,
	/// Current holder.
	pub holder: LockHolder,
	/// Flavor the record was installed with.
	pub lock_type: LockType,
	/// Install time, epoch millis.
	pub timestamp: u64,
	/// Time-to-live; `0` means the record never expires (fallback mode).
	pub ttl_ms: u64,
}

impl LockRecord {
	/// Absolute expiry in epoch millis, or `None` when the record does not
	/// expire.
	#[must_use]
	pub fn expires_at(&self) -> Option<u64> {
		(self.ttl_ms > 0).then(|| self.timestamp.saturating_add(self.ttl_ms))
	}

	/// Whether the record has expired as of `now_ms`.
	#[must_use]
	pub fn is_expired(&self, now_ms: u64) -> bool {
		self.expires_at().is_some_and(|at| now_ms >= at)
	}
}

/// One queued lock request awaiting a retry signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Waiter {
	/// Requesting agent.
	pub agent_id: AgentId,
	/// Flavor the agent asked for.
	pub lock_type: LockType,
	/// Enqueue time, epoch millis.
	pub enqueued_at: u64,
}

/// A single agent's position on a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
	/// In favor.
	Agree,
	/// Against.
	Disagree,
	/// Counted toward the total but toward neither side.
	Abstain,
}

/// A cast vote with optional free-form reasoning.
///
/// The broker never inspects the reasoning; it is carried for the audit
/// trail only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
	/// The position.
	pub vote: Vote,
	/// Free-form justification, opaque to the broker.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reasoning: Option<String>,
}

/// Outcome of tallying a vote map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusOutcome {
	/// A strict majority agreed.
	Approved,
	/// A strict majority disagreed.
	Rejected,
	/// Neither side reached a strict majority.
	Deadlock,
}

/// Recorded final decision of a consensus round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
	/// The proposal passed.
	Approved,
	/// The proposal was rejected.
	Rejected,
	/// The decision was pushed to a later round.
	Deferred,
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMethod {
	/// Strict-majority tally.
	#[default]
	Majority,
	/// Weighted tally (weights decided above the broker).
	Weighted,
	/// All participants must agree.
	Unanimous,
	/// A designated agent decides.
	Delegate,
}

/// The two backing stores, as they appear in health and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
	/// The fast store (locks, presence, streams).
	Redis,
	/// The durable store (audit topics).
	Kafka,
}

impl Backend {
	/// Name used in event payloads and log fields.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Redis => "redis",
			Self::Kafka => "kafka",
		}
	}
}

impl fmt::Display for Backend {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Connection health of one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHealth {
	/// Whether the backend is currently reachable.
	pub connected: bool,
	/// Last periodic health-check stamp, epoch millis.
	pub last_health_check: u64,
	/// Errors observed since the last successful connect.
	pub error_count: u32,
	/// Message of the most recent error.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_error: Option<String>,
}

/// Rollup over both backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallHealth {
	/// Both backends connected.
	Healthy,
	/// Exactly one backend connected; both planes still accept calls
	/// best-effort.
	Degraded,
	/// Neither backend connected; only the fallback lock manager works.
	Offline,
}

/// Snapshot of broker health handed to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
	/// Fast-store health.
	pub redis: BackendHealth,
	/// Durable-store health.
	pub kafka: BackendHealth,
	/// Rollup of the two.
	pub overall: OverallHealth,
}

/// A workspace snapshot persisted to the audit plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceSnapshot {
	/// Full file contents keyed by path.
	#[serde(default)]
	pub files: BTreeMap<String, String>,
	/// Free-form snapshot metadata.
	#[serde(default)]
	pub metadata: serde_json::Map<String, serde_json::Value>,
	/// Agents active when the snapshot was taken.
	#[serde(default)]
	pub active_agents: Vec<AgentId>,
	/// Consensus outcomes known at snapshot time, keyed by proposal id.
	#[serde(default)]
	pub consensus: BTreeMap<String, ConsensusOutcome>,
	/// Why the snapshot was taken.
	#[serde(default)]
	pub reason: String,
}
