//! Lock-id encoding and the acquire decision shared by both executors.
//!
//! The distributed (Redis) executor and the in-process fallback manager must
//! agree on what a lock id means and on when a request installs, joins, or
//! conflicts. Both of those are pure and live here; the executors only apply
//! the decision to their own storage.

use agora_proto::{AgentId, LockHolder, LockId, LockRecord, LockType, WorkspaceId};

/// Marker that distinguishes reader-scoped lock ids.
const READERS_MARKER: &str = ":readers:";

/// Lock id for a write/exclusive holder: `<ws>:<path>:<kind>`.
#[must_use]
pub fn holder_lock_id(workspace: &WorkspaceId, path: &str, kind: LockType) -> LockId {
	LockId(format!("{workspace}:{path}:{}", kind.as_str()))
}

/// Lock id for one reader slot: `<ws>:<path>:readers:<agent>`.
#[must_use]
pub fn reader_lock_id(workspace: &WorkspaceId, path: &str, agent: &AgentId) -> LockId {
	LockId(format!("{workspace}:{path}{READERS_MARKER}{agent}"))
}

/// A decoded lock id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedLockId {
	/// A single write/exclusive holder.
	Holder {
		/// Workspace component.
		workspace: WorkspaceId,
		/// File path component.
		path: String,
		/// Lock flavor component.
		kind: LockType,
	},
	/// One reader's slot in a shared record.
	Reader {
		/// Workspace component.
		workspace: WorkspaceId,
		/// File path component.
		path: String,
		/// The reading agent.
		agent: AgentId,
	},
}

/// Decode a lock id produced by [`holder_lock_id`] or [`reader_lock_id`].
///
/// Workspace ids must not contain `:`. Paths may; the trailing kind and the
/// readers marker disambiguate from the right.
#[must_use]
pub fn parse_lock_id(lock_id: &LockId) -> Option<ParsedLockId> {
	let (workspace, rest) = lock_id.as_str().split_once(':')?;
	if workspace.is_empty() || rest.is_empty() {
		return None;
	}

	// Holder ids end in a write/exclusive segment. Read installs always
	// produce reader ids, so a trailing `:read` is never a holder; and a
	// reader id whose agent is literally named "write" or "exclusive" ends
	// in `:readers:<kind>`, so a segment ending with `:readers` means the
	// trailing piece is an agent, not a kind. Agent ids are untrusted
	// external strings, so that collision must release correctly.
	if let Some((path, kind)) = rest.rsplit_once(':')
		&& let Some(kind) = LockType::parse(kind)
		&& kind.is_exclusive()
		&& !path.is_empty()
		&& !path.ends_with(":readers")
	{
		return Some(ParsedLockId::Holder {
			workspace: workspace.into(),
			path: path.to_string(),
			kind,
		});
	}

	if let Some(at) = rest.rfind(READERS_MARKER) {
		let path = &rest[..at];
		let agent = &rest[at + READERS_MARKER.len()..];
		if !path.is_empty() && !agent.is_empty() {
			return Some(ParsedLockId::Reader {
				workspace: workspace.into(),
				path: path.to_string(),
				agent: agent.into(),
			});
		}
	}

	None
}

/// What an acquire request should do, given the record currently installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireDecision {
	/// No live record: install a fresh one.
	Install,
	/// A readers record exists and the request is a read: add the caller.
	/// Adding an agent already in the set is a no-op success.
	JoinReaders,
	/// Any other combination: enqueue as a waiter and return nothing.
	Conflict,
}

/// Decide an acquire against the record currently at the key.
///
/// An expired record counts as absent; the caller takes the key over.
/// `queued_writer_at_head` reports whether the waiters queue for this key
/// starts with a write/exclusive request: a newcomer read never preempts
/// that writer on an empty key (reads only ever join an existing readers
/// record), which keeps writers from starving under a steady read stream.
#[must_use]
pub fn decide_acquire(
	existing: Option<&LockRecord>,
	kind: LockType,
	now_ms: u64,
	queued_writer_at_head: bool,
) -> AcquireDecision {
	let Some(record) = existing.filter(|r| !r.is_expired(now_ms)) else {
		if kind == LockType::Read && queued_writer_at_head {
			return AcquireDecision::Conflict;
		}
		return AcquireDecision::Install;
	};

	match (&record.holder, kind) {
		(LockHolder::Readers { .. }, LockType::Read) => AcquireDecision::JoinReaders,
		_ => AcquireDecision::Conflict,
	}
}

/// Build the record a fresh install writes.
///
/// For a read this is a readers record containing only the caller; for
/// write/exclusive it is a single-holder record. `ttl_ms` of zero means the
/// record never expires (fallback mode).
#[must_use]
pub fn build_record(
	workspace: &WorkspaceId,
	path: &str,
	kind: LockType,
	agent: &AgentId,
	now_ms: u64,
	ttl_ms: u64,
) -> LockRecord {
	let (lock_id, holder) = if kind.is_exclusive() {
		(
			holder_lock_id(workspace, path, kind),
			LockHolder::Exclusive {
				agent_id: agent.clone(),
			},
		)
	} else {
		(
			reader_lock_id(workspace, path, agent),
			LockHolder::Readers {
				readers: vec![agent.clone()],
			},
		)
	};

	LockRecord {
		lock_id,
		workspace_id: workspace.clone(),
		file_path: path.to_string(),
		holder,
		lock_type: kind,
		timestamp: now_ms,
		ttl_ms,
	}
}
