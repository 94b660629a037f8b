//! In-process fallback lock manager.
//!
//! Used only while the fast store is unreachable. Same read/write/exclusive
//! semantics as the distributed protocol, against a local map. No waiters
//! queue and no TTLs: this is a degraded mode, not a replacement. When the
//! fast store recovers, locks taken here are not migrated; they are orphaned
//! and vanish as their holders release them.

use std::collections::HashMap;
use std::sync::Mutex;

use agora_proto::{AgentId, LockHolder, LockId, LockRecord, LockType, WorkspaceId, now_ms};

use crate::lock::{self, AcquireDecision, ParsedLockId};

/// Process-local lock table keyed by `(workspace, path)`.
#[derive(Debug, Default)]
pub struct FallbackLockManager {
	locks: Mutex<HashMap<(WorkspaceId, String), LockRecord>>,
}

impl FallbackLockManager {
	/// Create an empty manager.
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Try to take a lock; `None` means the request conflicts.
	///
	/// Conflicting requests are not queued here; the caller retries on its
	/// own schedule while the broker is degraded.
	pub fn acquire(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
	) -> Option<LockId> {
		let mut locks = self.locks.lock().unwrap();
		let key = (workspace.clone(), path.to_string());

		match lock::decide_acquire(locks.get(&key), kind, now_ms(), false) {
			AcquireDecision::Install => {
				// ttl 0: fallback records live until released.
				let record = lock::build_record(workspace, path, kind, agent, now_ms(), 0);
				let lock_id = record.lock_id.clone();
				locks.insert(key, record);
				Some(lock_id)
			}
			AcquireDecision::JoinReaders => {
				let record = locks.get_mut(&key)?;
				let LockHolder::Readers { readers } = &mut record.holder else {
					return None;
				};
				if !readers.contains(agent) {
					readers.push(agent.clone());
				}
				Some(lock::reader_lock_id(workspace, path, agent))
			}
			AcquireDecision::Conflict => None,
		}
	}

	/// Release a lock previously taken here.
	///
	/// Returns false when the lock id does not decode, the caller is not the
	/// recorded holder, or nothing is held.
	pub fn release(&self, lock_id: &LockId, agent: &AgentId) -> bool {
		let Some(parsed) = lock::parse_lock_id(lock_id) else {
			return false;
		};

		let mut locks = self.locks.lock().unwrap();
		match parsed {
			ParsedLockId::Reader { workspace, path, agent: slot } => {
				if slot != *agent {
					return false;
				}
				let key = (workspace, path);
				let mut removed = false;
				let mut emptied = false;
				if let Some(record) = locks.get_mut(&key)
					&& let LockHolder::Readers { readers } = &mut record.holder
					&& let Some(at) = readers.iter().position(|r| r == agent)
				{
					readers.remove(at);
					removed = true;
					emptied = readers.is_empty();
				}
				if emptied {
					locks.remove(&key);
				}
				removed
			}
			ParsedLockId::Holder { workspace, path, .. } => {
				let key = (workspace, path);
				let held_by_caller = matches!(
					locks.get(&key).map(|r| &r.holder),
					Some(LockHolder::Exclusive { agent_id }) if agent_id == agent
				);
				if held_by_caller {
					locks.remove(&key);
				}
				held_by_caller
			}
		}
	}

	/// Number of records currently held; used by tests and diagnostics.
	#[must_use]
	pub fn held(&self) -> usize {
		self.locks.lock().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ws() -> WorkspaceId {
		"ws-1".into()
	}

	fn agent(name: &str) -> AgentId {
		name.into()
	}

	#[test]
	fn exclusive_write_then_release_then_reacquire() {
		let locks = FallbackLockManager::new();
		let id = locks.acquire(&agent("a"), &ws(), "/f", LockType::Write).unwrap();

		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Write).is_none());
		assert!(locks.release(&id, &agent("a")));
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Write).is_some());
	}

	#[test]
	fn readers_share_and_record_frees_on_last_release() {
		let locks = FallbackLockManager::new();
		let ids: Vec<_> = ["a", "b", "c"]
			.into_iter()
			.map(|name| {
				locks
					.acquire(&agent(name), &ws(), "/f", LockType::Read)
					.expect("reader should be admitted")
			})
			.collect();
		assert_eq!(locks.held(), 1);

		assert!(locks.release(&ids[0], &agent("a")));
		assert!(locks.release(&ids[1], &agent("b")));
		assert_eq!(locks.held(), 1, "record survives while a reader remains");
		assert!(locks.release(&ids[2], &agent("c")));
		assert_eq!(locks.held(), 0);
	}

	#[test]
	fn writer_blocked_while_any_reader_holds() {
		let locks = FallbackLockManager::new();
		let read_id = locks.acquire(&agent("a"), &ws(), "/f", LockType::Read).unwrap();
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Write).is_none());
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Exclusive).is_none());

		assert!(locks.release(&read_id, &agent("a")));
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Write).is_some());
	}

	#[test]
	fn release_by_non_holder_is_refused() {
		let locks = FallbackLockManager::new();
		let id = locks.acquire(&agent("a"), &ws(), "/f", LockType::Exclusive).unwrap();

		assert!(!locks.release(&id, &agent("b")));
		// The lock is still held.
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Write).is_none());
		assert!(locks.release(&id, &agent("a")));
	}

	#[test]
	fn reader_release_by_non_member_is_refused() {
		let locks = FallbackLockManager::new();
		let id = locks.acquire(&agent("a"), &ws(), "/f", LockType::Read).unwrap();

		// b never joined; neither its own slot id nor a's id works.
		let forged = crate::lock::reader_lock_id(&ws(), "/f", &agent("b"));
		assert!(!locks.release(&forged, &agent("b")));
		assert!(!locks.release(&id, &agent("b")));
		assert!(locks.release(&id, &agent("a")));
	}

	#[test]
	fn reentrant_reader_is_a_noop_success() {
		let locks = FallbackLockManager::new();
		let first = locks.acquire(&agent("a"), &ws(), "/f", LockType::Read).unwrap();
		let second = locks.acquire(&agent("a"), &ws(), "/f", LockType::Read).unwrap();
		assert_eq!(first, second);

		// One release is enough; the set held a single slot.
		assert!(locks.release(&first, &agent("a")));
		assert_eq!(locks.held(), 0);
	}

	#[test]
	fn reader_named_after_a_lock_kind_can_release_its_slot() {
		let locks = FallbackLockManager::new();
		for name in ["write", "exclusive"] {
			let id = locks.acquire(&agent(name), &ws(), "/f", LockType::Read).unwrap();
			assert!(locks.release(&id, &agent(name)));
			assert_eq!(locks.held(), 0);
		}
	}

	#[test]
	fn read_blocked_by_exclusive_holder() {
		let locks = FallbackLockManager::new();
		locks.acquire(&agent("a"), &ws(), "/f", LockType::Write).unwrap();
		assert!(locks.acquire(&agent("b"), &ws(), "/f", LockType::Read).is_none());
	}

	#[test]
	fn workspaces_are_independent() {
		let locks = FallbackLockManager::new();
		locks.acquire(&agent("a"), &ws(), "/f", LockType::Write).unwrap();
		assert!(
			locks
				.acquire(&agent("b"), &"ws-2".into(), "/f", LockType::Write)
				.is_some()
		);
	}
}
