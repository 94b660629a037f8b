//! Fast-store orchestrator: real-time coordination over Redis.
//!
//! Owns the distributed lock protocol, the agent registry, and publication
//! onto the coordination streams. All authoritative state lives in Redis;
//! this module holds nothing but a connection handle and its own envelope
//! sequence counter. Mutation of lock records is conditional (SET NX PX,
//! scripted compare-and-delete, set addition) so concurrent brokers and
//! callers serialize on the store itself.

mod consumer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agora_proto::{
	AgentId, AgentRecord, AgentStatus, AgentStatusEvent, AgentStatusEventKind, Backend, Envelope,
	FileEdit, LockEvent, LockEventKind, LockId, LockRecord, LockType, MessageKind, Metadata,
	Priority, VoteCast, Waiter, WorkspaceId, now_ms,
};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::config::FastStoreConfig;
use crate::consensus;
use crate::error::{BrokerError, Result};
use crate::events::{BrokerEvent, EventBus};
use crate::lock::{self, AcquireDecision, ParsedLockId};
use crate::store::{Connectable, OpScope, RealtimeStore};

/// Logical stream names, published under the configured prefix.
pub const STREAMS: [&str; 5] = ["locks", "edits", "agents", "workspace", "consensus"];

/// Compare-and-delete of an exclusive lock record: the record is removed only
/// when the stored holder matches the caller.
const RELEASE_EXCLUSIVE: &str = r"
local raw = redis.call('GET', KEYS[1])
if not raw then return 0 end
local ok, rec = pcall(cjson.decode, raw)
if not ok then return 0 end
local holder = rec['holder']
if holder and holder['agent_id'] == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

/// Redis-backed real-time coordinator.
pub struct RedisCoordinator {
	config: FastStoreConfig,
	bus: EventBus,
	conn: Mutex<Option<ConnectionManager>>,
	seq: AtomicU64,
	release_script: redis::Script,
}

impl RedisCoordinator {
	/// Create an unconnected coordinator.
	#[must_use]
	pub fn new(config: FastStoreConfig, bus: EventBus) -> Arc<Self> {
		Arc::new(Self {
			config,
			bus,
			conn: Mutex::new(None),
			seq: AtomicU64::new(0),
			release_script: redis::Script::new(RELEASE_EXCLUSIVE),
		})
	}

	/// The configuration this coordinator runs with.
	#[must_use]
	pub fn config(&self) -> &FastStoreConfig {
		&self.config
	}

	fn handle(&self) -> Result<ConnectionManager> {
		let guard = self.conn.lock().unwrap();
		guard.clone().ok_or(BrokerError::NotConnected {
			backend: Backend::Redis,
		})
	}

	fn next_seq(&self) -> u64 {
		self.seq.fetch_add(1, Ordering::Relaxed) + 1
	}

	fn envelope(&self, kind: MessageKind, scope: &OpScope) -> Envelope {
		let mut metadata = Metadata::new(scope.agent.clone(), scope.workspace.clone());
		metadata.session_id = Some(scope.session_id.clone());
		metadata.sequence_number = self.next_seq();
		Envelope::new(kind, scope.agent.clone(), metadata)
	}

	/// XADD an envelope onto one of the logical streams, duplicating the
	/// header fields for index-free filtering.
	async fn publish(&self, stream: &str, envelope: &Envelope) -> Result<()> {
		let mut conn = self.handle()?;
		let json = serde_json::to_string(envelope)?;

		let mut cmd = redis::cmd("XADD");
		cmd.arg(self.config.stream(stream))
			.arg("*")
			.arg("envelope")
			.arg(&json)
			.arg("type")
			.arg(envelope.kind.as_str())
			.arg("agent_id")
			.arg(envelope.metadata.agent_id.as_str());
		if let Some(correlation) = &envelope.metadata.correlation_id {
			cmd.arg("correlation_id").arg(correlation);
		}

		let id: String = cmd
			.query_async(&mut conn)
			.await
			.inspect_err(|error| self.report_error(error))?;
		tracing::debug!(stream, entry = %id, kind = envelope.kind.as_str(), "published");
		Ok(())
	}

	fn report_error(&self, error: &redis::RedisError) {
		tracing::warn!(%error, "redis operation failed");
		self.bus.emit(BrokerEvent::BackendError {
			backend: Backend::Redis,
			message: error.to_string(),
		});
	}

	async fn publish_lock_event(
		&self,
		scope: &OpScope,
		path: &str,
		kind: LockType,
		lock_id: &LockId,
		event: LockEventKind,
	) {
		let mut env = self.envelope(MessageKind::FileLock, scope);
		env.priority = Priority::High;
		env.metadata.file_path = Some(path.to_string());
		env.metadata.lock_type = Some(kind);
		let payload = LockEvent {
			event,
			lock_id: lock_id.clone(),
			lock_type: kind,
		};
		if env.set_payload(&payload).is_ok() {
			// The lock itself already succeeded; a lost notice is logged,
			// not surfaced.
			let _ = self.publish("locks", &env).await;
		}
	}

	async fn enqueue_waiter(
		&self,
		conn: &mut ConnectionManager,
		workspace: &WorkspaceId,
		path: &str,
		agent: &AgentId,
		kind: LockType,
	) -> Result<()> {
		let key = self.config.waiters_key(workspace.as_str(), path);
		let queued: usize = conn.llen(&key).await.inspect_err(|e| self.report_error(e))?;
		if queued >= self.config.max_pending_messages {
			tracing::warn!(
				workspace = %workspace,
				path,
				queued,
				"waiters queue full; conflicting request dropped from the queue"
			);
			return Ok(());
		}

		let waiter = Waiter {
			agent_id: agent.clone(),
			lock_type: kind,
			enqueued_at: now_ms(),
		};
		let json = serde_json::to_string(&waiter)?;
		let _: usize = conn
			.rpush(&key, json)
			.await
			.inspect_err(|e| self.report_error(e))?;
		Ok(())
	}

	/// Pop one waiter after a successful release and signal it for retry.
	async fn wake_one_waiter(&self, workspace: &WorkspaceId, path: &str) {
		let Ok(mut conn) = self.handle() else { return };
		let key = self.config.waiters_key(workspace.as_str(), path);
		let popped: redis::RedisResult<Option<String>> = conn.lpop(&key, None).await;
		match popped {
			Ok(Some(json)) => match serde_json::from_str::<Waiter>(&json) {
				Ok(waiter) => {
					self.bus.emit(BrokerEvent::LockRetry {
						workspace_id: workspace.clone(),
						file_path: path.to_string(),
						waiter,
					});
				}
				// A stale or corrupt entry is tolerated and skipped.
				Err(error) => tracing::warn!(%error, "discarding unparseable waiter"),
			},
			Ok(None) => {}
			Err(error) => self.report_error(&error),
		}
	}

	async fn read_record(
		&self,
		conn: &mut ConnectionManager,
		key: &str,
	) -> Result<Option<LockRecord>> {
		let raw: Option<String> = conn.get(key).await.inspect_err(|e| self.report_error(e))?;
		match raw {
			None => Ok(None),
			Some(json) => match serde_json::from_str(&json) {
				Ok(record) => Ok(Some(record)),
				Err(error) => {
					// A corrupt record cannot be honored; treat it as absent
					// so the protocol can make progress.
					tracing::warn!(key, %error, "discarding corrupt lock record");
					Ok(None)
				}
			},
		}
	}

	async fn publish_agent_event(
		&self,
		scope: &OpScope,
		event: AgentStatusEventKind,
		status: AgentStatus,
		current_task: Option<String>,
	) {
		let mut env = self.envelope(MessageKind::AgentStatus, scope);
		let payload = AgentStatusEvent {
			event,
			status,
			current_task,
		};
		if env.set_payload(&payload).is_ok() {
			let _ = self.publish("agents", &env).await;
		}
	}
}

impl std::fmt::Debug for RedisCoordinator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RedisCoordinator")
			.field("prefix", &self.config.stream_prefix)
			.field("consumer", &self.config.consumer_name)
			.finish_non_exhaustive()
	}
}

#[async_trait]
impl Connectable for RedisCoordinator {
	async fn connect(&self) -> Result<()> {
		{
			let guard = self.conn.lock().unwrap();
			if guard.is_some() {
				return Ok(());
			}
		}

		let client = redis::Client::open(self.config.url())?;
		let mut manager = ConnectionManager::new(client).await?;

		// Consumer groups are created idempotently at startup.
		for stream in STREAMS {
			let created: redis::RedisResult<String> = redis::cmd("XGROUP")
				.arg("CREATE")
				.arg(self.config.stream(stream))
				.arg(&self.config.consumer_group)
				.arg("$")
				.arg("MKSTREAM")
				.query_async(&mut manager)
				.await;
			match created {
				Ok(_) => {}
				Err(error) if error.to_string().contains("BUSYGROUP") => {}
				Err(error) => return Err(error.into()),
			}
		}

		{
			let mut guard = self.conn.lock().unwrap();
			*guard = Some(manager);
		}
		tracing::info!(url = %self.config.url(), "redis connected");
		self.bus.emit(BrokerEvent::BackendConnected {
			backend: Backend::Redis,
		});
		Ok(())
	}

	async fn disconnect(&self) {
		let had = {
			let mut guard = self.conn.lock().unwrap();
			guard.take().is_some()
		};
		if had {
			self.bus.emit(BrokerEvent::BackendDisconnected {
				backend: Backend::Redis,
			});
		}
	}

	fn backend(&self) -> Backend {
		Backend::Redis
	}
}

#[async_trait]
impl RealtimeStore for RedisCoordinator {
	async fn register_agent(&self, record: AgentRecord) -> Result<()> {
		let mut conn = self.handle()?;
		let agent_key = self.config.agent_key(record.agent_id.as_str());
		let workspace_key = self.config.workspace_key(record.workspace_id.as_str());

		let fields = fields::agent_to_fields(&record)?;
		let _: () = conn
			.hset_multiple(&agent_key, &fields)
			.await
			.inspect_err(|e| self.report_error(e))?;
		let _: () = conn
			.hset(&workspace_key, record.agent_id.as_str(), now_ms())
			.await
			.inspect_err(|e| self.report_error(e))?;

		let scope = OpScope {
			agent: record.agent_id.clone(),
			workspace: record.workspace_id.clone(),
			session_id: String::new(),
		};
		self.publish_agent_event(
			&scope,
			AgentStatusEventKind::Registered,
			record.status,
			record.current_task.clone(),
		)
		.await;
		Ok(())
	}

	async fn update_agent_status(
		&self,
		agent: &AgentId,
		status: AgentStatus,
		current_task: Option<String>,
	) -> Result<()> {
		let mut conn = self.handle()?;
		let agent_key = self.config.agent_key(agent.as_str());

		let known: bool = conn
			.exists(&agent_key)
			.await
			.inspect_err(|e| self.report_error(e))?;
		if !known {
			tracing::debug!(agent = %agent, "status update for unknown agent ignored");
			return Ok(());
		}

		let mut fields: Vec<(&str, String)> = vec![
			("status", status.as_str().to_string()),
			("last_heartbeat", now_ms().to_string()),
		];
		if let Some(task) = &current_task {
			fields.push(("current_task", task.clone()));
		}
		let _: () = conn
			.hset_multiple(&agent_key, &fields)
			.await
			.inspect_err(|e| self.report_error(e))?;

		let workspace: Option<String> = conn
			.hget(&agent_key, "workspace_id")
			.await
			.inspect_err(|e| self.report_error(e))?;
		let scope = OpScope {
			agent: agent.clone(),
			workspace: workspace.unwrap_or_default().into(),
			session_id: String::new(),
		};
		self.publish_agent_event(
			&scope,
			AgentStatusEventKind::StatusChanged,
			status,
			current_task,
		)
		.await;
		Ok(())
	}

	async fn deregister_agent(&self, agent: &AgentId, workspace: &WorkspaceId) -> Result<()> {
		let mut conn = self.handle()?;
		let agent_key = self.config.agent_key(agent.as_str());
		let workspace_key = self.config.workspace_key(workspace.as_str());

		let _: () = conn
			.del(&agent_key)
			.await
			.inspect_err(|e| self.report_error(e))?;
		let _: () = conn
			.hdel(&workspace_key, agent.as_str())
			.await
			.inspect_err(|e| self.report_error(e))?;

		let scope = OpScope {
			agent: agent.clone(),
			workspace: workspace.clone(),
			session_id: String::new(),
		};
		self.publish_agent_event(&scope, AgentStatusEventKind::Deregistered, AgentStatus::Offline, None)
			.await;
		Ok(())
	}

	async fn active_agents(&self, workspace: &WorkspaceId) -> Result<Vec<AgentRecord>> {
		let mut conn = self.handle()?;
		let workspace_key = self.config.workspace_key(workspace.as_str());

		let members: Vec<String> = conn
			.hkeys(&workspace_key)
			.await
			.inspect_err(|e| self.report_error(e))?;

		let mut records = Vec::with_capacity(members.len());
		for agent in members {
			let raw: std::collections::HashMap<String, String> = conn
				.hgetall(self.config.agent_key(&agent))
				.await
				.inspect_err(|e| self.report_error(e))?;
			if let Some(record) = fields::agent_from_fields(&raw) {
				records.push(record);
			}
		}
		Ok(records)
	}

	async fn request_file_lock(
		&self,
		agent: &AgentId,
		workspace: &WorkspaceId,
		path: &str,
		kind: LockType,
	) -> Result<Option<LockId>> {
		let mut conn = self.handle()?;
		let lock_key = self.config.lock_key(workspace.as_str(), path);
		let readers_key = self.config.readers_key(workspace.as_str(), path);
		let now = now_ms();
		let ttl = self.config.lock_timeout_ms;

		let existing = self.read_record(&mut conn, &lock_key).await?;
		let expired_leftover = existing.as_ref().is_some_and(|r| r.is_expired(now));

		// A newcomer read only matters against the queue head when the key is
		// free; skip the extra round trip otherwise.
		let queued_writer_at_head = if kind == LockType::Read {
			let head: Option<String> = redis::cmd("LINDEX")
				.arg(self.config.waiters_key(workspace.as_str(), path))
				.arg(0)
				.query_async(&mut conn)
				.await
				.inspect_err(|e| self.report_error(e))?;
			head.and_then(|json| serde_json::from_str::<Waiter>(&json).ok())
				.is_some_and(|waiter| waiter.lock_type.is_exclusive())
		} else {
			false
		};

		match lock::decide_acquire(existing.as_ref(), kind, now, queued_writer_at_head) {
			AcquireDecision::Install => {
				if expired_leftover {
					// Expired records are treated as absent; clear the debris
					// before installing over it.
					let _: () = conn
						.del(vec![lock_key.clone(), readers_key.clone()])
						.await
						.inspect_err(|e| self.report_error(e))?;
				}

				let record = lock::build_record(workspace, path, kind, agent, now, ttl);
				let json = serde_json::to_string(&record)?;
				let installed: Option<String> = redis::cmd("SET")
					.arg(&lock_key)
					.arg(&json)
					.arg("NX")
					.arg("PX")
					.arg(ttl)
					.query_async(&mut conn)
					.await
					.inspect_err(|e| self.report_error(e))?;

				if installed.is_none() {
					// Lost the install race; queue like any other conflict.
					self.enqueue_waiter(&mut conn, workspace, path, agent, kind).await?;
					return Ok(None);
				}

				if !kind.is_exclusive() {
					let _: () = conn
						.sadd(&readers_key, agent.as_str())
						.await
						.inspect_err(|e| self.report_error(e))?;
					let _: () = redis::cmd("PEXPIRE")
						.arg(&readers_key)
						.arg(ttl)
						.query_async(&mut conn)
						.await
						.inspect_err(|e| self.report_error(e))?;
				}

				let scope = OpScope {
					agent: agent.clone(),
					workspace: workspace.clone(),
					session_id: String::new(),
				};
				self.publish_lock_event(
					&scope,
					path,
					kind,
					&record.lock_id,
					LockEventKind::LockAcquired,
				)
				.await;
				Ok(Some(record.lock_id))
			}
			AcquireDecision::JoinReaders => {
				// Idempotent join: a re-entrant reader is a no-op success.
				let _: () = conn
					.sadd(&readers_key, agent.as_str())
					.await
					.inspect_err(|e| self.report_error(e))?;
				let _: () = redis::cmd("PEXPIRE")
					.arg(&readers_key)
					.arg(ttl)
					.query_async(&mut conn)
					.await
					.inspect_err(|e| self.report_error(e))?;

				let lock_id = lock::reader_lock_id(workspace, path, agent);
				let scope = OpScope {
					agent: agent.clone(),
					workspace: workspace.clone(),
					session_id: String::new(),
				};
				self.publish_lock_event(&scope, path, kind, &lock_id, LockEventKind::LockAcquired)
					.await;
				Ok(Some(lock_id))
			}
			AcquireDecision::Conflict => {
				self.enqueue_waiter(&mut conn, workspace, path, agent, kind).await?;
				Ok(None)
			}
		}
	}

	async fn release_file_lock(&self, lock_id: &LockId, agent: &AgentId) -> Result<bool> {
		let Some(parsed) = lock::parse_lock_id(lock_id) else {
			return Ok(false);
		};
		let mut conn = self.handle()?;

		let (workspace, path, kind, released) = match parsed {
			ParsedLockId::Reader { workspace, path, agent: slot } => {
				if slot != *agent {
					return Ok(false);
				}
				let readers_key = self.config.readers_key(workspace.as_str(), &path);
				let removed: usize = conn
					.srem(&readers_key, agent.as_str())
					.await
					.inspect_err(|e| self.report_error(e))?;
				if removed == 0 {
					return Ok(false);
				}

				let remaining: usize = conn
					.scard(&readers_key)
					.await
					.inspect_err(|e| self.report_error(e))?;
				if remaining == 0 {
					let lock_key = self.config.lock_key(workspace.as_str(), &path);
					let _: () = conn
						.del(vec![lock_key, readers_key])
						.await
						.inspect_err(|e| self.report_error(e))?;
				}
				(workspace, path, LockType::Read, true)
			}
			ParsedLockId::Holder { workspace, path, kind } => {
				let lock_key = self.config.lock_key(workspace.as_str(), &path);
				let released: i64 = self
					.release_script
					.key(&lock_key)
					.arg(agent.as_str())
					.invoke_async(&mut conn)
					.await
					.inspect_err(|e| self.report_error(e))?;
				if released == 0 {
					tracing::warn!(
						lock = lock_id.as_str(),
						agent = %agent,
						"unauthorized or stale release refused"
					);
					return Ok(false);
				}
				(workspace, path, kind, true)
			}
		};

		if released {
			let scope = OpScope {
				agent: agent.clone(),
				workspace: workspace.clone(),
				session_id: String::new(),
			};
			self.publish_lock_event(&scope, &path, kind, lock_id, LockEventKind::LockReleased)
				.await;
			self.wake_one_waiter(&workspace, &path).await;
		}
		Ok(released)
	}

	async fn publish_file_edit(&self, scope: &OpScope, edit: FileEdit) -> Result<()> {
		let mut env = self.envelope(MessageKind::FileEdit, scope);
		env.metadata.file_path = Some(edit.file_path.clone());
		env.set_payload(&edit)?;
		self.publish("edits", &env).await
	}

	async fn publish_consensus_vote(&self, scope: &OpScope, vote: VoteCast) -> Result<()> {
		let mut env = self.envelope(MessageKind::ConsensusVote, scope);
		env.metadata.correlation_id = Some(consensus::correlation_id(&vote.proposal_id));
		env.metadata.consensus_round = Some(consensus::round_of(&vote.proposal_id));
		env.set_payload(&vote)?;
		self.publish("consensus", &env).await
	}

	async fn publish_workspace_event(
		&self,
		scope: &OpScope,
		payload: serde_json::Map<String, serde_json::Value>,
	) -> Result<()> {
		let mut env = self.envelope(MessageKind::WorkspaceEvent, scope);
		env.payload = payload;
		self.publish("workspace", &env).await
	}
}

/// Agent registry rows are stored as flat Redis hashes; this maps them to and
/// from [`AgentRecord`].
mod fields {
	use std::collections::HashMap;

	use agora_proto::{AgentRecord, AgentStatus};

	use crate::error::Result;

	pub fn agent_to_fields(record: &AgentRecord) -> Result<Vec<(&'static str, String)>> {
		let mut fields = vec![
			("agent_id", record.agent_id.to_string()),
			("name", record.name.clone()),
			("model", record.model.clone()),
			("capabilities", serde_json::to_string(&record.capabilities)?),
			("workspace_id", record.workspace_id.to_string()),
			("status", record.status.as_str().to_string()),
			("registered_at", record.registered_at.to_string()),
			("last_heartbeat", record.last_heartbeat.to_string()),
		];
		if let Some(task) = &record.current_task {
			fields.push(("current_task", task.clone()));
		}
		Ok(fields)
	}

	pub fn agent_from_fields(raw: &HashMap<String, String>) -> Option<AgentRecord> {
		Some(AgentRecord {
			agent_id: raw.get("agent_id")?.as_str().into(),
			name: raw.get("name")?.clone(),
			model: raw.get("model").cloned().unwrap_or_default(),
			capabilities: raw
				.get("capabilities")
				.and_then(|json| serde_json::from_str(json).ok())
				.unwrap_or_default(),
			workspace_id: raw.get("workspace_id")?.as_str().into(),
			status: raw
				.get("status")
				.and_then(|s| AgentStatus::parse(s))
				.unwrap_or(AgentStatus::Offline),
			current_task: raw.get("current_task").cloned(),
			registered_at: raw.get("registered_at")?.parse().ok()?,
			last_heartbeat: raw.get("last_heartbeat")?.parse().ok()?,
		})
	}

}
