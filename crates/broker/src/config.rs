//! Broker configuration: parsing, defaults, and load-time validation.
//!
//! Configuration is a TOML file with one table per subsystem. Every field has
//! a serde default so a minimal file only names what it overrides; the
//! load-time invariants (non-empty host, at least one broker, sane
//! thresholds) are enforced by [`BrokerConfig::validate`] before anything
//! connects.

use std::path::{Path, PathBuf};

use agora_proto::DecisionMethod;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Reading the file failed.
	#[error("I/O error reading {path}: {error}")]
	Io {
		/// Path that failed to read.
		path: PathBuf,
		/// Underlying error.
		error: std::io::Error,
	},

	/// The file is not valid TOML for this schema.
	#[error("TOML parse error: {0}")]
	Toml(#[from] toml::de::Error),

	/// A value violates a load-time invariant.
	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Top-level broker configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
	/// Fast-store (Redis) settings.
	pub fast_store: FastStoreConfig,
	/// Durable-store (Kafka) settings.
	pub durable_store: DurableStoreConfig,
	/// Health and reconnect supervision settings.
	pub supervisor: SupervisorConfig,
	/// Workspace policy limits.
	pub workspace: WorkspaceConfig,
	/// Consensus tuning.
	pub consensus: ConsensusConfig,
	/// Coordination policy toggles.
	pub security: SecurityConfig,
}

impl BrokerConfig {
	/// Parse a TOML string into a validated configuration.
	pub fn parse(input: &str) -> Result<Self> {
		let config: Self = toml::from_str(input)?;
		config.validate()?;
		Ok(config)
	}

	/// Load and validate a configuration file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let input = std::fs::read_to_string(path).map_err(|error| ConfigError::Io {
			path: path.to_path_buf(),
			error,
		})?;
		Self::parse(&input)
	}

	/// Enforce the load-time invariants.
	///
	/// Configuration errors are fatal at startup; nothing here is ever
	/// re-checked at runtime.
	pub fn validate(&self) -> Result<()> {
		if self.fast_store.host.trim().is_empty() {
			return Err(ConfigError::Invalid("fast_store.host must not be empty".into()));
		}
		if self.durable_store.brokers.is_empty() {
			return Err(ConfigError::Invalid(
				"durable_store.brokers needs at least one broker".into(),
			));
		}
		if self.workspace.max_agents_per_workspace < 1 {
			return Err(ConfigError::Invalid(
				"workspace.max_agents_per_workspace must be at least 1".into(),
			));
		}
		if !(0.0..=1.0).contains(&self.consensus.majority_threshold) {
			return Err(ConfigError::Invalid(
				"consensus.majority_threshold must be within [0, 1]".into(),
			));
		}
		if self.workspace.root.trim().is_empty() {
			return Err(ConfigError::Invalid("workspace.root must not be empty".into()));
		}
		if self.supervisor.reconnect_attempts < 1 {
			return Err(ConfigError::Invalid(
				"supervisor.reconnect_attempts must be at least 1".into(),
			));
		}
		Ok(())
	}
}

/// Fast-store (Redis) connection and stream settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FastStoreConfig {
	/// Redis host.
	pub host: String,
	/// Redis port.
	pub port: u16,
	/// Optional AUTH password.
	pub password: Option<String>,
	/// Database index.
	pub db: u32,
	/// Prefix for every key and stream this broker touches.
	pub stream_prefix: String,
	/// Consumer group for the stream loops.
	pub consumer_group: String,
	/// Consumer name within the group; also names the heartbeat key.
	pub consumer_name: String,
	/// Batch size per stream read, and the cap on each waiters queue.
	pub max_pending_messages: usize,
	/// Heartbeat refresh period.
	pub heartbeat_interval_ms: u64,
	/// TTL written on every lock record.
	pub lock_timeout_ms: u64,
	/// Stream entries older than this are trimmed.
	pub message_retention_ms: u64,
}

impl Default for FastStoreConfig {
	fn default() -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port: 6379,
			password: None,
			db: 0,
			stream_prefix: "agora".to_string(),
			consumer_group: "agora-brokers".to_string(),
			consumer_name: "broker-0".to_string(),
			max_pending_messages: 100,
			heartbeat_interval_ms: 5_000,
			lock_timeout_ms: 30_000,
			message_retention_ms: 3_600_000,
		}
	}
}

impl FastStoreConfig {
	/// Connection URL in the form redis expects.
	#[must_use]
	pub fn url(&self) -> String {
		match &self.password {
			Some(password) => {
				format!("redis://:{password}@{}:{}/{}", self.host, self.port, self.db)
			}
			None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
		}
	}

	/// Key of the lock record for a file.
	#[must_use]
	pub fn lock_key(&self, workspace: &str, path: &str) -> String {
		format!("{}:state:locks:{workspace}:{path}", self.stream_prefix)
	}

	/// Key of the readers set companion to a lock record.
	#[must_use]
	pub fn readers_key(&self, workspace: &str, path: &str) -> String {
		format!("{}:state:locks:{workspace}:{path}:readers", self.stream_prefix)
	}

	/// Key of the waiters queue for a file.
	#[must_use]
	pub fn waiters_key(&self, workspace: &str, path: &str) -> String {
		format!("{}:state:edit_queue:{workspace}:{path}", self.stream_prefix)
	}

	/// Key of an agent registry row.
	#[must_use]
	pub fn agent_key(&self, agent: &str) -> String {
		format!("{}:state:agents:{agent}", self.stream_prefix)
	}

	/// Key of a workspace registry row.
	#[must_use]
	pub fn workspace_key(&self, workspace: &str) -> String {
		format!("{}:state:workspace:{workspace}", self.stream_prefix)
	}

	/// Key of this consumer's heartbeat.
	#[must_use]
	pub fn heartbeat_key(&self) -> String {
		format!("{}:heartbeat:{}", self.stream_prefix, self.consumer_name)
	}

	/// Full name of one of the logical streams.
	#[must_use]
	pub fn stream(&self, name: &str) -> String {
		format!("{}:{name}", self.stream_prefix)
	}
}

/// SASL mechanism for the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
	/// SASL/PLAIN.
	#[serde(rename = "plain")]
	Plain,
	/// SCRAM-SHA-256.
	#[serde(rename = "scram-256")]
	Scram256,
	/// SCRAM-SHA-512.
	#[serde(rename = "scram-512")]
	Scram512,
}

impl SaslMechanism {
	/// librdkafka name of the mechanism.
	#[must_use]
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Plain => "PLAIN",
			Self::Scram256 => "SCRAM-SHA-256",
			Self::Scram512 => "SCRAM-SHA-512",
		}
	}
}

/// SASL credentials for the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableAuth {
	/// Mechanism to authenticate with.
	pub mechanism: SaslMechanism,
	/// SASL username.
	pub user: String,
	/// SASL password.
	pub pass: String,
}

/// Producer retry tuning for the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	/// First backoff.
	pub initial_ms: u64,
	/// Send retries before a produce fails.
	pub retries: u32,
	/// Backoff ceiling.
	pub max_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			initial_ms: 100,
			retries: 5,
			max_ms: 5_000,
		}
	}
}

/// Producer batching tuning for the durable store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
	/// Messages per producer batch.
	pub size: u32,
	/// How long the producer lingers to fill a batch.
	pub linger_ms: u64,
}

impl Default for BatchConfig {
	fn default() -> Self {
		Self {
			size: 100,
			linger_ms: 10,
		}
	}
}

/// Durable-store (Kafka) connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurableStoreConfig {
	/// Client id reported to the cluster.
	pub client_id: String,
	/// Bootstrap brokers, `host:port`.
	pub brokers: Vec<String>,
	/// Whether to connect over TLS.
	pub ssl: bool,
	/// Optional SASL credentials.
	pub auth: Option<DurableAuth>,
	/// Consumer group id for the audit tail.
	pub group_id: String,
	/// Consumer session timeout.
	pub session_timeout_ms: u64,
	/// Consumer heartbeat period.
	pub heartbeat_interval_ms: u64,
	/// Producer retry tuning.
	pub retry: RetryConfig,
	/// Producer batching tuning.
	pub batch: BatchConfig,
}

impl Default for DurableStoreConfig {
	fn default() -> Self {
		Self {
			client_id: "agora-broker".to_string(),
			brokers: vec!["127.0.0.1:9092".to_string()],
			ssl: false,
			auth: None,
			group_id: "agora-audit".to_string(),
			session_timeout_ms: 30_000,
			heartbeat_interval_ms: 3_000,
			retry: RetryConfig::default(),
			batch: BatchConfig::default(),
		}
	}
}

/// Where lock coordination goes when the fast store is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackMode {
	/// In-process lock manager.
	#[default]
	Memory,
	/// Accepted for compatibility; behaves as `memory`. Locks are
	/// meaningless across a restart without TTLs, so nothing is persisted.
	File,
	/// Lock requests fail outright while the fast store is down.
	Disabled,
}

/// Health and reconnect supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
	/// Fallback behavior while the fast store is down.
	pub fallback_mode: FallbackMode,
	/// Period of the health-check stamp timer.
	pub health_check_interval_ms: u64,
	/// Consecutive reconnect attempts per backend before giving up.
	pub reconnect_attempts: u32,
	/// Base reconnect delay; attempt `n` waits `n` times this.
	pub reconnect_delay_ms: u64,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			fallback_mode: FallbackMode::Memory,
			health_check_interval_ms: 10_000,
			reconnect_attempts: 5,
			reconnect_delay_ms: 1_000,
		}
	}
}

/// Workspace policy limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
	/// Workspace root path agents operate under.
	pub root: String,
	/// Registration cap per workspace.
	pub max_agents_per_workspace: u32,
	/// File-count cap per workspace.
	pub max_files_per_workspace: u32,
	/// Largest edit payload accepted.
	pub max_file_size_bytes: u64,
	/// Concurrent edit cap per workspace.
	pub max_concurrent_edits: u32,
	/// Longest a session may run.
	pub max_session_duration_ms: u64,
	/// Lock TTL from the caller's perspective.
	pub lock_timeout_ms: u64,
	/// How long a consensus round may stay open.
	pub consensus_timeout_ms: u64,
}

impl Default for WorkspaceConfig {
	fn default() -> Self {
		Self {
			root: "./workspace".to_string(),
			max_agents_per_workspace: 16,
			max_files_per_workspace: 10_000,
			max_file_size_bytes: 10 * 1024 * 1024,
			max_concurrent_edits: 32,
			max_session_duration_ms: 4 * 3_600_000,
			lock_timeout_ms: 30_000,
			consensus_timeout_ms: 120_000,
		}
	}
}

/// Consensus tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
	/// Method recorded on decisions when the caller names none.
	pub default_method: DecisionMethod,
	/// Majority fraction required to close a weighted round.
	pub majority_threshold: f64,
	/// Weighting strategy name, interpreted above the broker.
	pub weighting_strategy: String,
	/// How long to wait for votes.
	pub vote_timeout_ms: u64,
	/// Re-vote rounds before a proposal is abandoned.
	pub max_rounds: u32,
	/// What callers do with a deadlock, interpreted above the broker.
	pub deadlock_resolution: String,
}

impl Default for ConsensusConfig {
	fn default() -> Self {
		Self {
			default_method: DecisionMethod::Majority,
			majority_threshold: 0.5,
			weighting_strategy: "equal".to_string(),
			vote_timeout_ms: 60_000,
			max_rounds: 3,
			deadlock_resolution: "defer".to_string(),
		}
	}
}

/// Coordination policy toggles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
	/// When false, every lock request is granted locally without
	/// coordination.
	pub enable_file_locking: bool,
	/// When false, lock and edit operations skip their edit-history mirror.
	pub enable_edit_history: bool,
	/// When false, decisions, conflicts, and snapshots are not persisted.
	pub enable_audit_logging: bool,
	/// Hard ceiling on lock TTLs.
	pub max_lock_duration_ms: u64,
	/// Whether readers may share a file at all.
	pub allow_concurrent_reads: bool,
	/// Reserved: the broker currently trusts supplied agent ids.
	pub require_agent_auth: bool,
}

impl Default for SecurityConfig {
	fn default() -> Self {
		Self {
			enable_file_locking: true,
			enable_edit_history: true,
			enable_audit_logging: true,
			max_lock_duration_ms: 300_000,
			allow_concurrent_reads: true,
			require_agent_auth: false,
		}
	}
}
