//! Agent registry routing through the bridge.

use agora_proto::{AgentProfile, AgentStatus, CoordinationKind, Coordination};

use super::helpers::{Harness, agent, ws};
use crate::audit::topics;
use crate::config::BrokerConfig;

fn profile(name: &str) -> AgentProfile {
	AgentProfile {
		agent_id: name.into(),
		name: format!("{name}-display"),
		model: "sonnet".to_string(),
		capabilities: ["rust"].into_iter().map(String::from).collect(),
	}
}

#[tokio::test(flavor = "current_thread")]
async fn register_routes_to_registry_and_audit() {
	let h = Harness::new();
	h.bridge.register_agent(profile("a"), &ws(), None).await;

	let record = h.realtime.agent(&agent("a")).expect("registry row written");
	assert_eq!(record.status, AgentStatus::Active);
	assert_eq!(record.workspace_id, ws());

	let entries = h.audit.entries_on(topics::AGENT_COORDINATION);
	assert_eq!(entries.len(), 1);
	let coordination: Coordination =
		serde_json::from_value(entries[0].payload.clone()).unwrap();
	assert_eq!(coordination.kind, CoordinationKind::Synchronization);
	assert_eq!(coordination.task, "agent_registration");
}

#[tokio::test(flavor = "current_thread")]
async fn reregistering_is_idempotent_with_latest_fields() {
	let h = Harness::new();
	h.bridge.register_agent(profile("a"), &ws(), None).await;

	let mut updated = profile("a");
	updated.model = "opus".to_string();
	h.bridge.register_agent(updated, &ws(), None).await;

	let agents = h.bridge.get_active_agents(&ws()).await;
	assert_eq!(agents.len(), 1, "one record per agent id");
	assert_eq!(agents[0].model, "opus", "latest call wins");
}

#[tokio::test(flavor = "current_thread")]
async fn capacity_cap_refuses_registration() {
	let mut config = BrokerConfig::default();
	config.workspace.max_agents_per_workspace = 1;
	let h = Harness::with_config(config);

	h.bridge.register_agent(profile("a"), &ws(), None).await;
	h.bridge.register_agent(profile("b"), &ws(), None).await;

	assert!(h.realtime.agent(&agent("a")).is_some());
	assert!(h.realtime.agent(&agent("b")).is_none(), "cap of one holds");
	// The refused registration never reaches the audit plane either.
	assert_eq!(h.audit.entries_on(topics::AGENT_COORDINATION).len(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn status_updates_mutate_the_row_and_drop_when_down() {
	let h = Harness::new();
	h.bridge.register_agent(profile("a"), &ws(), None).await;

	h.bridge
		.update_agent_status(
			&agent("a"),
			&ws(),
			AgentStatus::Busy,
			Some("refactoring".to_string()),
		)
		.await;
	let record = h.realtime.agent(&agent("a")).unwrap();
	assert_eq!(record.status, AgentStatus::Busy);
	assert_eq!(record.current_task.as_deref(), Some("refactoring"));

	h.take_redis_down();
	h.bridge
		.update_agent_status(&agent("a"), &ws(), AgentStatus::Idle, None)
		.await;
	// Dropped silently: the last written state survives.
	assert_eq!(h.realtime.agent(&agent("a")).unwrap().status, AgentStatus::Busy);
}

#[tokio::test(flavor = "current_thread")]
async fn deregister_removes_the_row_and_logs() {
	let h = Harness::new();
	h.bridge.register_agent(profile("a"), &ws(), None).await;
	h.bridge.deregister_agent(&agent("a"), &ws(), None).await;

	assert!(h.realtime.agent(&agent("a")).is_none());
	let tasks: Vec<String> = h
		.audit
		.entries_on(topics::AGENT_COORDINATION)
		.iter()
		.map(|e| {
			serde_json::from_value::<Coordination>(e.payload.clone())
				.unwrap()
				.task
		})
		.collect();
	assert_eq!(tasks, ["agent_registration", "agent_deregistration"]);
}

#[tokio::test(flavor = "current_thread")]
async fn registration_survives_fast_store_outage_durable_only() {
	let h = Harness::new();
	h.take_redis_down();
	h.bridge.register_agent(profile("a"), &ws(), None).await;

	assert!(h.realtime.agent(&agent("a")).is_none(), "registry skipped");
	assert_eq!(
		h.audit.entries_on(topics::AGENT_COORDINATION).len(),
		1,
		"audit entry still written"
	);
	assert!(h.bridge.get_active_agents(&ws()).await.is_empty());
}
