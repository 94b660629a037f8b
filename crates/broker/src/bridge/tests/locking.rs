//! Lock protocol scenarios through the bridge.

use agora_proto::{LockEvent, LockEventKind, LockType, Vote};

use super::helpers::{Harness, agent, ws};
use crate::bridge::OperationKind;
use crate::config::{BrokerConfig, FallbackMode};
use crate::events::BrokerEvent;

#[tokio::test(flavor = "current_thread")]
async fn exclusive_write_then_release_then_reacquire() {
	let h = Harness::new();

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await
		.expect("write lock on a free file");

	assert!(h.bridge.release_file_lock(&lock, &agent("a"), None).await);

	let again = h
		.bridge
		.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(again.is_some());

	// The lock stream saw acquired, released, acquired, in order.
	let events: Vec<LockEventKind> = h
		.realtime
		.published_on("locks")
		.iter()
		.map(|env| env.payload_as::<LockEvent>().unwrap().event)
		.collect();
	assert_eq!(
		events,
		[
			LockEventKind::LockAcquired,
			LockEventKind::LockReleased,
			LockEventKind::LockAcquired,
		]
	);
}

#[tokio::test(flavor = "current_thread")]
async fn three_readers_share_and_teardown() {
	let h = Harness::new();

	let mut ids = Vec::new();
	for name in ["a", "b", "c"] {
		let id = h
			.bridge
			.request_file_lock(&agent(name), &ws(), "/f", LockType::Read, None)
			.await
			.expect("readers share");
		ids.push((name, id));
	}
	assert!(h.realtime.holds_record(&ws(), "/f"));

	for (name, id) in &ids[..2] {
		assert!(h.bridge.release_file_lock(id, &agent(name), None).await);
		assert!(h.realtime.holds_record(&ws(), "/f"));
	}
	let (name, id) = &ids[2];
	assert!(h.bridge.release_file_lock(id, &agent(name), None).await);
	assert!(!h.realtime.holds_record(&ws(), "/f"));
}

#[tokio::test(flavor = "current_thread")]
async fn writer_blocked_by_readers_is_queued_and_retried() {
	let h = Harness::new();
	let mut rx = h.bus.subscribe();

	let read = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Read, None)
		.await
		.unwrap();

	let write = h
		.bridge
		.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(write.is_none());
	assert_eq!(h.realtime.queued_waiters(&ws(), "/f"), 1);

	assert!(h.bridge.release_file_lock(&read, &agent("a"), None).await);

	// Exactly one retry signal, carrying the queued writer.
	let mut retries = 0;
	while let Ok(event) = rx.try_recv() {
		if let BrokerEvent::LockRetry { waiter, file_path, .. } = event {
			assert_eq!(file_path, "/f");
			assert_eq!(waiter.agent_id, agent("b"));
			assert_eq!(waiter.lock_type, LockType::Write);
			retries += 1;
		}
	}
	assert_eq!(retries, 1);

	// The woken writer re-requests and now succeeds.
	let write = h
		.bridge
		.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(write.is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn waiters_are_woken_fifo_one_per_release() {
	let h = Harness::new();
	let mut rx = h.bus.subscribe();

	let first = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await
		.unwrap();
	for name in ["b", "c"] {
		assert!(
			h.bridge
				.request_file_lock(&agent(name), &ws(), "/f", LockType::Write, None)
				.await
				.is_none()
		);
	}
	assert_eq!(h.realtime.queued_waiters(&ws(), "/f"), 2);

	assert!(h.bridge.release_file_lock(&first, &agent("a"), None).await);

	let mut woken = Vec::new();
	while let Ok(event) = rx.try_recv() {
		if let BrokerEvent::LockRetry { waiter, .. } = event {
			woken.push(waiter.agent_id);
		}
	}
	assert_eq!(woken, vec![agent("b")]);
}

#[tokio::test(flavor = "current_thread")]
async fn newcomer_read_cannot_steal_an_empty_key_from_a_queued_writer() {
	let h = Harness::new();

	let held = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await
		.unwrap();
	for name in ["b", "c"] {
		assert!(
			h.bridge
				.request_file_lock(&agent(name), &ws(), "/f", LockType::Write, None)
				.await
				.is_none()
		);
	}

	// Release wakes b; c is still queued at the head when the reader arrives.
	assert!(h.bridge.release_file_lock(&held, &agent("a"), None).await);
	assert!(
		h.bridge
			.request_file_lock(&agent("d"), &ws(), "/f", LockType::Read, None)
			.await
			.is_none(),
		"the reader queues behind the pending writer"
	);

	// The woken writer takes the key on its retry.
	assert!(
		h.bridge
			.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
			.await
			.is_some()
	);
}

#[tokio::test(flavor = "current_thread")]
async fn unauthorized_release_leaves_the_lock_held() {
	let h = Harness::new();

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Exclusive, None)
		.await
		.unwrap();

	assert!(!h.bridge.release_file_lock(&lock, &agent("b"), None).await);
	assert!(
		h.bridge
			.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
			.await
			.is_none()
	);
	assert!(h.bridge.release_file_lock(&lock, &agent("a"), None).await);
}

#[tokio::test(flavor = "current_thread")]
async fn fast_store_outage_degrades_to_fallback_locks() {
	let h = Harness::new();
	h.take_redis_down();

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await
		.expect("fallback grants while the fast store is down");

	// Same exclusion semantics locally.
	assert!(
		h.bridge
			.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
			.await
			.is_none()
	);
	assert!(h.bridge.release_file_lock(&lock, &agent("a"), None).await);
	assert!(!h.realtime.holds_record(&ws(), "/f"));
}

#[tokio::test(flavor = "current_thread")]
async fn realtime_errors_fall_back_without_surfacing() {
	let h = Harness::new();
	// Health still reports redis up, but calls fail: the bridge tolerates
	// the error and degrades to the fallback manager.
	h.realtime
		.fail_all
		.store(true, std::sync::atomic::Ordering::SeqCst);

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(lock.is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn disabled_fallback_refuses_while_down() {
	let mut config = BrokerConfig::default();
	config.supervisor.fallback_mode = FallbackMode::Disabled;
	let h = Harness::with_config(config);
	h.take_redis_down();

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(lock.is_none());
}

#[tokio::test(flavor = "current_thread")]
async fn disabled_locking_grants_without_coordination() {
	let mut config = BrokerConfig::default();
	config.security.enable_file_locking = false;
	let h = Harness::with_config(config);

	let first = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await;
	let second = h
		.bridge
		.request_file_lock(&agent("b"), &ws(), "/f", LockType::Write, None)
		.await;
	assert!(first.is_some() && second.is_some());
	assert!(!h.realtime.holds_record(&ws(), "/f"));
}

#[tokio::test(flavor = "current_thread")]
async fn disallowed_concurrent_reads_compete_as_writes() {
	let mut config = BrokerConfig::default();
	config.security.allow_concurrent_reads = false;
	let h = Harness::with_config(config);

	let first = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Read, None)
		.await;
	assert!(first.is_some());
	let second = h
		.bridge
		.request_file_lock(&agent("b"), &ws(), "/f", LockType::Read, None)
		.await;
	assert!(second.is_none(), "reads exclude each other when sharing is off");
}

#[tokio::test(flavor = "current_thread")]
async fn lock_operations_emit_workspace_operations() {
	let h = Harness::new();
	let mut rx = h.bus.subscribe();

	let lock = h
		.bridge
		.request_file_lock(&agent("a"), &ws(), "/f", LockType::Write, None)
		.await
		.unwrap();
	h.bridge.release_file_lock(&lock, &agent("a"), None).await;
	h.bridge
		.publish_consensus_vote(
			&agent("a"),
			&ws(),
			agora_proto::VoteCast {
				proposal_id: "p1".to_string(),
				vote: Vote::Agree,
				reasoning: None,
			},
			None,
		)
		.await;

	let mut kinds = Vec::new();
	while let Ok(event) = rx.try_recv() {
		if let BrokerEvent::WorkspaceOperation(op) = event {
			kinds.push((op.kind, op.requires_realtime, op.requires_persistence));
		}
	}
	assert_eq!(
		kinds,
		[
			(OperationKind::RequestFileLock, true, true),
			(OperationKind::ReleaseFileLock, true, true),
			(OperationKind::PublishConsensusVote, true, false),
		]
	);
}
