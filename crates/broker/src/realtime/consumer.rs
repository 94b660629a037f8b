//! Stream consumer loop and heartbeat for the fast store.
//!
//! The consumer reads every coordination stream through one durable consumer
//! group, re-emits each envelope on the bus, and acknowledges only after the
//! emit (at-least-once; duplicates are possible across reconnects and
//! consumers deduplicate on envelope id). It runs on its own dedicated
//! connection so its blocking poll never stalls lock traffic on the shared
//! handle.

use std::sync::Arc;
use std::time::Duration;

use agora_proto::{Envelope, now_ms};
use redis::AsyncCommands;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tokio_util::sync::CancellationToken;

use crate::events::BrokerEvent;

use super::{RedisCoordinator, STREAMS};

/// How long one poll blocks waiting for entries.
const POLL_BLOCK_MS: u64 = 1_000;

/// Pause after a transport failure before the loop tries again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

impl RedisCoordinator {
	/// Start the stream consumer loop.
	///
	/// The loop opens its own connection lazily and survives transport
	/// failures: each is reported on the bus, the connection is rebuilt, and
	/// polling continues until shutdown.
	pub fn spawn_consumer(self: &Arc<Self>, shutdown: CancellationToken) {
		let coordinator = self.clone();
		tokio::spawn(async move {
			let client = match redis::Client::open(coordinator.config.url()) {
				Ok(client) => client,
				Err(error) => {
					tracing::error!(%error, "consumer cannot parse redis url");
					return;
				}
			};

			let streams: Vec<String> = STREAMS
				.iter()
				.map(|s| coordinator.config.stream(s))
				.collect();
			let mut conn: Option<redis::aio::Connection> = None;

			loop {
				if shutdown.is_cancelled() {
					return;
				}

				let Some(active) = conn.as_mut() else {
					match client.get_async_connection().await {
						Ok(fresh) => conn = Some(fresh),
						Err(error) => {
							tracing::debug!(%error, "consumer waiting for redis");
							tokio::select! {
								() = shutdown.cancelled() => return,
								() = tokio::time::sleep(ERROR_BACKOFF) => {}
							}
						}
					}
					continue;
				};

				let options = StreamReadOptions::default()
					.group(
						&coordinator.config.consumer_group,
						&coordinator.config.consumer_name,
					)
					.count(coordinator.config.max_pending_messages)
					.block(POLL_BLOCK_MS as usize);
				let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
				let polled: redis::RedisResult<Option<StreamReadReply>> = tokio::select! {
					() = shutdown.cancelled() => return,
					polled = active.xread_options(&streams, &ids, &options) => polled,
				};

				match polled {
					Ok(Some(reply)) => coordinator.dispatch_batch(reply).await,
					Ok(None) => {}
					Err(error) => {
						coordinator.report_error(&error);
						conn = None;
						tokio::select! {
							() = shutdown.cancelled() => return,
							() = tokio::time::sleep(ERROR_BACKOFF) => {}
						}
					}
				}
			}
		});
	}

	/// Emit every entry of one batch and acknowledge what was dispatched.
	async fn dispatch_batch(self: &Arc<Self>, reply: StreamReadReply) {
		for stream_key in reply.keys {
			let logical = self.logical_stream_name(&stream_key.key);
			for entry in stream_key.ids {
				match entry.map.get("envelope") {
					Some(value) => {
						match redis::from_redis_value::<String>(value)
							.map_err(crate::error::BrokerError::from)
							.and_then(|json| {
								serde_json::from_str::<Envelope>(&json).map_err(Into::into)
							}) {
							Ok(envelope) => {
								self.bus.emit(BrokerEvent::StreamMessage {
									stream: logical.clone(),
									envelope,
								});
							}
							Err(error) => {
								// Protocol error: report, acknowledge, drop.
								tracing::warn!(
									stream = %stream_key.key,
									entry = %entry.id,
									%error,
									"dropping unparseable stream entry"
								);
							}
						}
					}
					None => {
						tracing::warn!(
							stream = %stream_key.key,
							entry = %entry.id,
							"dropping stream entry without envelope field"
						);
					}
				}

				self.ack(&stream_key.key, &entry.id).await;
			}
		}
	}

	async fn ack(&self, stream: &str, entry: &str) {
		let Ok(mut conn) = self.handle() else { return };
		let acked: redis::RedisResult<()> = redis::cmd("XACK")
			.arg(stream)
			.arg(&self.config.consumer_group)
			.arg(entry)
			.query_async(&mut conn)
			.await;
		if let Err(error) = acked {
			tracing::warn!(stream, entry, %error, "ack failed");
		}
	}

	fn logical_stream_name(&self, full: &str) -> String {
		full.strip_prefix(&format!("{}:", self.config.stream_prefix))
			.unwrap_or(full)
			.to_string()
	}

	/// Start the heartbeat and retention timer.
	///
	/// Each tick refreshes the short-TTL heartbeat key (so external
	/// observers can detect a stuck consumer) and trims stream entries older
	/// than the retention window.
	pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) {
		let coordinator = self.clone();
		let period = Duration::from_millis(coordinator.config.heartbeat_interval_ms.max(1));
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					() = shutdown.cancelled() => return,
					_ = ticker.tick() => {}
				}

				let Ok(mut conn) = coordinator.handle() else {
					continue;
				};

				let heartbeat_ttl = coordinator.config.heartbeat_interval_ms.saturating_mul(3);
				let stamped: redis::RedisResult<()> = redis::cmd("SET")
					.arg(coordinator.config.heartbeat_key())
					.arg(now_ms())
					.arg("PX")
					.arg(heartbeat_ttl)
					.query_async(&mut conn)
					.await;
				if let Err(error) = stamped {
					tracing::debug!(%error, "heartbeat refresh failed");
					continue;
				}

				let min_id = format!(
					"{}-0",
					now_ms().saturating_sub(coordinator.config.message_retention_ms)
				);
				for stream in STREAMS {
					let trimmed: redis::RedisResult<usize> = redis::cmd("XTRIM")
						.arg(coordinator.config.stream(stream))
						.arg("MINID")
						.arg("~")
						.arg(&min_id)
						.query_async(&mut conn)
						.await;
					if let Err(error) = trimmed {
						tracing::debug!(stream, %error, "stream trim failed");
					}
				}
			}
		});
	}
}
