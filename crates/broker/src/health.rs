//! Health tracking and reconnect supervision.
//!
//! The supervisor watches connection events on the bus, keeps the per-backend
//! health records, recomputes the rollup on every transition, and owns the
//! reconnect loops. Callers never block on health; it is observational state
//! that the bridge consults when routing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_proto::{Backend, BackendHealth, HealthReport, OverallHealth, now_ms};
use tokio_util::sync::CancellationToken;

use crate::config::SupervisorConfig;
use crate::events::{BrokerEvent, EventBus};
use crate::store::Connectable;

/// Per-backend supervision state.
#[derive(Debug, Default)]
struct BackendState {
	health: BackendHealth,
	/// A reconnect loop is in flight; new triggers are deduplicated.
	reconnecting: bool,
	/// The last reconnect loop exhausted its attempts; only an external
	/// reset re-arms this backend.
	exhausted: bool,
}

#[derive(Debug, Default)]
struct StateTable {
	redis: BackendState,
	kafka: BackendState,
}

impl StateTable {
	fn get_mut(&mut self, backend: Backend) -> &mut BackendState {
		match backend {
			Backend::Redis => &mut self.redis,
			Backend::Kafka => &mut self.kafka,
		}
	}

	fn overall(&self) -> OverallHealth {
		match (self.redis.health.connected, self.kafka.health.connected) {
			(true, true) => OverallHealth::Healthy,
			(false, false) => OverallHealth::Offline,
			_ => OverallHealth::Degraded,
		}
	}
}

/// Connection state machine and reconnect driver for both backends.
#[derive(Debug)]
pub struct HealthSupervisor {
	config: SupervisorConfig,
	bus: EventBus,
	states: Mutex<StateTable>,
}

impl HealthSupervisor {
	/// Create a supervisor with both backends assumed down.
	#[must_use]
	pub fn new(config: SupervisorConfig, bus: EventBus) -> Arc<Self> {
		Arc::new(Self {
			config,
			bus,
			states: Mutex::new(StateTable::default()),
		})
	}

	/// Whether a backend is currently connected.
	#[must_use]
	pub fn is_connected(&self, backend: Backend) -> bool {
		let states = self.states.lock().unwrap();
		match backend {
			Backend::Redis => states.redis.health.connected,
			Backend::Kafka => states.kafka.health.connected,
		}
	}

	/// Current rollup over both backends.
	#[must_use]
	pub fn overall(&self) -> OverallHealth {
		self.states.lock().unwrap().overall()
	}

	/// Snapshot of both backends and the rollup.
	#[must_use]
	pub fn report(&self) -> HealthReport {
		let states = self.states.lock().unwrap();
		HealthReport {
			redis: states.redis.health.clone(),
			kafka: states.kafka.health.clone(),
			overall: states.overall(),
		}
	}

	/// Re-arm a backend whose reconnect loop gave up.
	///
	/// The next error or disconnect event starts a fresh attempt series.
	pub fn reset(&self, backend: Backend) {
		let mut states = self.states.lock().unwrap();
		let state = states.get_mut(backend);
		state.exhausted = false;
		state.health.error_count = 0;
		tracing::info!(%backend, "reconnect state reset");
	}

	/// Record a successful connect and clear the attempt series.
	pub fn note_connected(&self, backend: Backend) {
		let (changed, overall) = {
			let mut states = self.states.lock().unwrap();
			let before = states.overall();
			let state = states.get_mut(backend);
			state.health.connected = true;
			state.health.error_count = 0;
			state.health.last_error = None;
			state.reconnecting = false;
			state.exhausted = false;
			let after = states.overall();
			(before != after, after)
		};
		if changed {
			self.bus.emit(BrokerEvent::HealthChanged { overall });
		}
	}

	/// Record an error or disconnect.
	///
	/// Returns true when the caller should start a reconnect loop: no loop
	/// is in flight and the backend is not exhausted. The dedup flag is set
	/// before this returns, so concurrent triggers race safely.
	pub fn note_down(&self, backend: Backend, message: &str) -> bool {
		let (should_reconnect, changed, overall) = {
			let mut states = self.states.lock().unwrap();
			let before = states.overall();
			let state = states.get_mut(backend);
			state.health.connected = false;
			state.health.error_count = state.health.error_count.saturating_add(1);
			state.health.last_error = Some(message.to_string());
			let should = !state.reconnecting && !state.exhausted;
			if should {
				state.reconnecting = true;
			}
			let after = states.overall();
			(should, before != after, after)
		};
		if changed {
			self.bus.emit(BrokerEvent::HealthChanged { overall });
		}
		should_reconnect
	}

	/// Watch connection events for both backends and drive reconnects.
	///
	/// One subscriber loop serves both planes; the targets are the stores
	/// themselves, seen through [`Connectable`].
	pub fn watch(
		self: &Arc<Self>,
		redis: Arc<dyn Connectable>,
		kafka: Arc<dyn Connectable>,
		shutdown: CancellationToken,
	) {
		let supervisor = self.clone();
		let mut rx = self.bus.subscribe();
		tokio::spawn(async move {
			loop {
				let event = tokio::select! {
					() = shutdown.cancelled() => return,
					event = rx.recv() => event,
				};
				let event = match event {
					Ok(event) => event,
					// Lagging only skips events; health converges on the next
					// transition.
					Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
						tracing::warn!(skipped, "health watcher lagged");
						continue;
					}
					Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
				};

				match event {
					BrokerEvent::BackendConnected { backend } => {
						supervisor.note_connected(backend);
					}
					BrokerEvent::BackendDisconnected { backend }
					| BrokerEvent::BackendError { backend, .. } => {
						let message = match &event {
							BrokerEvent::BackendError { message, .. } => message.clone(),
							_ => "disconnected".to_string(),
						};
						if supervisor.note_down(backend, &message) {
							let target = match backend {
								Backend::Redis => redis.clone(),
								Backend::Kafka => kafka.clone(),
							};
							supervisor.spawn_reconnect(backend, target, shutdown.clone());
						}
					}
					_ => {}
				}
			}
		});
	}

	/// Run one capped, linearly backed-off reconnect series.
	///
	/// Callers must have won the dedup flag via [`Self::note_down`].
	pub fn spawn_reconnect(
		self: &Arc<Self>,
		backend: Backend,
		target: Arc<dyn Connectable>,
		shutdown: CancellationToken,
	) {
		let supervisor = self.clone();
		tokio::spawn(async move {
			let attempts = supervisor.config.reconnect_attempts;
			let base = Duration::from_millis(supervisor.config.reconnect_delay_ms);

			for attempt in 1..=attempts {
				let delay = base * attempt;
				tokio::select! {
					() = shutdown.cancelled() => {
						supervisor.clear_reconnecting(backend);
						return;
					}
					() = tokio::time::sleep(delay) => {}
				}

				match target.connect().await {
					Ok(()) => {
						tracing::info!(%backend, attempt, "reconnected");
						supervisor.note_connected(backend);
						return;
					}
					Err(error) => {
						tracing::warn!(%backend, attempt, %error, "reconnect attempt failed");
						supervisor.bus.emit(BrokerEvent::ReconnectAttemptFailed {
							backend,
							attempt,
							message: error.to_string(),
						});
					}
				}
			}

			{
				let mut states = supervisor.states.lock().unwrap();
				let state = states.get_mut(backend);
				state.reconnecting = false;
				state.exhausted = true;
			}
			tracing::error!(%backend, attempts, "reconnect gave up");
			supervisor.bus.emit(BrokerEvent::ReconnectFailed { backend });
		});
	}

	fn clear_reconnecting(&self, backend: Backend) {
		let mut states = self.states.lock().unwrap();
		states.get_mut(backend).reconnecting = false;
	}

	/// Periodically stamp `last_health_check` on both backends.
	///
	/// The stamp is purely observational; authoritative state comes from
	/// connection events.
	pub fn spawn_stamp_timer(self: &Arc<Self>, shutdown: CancellationToken) {
		let supervisor = self.clone();
		let period = Duration::from_millis(supervisor.config.health_check_interval_ms.max(1));
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					() = shutdown.cancelled() => return,
					_ = ticker.tick() => {}
				}
				let now = now_ms();
				let mut states = supervisor.states.lock().unwrap();
				states.redis.health.last_health_check = now;
				states.kafka.health.last_health_check = now;
			}
		});
	}
}
