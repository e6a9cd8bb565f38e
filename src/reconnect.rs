//! Reconnector: single-flight exponential-backoff reconnect loop per
//! instance, triggered by the connection manager on keepalive or
//! health-check failure.
//!
//! The single-flight map-of-cancel-handles shape and the
//! `reconnect_with_backoff` attempt loop are this crate's own, sized to the
//! state machine in the design; the `min(initial * 2^(attempt-1), max)`
//! backoff schedule mirrors the doubling-with-cap backoff used by the
//! Xiechengqi tcp-tunnel example's own reconnect loop.

use std::collections::HashMap;
use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{oneshot, RwLock};

use crate::collaborators::Orchestrator;
use crate::config::{RECONNECT_INITIAL_DELAY, RECONNECT_MAX_ATTEMPTS, RECONNECT_MAX_DELAY};
use crate::connection::{ConnectionManager, ReconnectTrigger};
use crate::data::InstanceId;
use crate::error::{ConnectError, Result};
use crate::events::{EventKind, EventLog};
use crate::keys::KeyStore;
use crate::state::{ConnectionState, StateTracker};

/// Drives reconnection attempts after a connection drops. Registered with
/// the connection manager as its `ReconnectTrigger` via `handle()`, which
/// is an intentional `Arc` reference cycle back to the connection manager:
/// both are long-lived, process-scoped singletons for the life of the
/// service, so the cycle never needs breaking.
pub struct Reconnector {
    connections: Arc<ConnectionManager>,
    key_store: Arc<KeyStore>,
    state: Arc<StateTracker>,
    events: Arc<EventLog>,
    orchestrator: RwLock<Option<Arc<dyn Orchestrator>>>,
    in_flight: Arc<RwLock<HashMap<InstanceId, oneshot::Sender<()>>>>,
}

impl Reconnector {
    pub fn new(
        connections: Arc<ConnectionManager>,
        key_store: Arc<KeyStore>,
        state: Arc<StateTracker>,
        events: Arc<EventLog>,
    ) -> Arc<Self> {
        Arc::new(Reconnector {
            connections,
            key_store,
            state,
            events,
            orchestrator: RwLock::new(None),
            in_flight: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn set_orchestrator(&self, orchestrator: Arc<dyn Orchestrator>) {
        *self.orchestrator.write().await = Some(orchestrator);
    }

    /// A `ReconnectTrigger` adapter bound to this reconnector, suitable for
    /// `ConnectionManager::set_reconnect_trigger`.
    pub fn handle(self: &Arc<Self>) -> Arc<dyn ReconnectTrigger> {
        Arc::new(TriggerHandle(self.clone()))
    }

    /// Spawn a backoff loop for `instance_id` unless one is already in
    /// flight. Fire-and-forget: the caller is a keepalive worker or health
    /// monitor with nothing useful to do with a `Result`.
    pub async fn trigger_reconnect(&self, instance_id: InstanceId, reason: String) {
        let Some(orchestrator) = self.orchestrator.read().await.clone() else {
            warn!("instance {instance_id}: reconnect requested but no orchestrator is registered");
            return;
        };

        let mut in_flight = self.in_flight.write().await;
        if in_flight.contains_key(&instance_id) {
            return;
        }
        let (cancel_tx, cancel_rx) = oneshot::channel();
        in_flight.insert(instance_id, cancel_tx);
        drop(in_flight);

        let connections = self.connections.clone();
        let key_store = self.key_store.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let _ = reconnect_with_backoff(
                instance_id,
                RECONNECT_MAX_ATTEMPTS,
                &connections,
                &key_store,
                &state,
                &events,
                orchestrator,
                reason,
                cancel_rx,
            )
            .await;
            in_flight.write().await.remove(&instance_id);
        });
    }

    /// Cancel every in-flight reconnect loop; used by shutdown.
    pub async fn cancel_all_reconnections(&self) {
        let mut in_flight = self.in_flight.write().await;
        for (_, cancel_tx) in in_flight.drain() {
            let _ = cancel_tx.send(());
        }
    }
}

struct TriggerHandle(Arc<Reconnector>);

impl ReconnectTrigger for TriggerHandle {
    fn trigger(&self, instance_id: InstanceId, reason: String) {
        let reconnector = self.0.clone();
        tokio::spawn(async move {
            reconnector.trigger_reconnect(instance_id, reason).await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconnect_with_backoff(
    instance_id: InstanceId,
    max_attempts: u32,
    connections: &Arc<ConnectionManager>,
    key_store: &Arc<KeyStore>,
    state: &Arc<StateTracker>,
    events: &Arc<EventLog>,
    orchestrator: Arc<dyn Orchestrator>,
    reason: String,
    mut cancel_rx: oneshot::Receiver<()>,
) -> Result<()> {
    events
        .emit(instance_id, EventKind::Reconnecting { reason: reason.clone() })
        .await;
    state.set(instance_id, ConnectionState::Reconnecting, reason).await;

    let mut last_err: Option<ConnectError> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = backoff_delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = &mut cancel_rx => {
                    info!("instance {instance_id}: reconnect cancelled on attempt {attempt}");
                    return Ok(());
                }
            }
        }

        match attempt_once(instance_id, connections, key_store, events, &orchestrator).await {
            Ok(()) => {
                events.emit(instance_id, EventKind::Reconnected).await;
                info!("instance {instance_id}: reconnected on attempt {attempt}");
                return Ok(());
            }
            Err(e) => {
                warn!("instance {instance_id}: reconnect attempt {attempt} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    let reason = last_err
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "exhausted retries".to_string());
    events
        .emit(instance_id, EventKind::ReconnectFailed { reason: reason.clone() })
        .await;
    state.set(instance_id, ConnectionState::Failed, reason).await;

    Err(last_err.unwrap_or(ConnectError::NoOrchestrator))
}

async fn attempt_once(
    instance_id: InstanceId,
    connections: &Arc<ConnectionManager>,
    key_store: &Arc<KeyStore>,
    events: &Arc<EventLog>,
    orchestrator: &Arc<dyn Orchestrator>,
) -> Result<()> {
    let (host, port) = orchestrator
        .get_ssh_address(instance_id)
        .await
        .map_err(|e| ConnectError::AddressLookup(instance_id, e))?;

    let public_key = key_store.public_key().await;
    orchestrator
        .configure_ssh_access(instance_id, &public_key)
        .await
        .map_err(|e| ConnectError::KeyUpload(instance_id, e))?;
    events.emit(instance_id, EventKind::KeyUploaded).await;

    connections.connect(instance_id, &host, port).await
}

fn backoff_delay(attempt: u32) -> std::time::Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    let scaled = RECONNECT_INITIAL_DELAY.saturating_mul(factor);
    scaled.min(RECONNECT_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), RECONNECT_INITIAL_DELAY);
        assert_eq!(backoff_delay(2), RECONNECT_INITIAL_DELAY * 2);
        assert_eq!(backoff_delay(5), RECONNECT_MAX_DELAY);
        assert_eq!(backoff_delay(20), RECONNECT_MAX_DELAY);
    }

    async fn new_reconnector() -> Arc<Reconnector> {
        let dir = std::env::temp_dir().join(format!("sshcore-reconnecttest-{}", std::process::id()));
        let key_store = Arc::new(KeyStore::ensure_key_pair(&dir).await.unwrap());
        let state = Arc::new(StateTracker::new());
        let events = Arc::new(EventLog::new());
        let rate_limiter = Arc::new(crate::rate_limit::RateLimiter::new());
        let connections = ConnectionManager::new(key_store.clone(), state.clone(), events.clone(), rate_limiter);
        Reconnector::new(connections, key_store, state, events)
    }

    #[tokio::test]
    async fn trigger_without_orchestrator_is_a_no_op() {
        let reconnector = new_reconnector().await;
        reconnector.trigger_reconnect(InstanceId(1), "test".into()).await;
        assert_eq!(reconnector.state.get(InstanceId(1)).await, ConnectionState::Disconnected);
    }
}
