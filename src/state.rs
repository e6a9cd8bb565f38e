//! Per-instance connection state with bounded transition history.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::STATE_HISTORY_CAPACITY;
use crate::data::InstanceId;

/// Lifecycle state of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub timestamp_unix_ms: u128,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub reason: String,
}

struct InstanceState {
    current: ConnectionState,
    reason: String,
    history: Vec<Transition>,
}

impl InstanceState {
    fn new() -> Self {
        InstanceState {
            current: ConnectionState::Disconnected,
            reason: String::new(),
            history: Vec::new(),
        }
    }
}

/// Tracks current state and a bounded history of transitions per instance,
/// behind one lock over its own map — no other component reaches into it
/// except through `set`/`get`/`history`.
pub struct StateTracker {
    instances: RwLock<HashMap<InstanceId, InstanceState>>,
}

impl StateTracker {
    pub fn new() -> Self {
        StateTracker {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Record a transition if `state` differs from the current one;
    /// otherwise just update the reason string in place.
    pub async fn set(&self, instance_id: InstanceId, state: ConnectionState, reason: impl Into<String>) {
        let reason = reason.into();
        let mut instances = self.instances.write().await;
        let entry = instances.entry(instance_id).or_insert_with(InstanceState::new);

        if entry.current != state {
            let transition = Transition {
                timestamp_unix_ms: now_ms(),
                from: entry.current,
                to: state,
                reason: reason.clone(),
            };
            entry.history.push(transition);
            if entry.history.len() > STATE_HISTORY_CAPACITY {
                let overflow = entry.history.len() - STATE_HISTORY_CAPACITY;
                entry.history.drain(0..overflow);
            }
            entry.current = state;
        }
        entry.reason = reason;
    }

    /// Current state, or `Disconnected` if the instance is unknown.
    pub async fn get(&self, instance_id: InstanceId) -> ConnectionState {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .map(|s| s.current)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Up to `STATE_HISTORY_CAPACITY` recent transitions, oldest first.
    pub async fn history(&self, instance_id: InstanceId) -> Vec<Transition> {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_instance_is_disconnected() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.get(InstanceId(1)).await, ConnectionState::Disconnected);
        assert!(tracker.history(InstanceId(1)).await.is_empty());
    }

    #[tokio::test]
    async fn same_state_updates_reason_without_new_transition() {
        let tracker = StateTracker::new();
        let id = InstanceId(1);
        tracker.set(id, ConnectionState::Connecting, "dialing").await;
        tracker.set(id, ConnectionState::Connecting, "still dialing").await;
        assert_eq!(tracker.history(id).await.len(), 1);
    }

    #[tokio::test]
    async fn history_capacity_is_bounded() {
        let tracker = StateTracker::new();
        let id = InstanceId(1);
        for i in 0..(STATE_HISTORY_CAPACITY + 20) {
            let state = if i % 2 == 0 {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            };
            tracker.set(id, state, "cycle").await;
        }
        assert!(tracker.history(id).await.len() <= STATE_HISTORY_CAPACITY);
    }
}
