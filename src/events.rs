//! Per-instance connection event ring buffer with listener fan-out.
//!
//! The tagged-enum-event shape follows the session recorder in the teacher
//! crate (`SessionEvent`, `#[serde(tag = "kind")]`); the listener
//! registration/fan-out shape follows the tunnel daemon's
//! `tunnel_manager.subscribe()` pattern, simplified to direct callbacks
//! since this crate has no async event bus of its own to hand the caller.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::EVENT_LOG_CAPACITY;
use crate::data::InstanceId;

/// A connection lifecycle event, tagged by `type` for downstream
/// serialization (audit sink, status endpoints).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected { reason: String },
    Reconnecting { reason: String },
    Reconnected,
    ReconnectFailed { reason: String },
    KeyUploaded,
    HealthCheckFailed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub instance_id: InstanceId,
    pub timestamp_unix_ms: u128,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Registered audit/observability sink. Implementations must return
/// promptly; a listener that blocks delays emission for every caller
/// sharing the log's mutex, which is a bug in the listener, not the log.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ConnectionEvent);
}

struct InstanceLog {
    ring: VecDeque<ConnectionEvent>,
}

impl InstanceLog {
    fn new() -> Self {
        InstanceLog {
            ring: VecDeque::with_capacity(EVENT_LOG_CAPACITY),
        }
    }

    fn push(&mut self, event: ConnectionEvent) {
        if self.ring.len() >= EVENT_LOG_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(event);
    }
}

/// Per-instance ring buffer of capacity 100, with synchronous listener
/// fan-out on every emission.
pub struct EventLog {
    instances: RwLock<HashMap<InstanceId, InstanceLog>>,
    listeners: RwLock<Vec<Arc<dyn EventListener>>>,
}

impl EventLog {
    pub fn new() -> Self {
        EventLog {
            instances: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener invoked for every subsequently emitted event.
    pub async fn on_event(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().await.push(listener);
    }

    /// Append to the instance's ring buffer, then invoke every listener.
    /// The buffer append happens under the instances lock, which is
    /// released before listeners run.
    pub async fn emit(&self, instance_id: InstanceId, kind: EventKind) {
        let event = ConnectionEvent {
            instance_id,
            timestamp_unix_ms: now_ms(),
            kind,
        };

        {
            let mut instances = self.instances.write().await;
            instances
                .entry(instance_id)
                .or_insert_with(InstanceLog::new)
                .push(event.clone());
        }

        let listeners = self.listeners.read().await;
        for listener in listeners.iter() {
            listener.on_event(&event);
        }
    }

    /// Entries oldest to newest for one instance.
    pub async fn history(&self, instance_id: InstanceId) -> Vec<ConnectionEvent> {
        self.instances
            .read()
            .await
            .get(&instance_id)
            .map(|log| log.ring.iter().cloned().collect())
            .unwrap_or_default()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// A listener that just logs; useful as a default audit sink and in tests.
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&self, event: &ConnectionEvent) {
        warn!("event: instance={} {:?}", event.instance_id, event.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener(Arc<AtomicUsize>);
    impl EventListener for CountingListener {
        fn on_event(&self, _event: &ConnectionEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn ring_buffer_bounded_and_ordered() {
        let log = EventLog::new();
        let id = InstanceId(9);
        for _ in 0..(EVENT_LOG_CAPACITY + 10) {
            log.emit(id, EventKind::Connected).await;
        }
        let history = log.history(id).await;
        assert_eq!(history.len(), EVENT_LOG_CAPACITY);
    }

    #[tokio::test]
    async fn listeners_receive_every_event_in_order() {
        let log = EventLog::new();
        let count = Arc::new(AtomicUsize::new(0));
        log.on_event(Arc::new(CountingListener(count.clone()))).await;

        let id = InstanceId(1);
        log.emit(id, EventKind::Connected).await;
        log.emit(id, EventKind::Disconnected { reason: "x".into() }).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
