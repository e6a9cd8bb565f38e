//! Connection manager: owns one multiplexed SSH session per instance,
//! keepalive, and the high-level `EnsureConnected` entry point.
//!
//! The handshake/auth sequence follows `connect_and_forward`/
//! `authenticate_session` in the Xiechengqi tcp-tunnel example (explicit
//! `tokio::time::timeout` around `russh::client::connect`, then
//! `authenticate_publickey` with a hash algorithm negotiated via
//! `best_supported_rsa_hash`); the "remove-if-still-us" keepalive-failure
//! handling is this crate's own, implementing the invariant spec'd for the
//! connection map. The manager is always handled behind an `Arc` (see
//! `new`) so the keepalive worker can hold a clone of it without unsafe
//! self-referential pointers.

mod handler;

pub use handler::ClientHandler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::debug;
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use serde::Serialize;
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::collaborators::Orchestrator;
use crate::config::{DIAL_TIMEOUT, KEEPALIVE_INTERVAL, SSH_USER};
use crate::data::InstanceId;
use crate::error::{ConnectError, Result};
use crate::events::{EventKind, EventLog};
use crate::ip_restrict;
use crate::keys::KeyStore;
use crate::rate_limit::RateLimiter;
use crate::state::{ConnectionState, StateTracker};

pub type SshHandle = Handle<ClientHandler>;

/// Fired by the connection manager when a live session dies (keepalive or
/// health-check failure). Implemented by the reconnector; kept as a trait
/// here so the connection manager doesn't need to depend on it directly.
pub trait ReconnectTrigger: Send + Sync {
    fn trigger(&self, instance_id: InstanceId, reason: String);
}

/// Deep-copyable metrics snapshot for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    #[serde(skip)]
    connected_at: Instant,
    pub connected_at_unix_ms: u128,
    pub last_health_check_unix_ms: Option<u128>,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub uptime: Duration,
}

impl ConnectionMetrics {
    fn new() -> Self {
        ConnectionMetrics {
            connected_at: Instant::now(),
            connected_at_unix_ms: now_ms(),
            last_health_check_unix_ms: None,
            successful_checks: 0,
            failed_checks: 0,
            uptime: Duration::ZERO,
        }
    }

    fn snapshot(&self) -> ConnectionMetrics {
        let mut copy = self.clone();
        copy.uptime = self.connected_at.elapsed();
        copy
    }
}

struct ManagedConnection {
    handle: Arc<Mutex<SshHandle>>,
    metrics: Arc<RwLock<ConnectionMetrics>>,
    keepalive_cancel: Option<oneshot::Sender<()>>,
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Owns the connection map exclusively. No other component may mutate it;
/// cross-component reads go through `get_connection`/`is_connected`.
pub struct ConnectionManager {
    connections: RwLock<HashMap<InstanceId, ManagedConnection>>,
    key_store: Arc<KeyStore>,
    state: Arc<StateTracker>,
    events: Arc<EventLog>,
    rate_limiter: Arc<RateLimiter>,
    ip_restrictions: RwLock<HashMap<InstanceId, String>>,
    reconnect_trigger: RwLock<Option<Arc<dyn ReconnectTrigger>>>,
}

impl ConnectionManager {
    pub fn new(
        key_store: Arc<KeyStore>,
        state: Arc<StateTracker>,
        events: Arc<EventLog>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            connections: RwLock::new(HashMap::new()),
            key_store,
            state,
            events,
            rate_limiter,
            ip_restrictions: RwLock::new(HashMap::new()),
            reconnect_trigger: RwLock::new(None),
        })
    }

    /// Registers the collaborator invoked on keepalive/health-check
    /// failure. Set once at startup by whoever wires the reconnector.
    pub async fn set_reconnect_trigger(&self, trigger: Arc<dyn ReconnectTrigger>) {
        *self.reconnect_trigger.write().await = Some(trigger);
    }

    /// Configure (or clear, with an empty string) the source-IP allow list
    /// consulted by `connect` before every dial for this instance. A csv of
    /// literal IPs and/or CIDRs, per `ip_restrict::IpRestriction`.
    pub async fn set_ip_restriction(&self, instance_id: InstanceId, csv: impl Into<String>) {
        let csv = csv.into();
        let mut restrictions = self.ip_restrictions.write().await;
        if csv.trim().is_empty() {
            restrictions.remove(&instance_id);
        } else {
            restrictions.insert(instance_id, csv);
        }
    }

    /// Dial, handshake, authenticate, and install a keepalive worker for
    /// `instance_id`. Replaces any existing connection for the same id.
    ///
    /// Consults the IP restriction then the rate limiter before dialing, in
    /// that order: both are policy refusals that must not consume a
    /// rate-limit attempt slot or be recorded as a transport failure.
    pub async fn connect(self: &Arc<Self>, instance_id: InstanceId, host: &str, port: u16) -> Result<()> {
        self.check_ip_restriction(instance_id, host, port).await?;
        self.rate_limiter.allow(instance_id).await?;
        self.state.set(instance_id, ConnectionState::Connecting, "dialing").await;

        match self.dial_and_handshake(instance_id, host, port).await {
            Ok(handle) => {
                self.rate_limiter.record_success(instance_id).await;
                self.replace_connection(instance_id, handle).await;
                self.state
                    .set(instance_id, ConnectionState::Connected, "handshake complete")
                    .await;
                self.events.emit(instance_id, EventKind::Connected).await;
                Ok(())
            }
            Err(err) => {
                self.rate_limiter.record_failure(instance_id).await;
                self.state
                    .set(instance_id, ConnectionState::Disconnected, err.to_string())
                    .await;
                Err(err)
            }
        }
    }

    /// No-op if no restriction is configured for this instance; otherwise
    /// probes the outbound IP for `host:port` and checks it against the
    /// configured allow list.
    async fn check_ip_restriction(&self, instance_id: InstanceId, host: &str, port: u16) -> Result<()> {
        let csv = self.ip_restrictions.read().await.get(&instance_id).cloned();
        match csv {
            Some(csv) => ip_restrict::check_source_ip_allowed(instance_id, &csv, host, port),
            None => Ok(()),
        }
    }

    async fn dial_and_handshake(
        &self,
        instance_id: InstanceId,
        host: &str,
        port: u16,
    ) -> Result<SshHandle> {
        let config = Arc::new(client::Config::default());
        let addr = (host, port);

        let mut session = tokio::time::timeout(DIAL_TIMEOUT, client::connect(config, addr, ClientHandler))
            .await
            .map_err(|_| ConnectError::DialTimeout(instance_id))?
            .map_err(|source| ConnectError::Ssh { instance_id, source })?;

        let signer = self.key_store.signer().await;
        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .map_err(|source| ConnectError::Ssh { instance_id, source })?
            .flatten();

        let auth = session
            .authenticate_publickey(SSH_USER, PrivateKeyWithHashAlg::new(signer, hash_alg))
            .await
            .map_err(|source| ConnectError::Ssh { instance_id, source })?;

        if !auth.success() {
            return Err(ConnectError::AuthRejected(instance_id));
        }

        Ok(session)
    }

    async fn replace_connection(self: &Arc<Self>, instance_id: InstanceId, handle: SshHandle) {
        let mut connections = self.connections.write().await;
        if let Some(old) = connections.remove(&instance_id) {
            if let Some(cancel) = old.keepalive_cancel {
                let _ = cancel.send(());
            }
        }

        let handle = Arc::new(Mutex::new(handle));
        let metrics = Arc::new(RwLock::new(ConnectionMetrics::new()));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        spawn_keepalive_worker(instance_id, handle.clone(), cancel_rx, self.clone());

        connections.insert(
            instance_id,
            ManagedConnection {
                handle,
                metrics,
                keepalive_cancel: Some(cancel_tx),
            },
        );
    }

    /// Cached accessor; may return a recently-dead handle (see `is_connected`).
    pub async fn get_connection(&self, instance_id: InstanceId) -> Option<Arc<Mutex<SshHandle>>> {
        self.connections.read().await.get(&instance_id).map(|c| c.handle.clone())
    }

    /// Cheap liveness probe: sends `keepalive@openssh.com` with
    /// reply-expected and reports whether it succeeded.
    pub async fn is_connected(&self, instance_id: InstanceId) -> bool {
        let Some(handle) = self.get_connection(instance_id).await else {
            return false;
        };
        handle.lock().await.send_keepalive(true).await.is_ok()
    }

    /// Remove, cancel, and close one connection. Idempotent.
    pub async fn close(&self, instance_id: InstanceId) -> Result<()> {
        let removed = self.connections.write().await.remove(&instance_id);
        if let Some(conn) = removed {
            if let Some(cancel) = conn.keepalive_cancel {
                let _ = cancel.send(());
            }
            conn.handle
                .lock()
                .await
                .disconnect(russh::Disconnect::ByApplication, "closing", "en")
                .await
                .map_err(|source| ConnectError::Ssh { instance_id, source })?;
        }
        Ok(())
    }

    /// Close every connection. Collects every error encountered; returns
    /// the first. The caller is responsible for stopping the health
    /// checker and in-flight reconnects first (see
    /// `MaintenanceLoops::shutdown`).
    pub async fn close_all(&self) -> Result<()> {
        let ids: Vec<InstanceId> = self.connections.read().await.keys().copied().collect();
        let mut errors = Vec::new();
        for id in ids {
            if let Err(e) = self.close(id).await {
                errors.push(e.to_string());
            }
        }
        match errors.len() {
            0 => Ok(()),
            count => Err(ConnectError::Shutdown {
                count,
                first: errors.into_iter().next().expect("count > 0"),
            }),
        }
    }

    /// Idempotent "get me a live client": returns the cached client if
    /// still alive, otherwise resolves the address, uploads the current
    /// public key, and dials.
    pub async fn ensure_connected(
        self: &Arc<Self>,
        instance_id: InstanceId,
        orchestrator: &dyn Orchestrator,
    ) -> Result<Arc<Mutex<SshHandle>>> {
        if self.is_connected(instance_id).await {
            if let Some(handle) = self.get_connection(instance_id).await {
                return Ok(handle);
            }
        }

        let (host, port) = orchestrator
            .get_ssh_address(instance_id)
            .await
            .map_err(|e| ConnectError::AddressLookup(instance_id, e))?;

        let public_key = self.key_store.public_key().await;
        orchestrator
            .configure_ssh_access(instance_id, &public_key)
            .await
            .map_err(|e| ConnectError::KeyUpload(instance_id, e))?;
        self.events.emit(instance_id, EventKind::KeyUploaded).await;

        self.connect(instance_id, &host, port).await?;

        self.get_connection(instance_id)
            .await
            .ok_or(ConnectError::NotConnected(instance_id))
    }

    /// Ids of instances that currently have a live connection entry.
    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        self.connections.read().await.keys().copied().collect()
    }

    /// Rate-limit counters for `instance_id`, for observability.
    pub async fn rate_limit_state(&self, instance_id: InstanceId) -> crate::rate_limit::RateLimitSnapshot {
        self.rate_limiter.get_state(instance_id).await
    }

    /// Current connection state for `instance_id` (`Disconnected` if unknown).
    pub async fn connection_state(&self, instance_id: InstanceId) -> ConnectionState {
        self.state.get(instance_id).await
    }

    /// Bounded transition history for `instance_id`, oldest first.
    pub async fn state_history(&self, instance_id: InstanceId) -> Vec<crate::state::Transition> {
        self.state.history(instance_id).await
    }

    /// Event ring-buffer contents for `instance_id`, oldest first.
    pub async fn event_history(&self, instance_id: InstanceId) -> Vec<crate::events::ConnectionEvent> {
        self.events.history(instance_id).await
    }

    /// Register a listener invoked on every event emitted for any instance.
    pub async fn on_event(&self, listener: Arc<dyn crate::events::EventListener>) {
        self.events.on_event(listener).await;
    }

    /// Deep-copied metrics snapshot for one instance.
    pub async fn get_metrics(&self, instance_id: InstanceId) -> Option<ConnectionMetrics> {
        let connections = self.connections.read().await;
        let conn = connections.get(&instance_id)?;
        Some(conn.metrics.read().await.snapshot())
    }

    /// Deep-copied metrics snapshots for every live connection.
    pub async fn get_all_metrics(&self) -> HashMap<InstanceId, ConnectionMetrics> {
        let connections = self.connections.read().await;
        let mut out = HashMap::with_capacity(connections.len());
        for (id, conn) in connections.iter() {
            out.insert(*id, conn.metrics.read().await.snapshot());
        }
        out
    }

    pub(crate) async fn record_health_check(&self, instance_id: InstanceId, success: bool) {
        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(&instance_id) {
            let mut metrics = conn.metrics.write().await;
            metrics.last_health_check_unix_ms = Some(now_ms());
            if success {
                metrics.successful_checks += 1;
            } else {
                metrics.failed_checks += 1;
            }
        }
    }

    /// Remove the mapping only if it still points at `expected` — guards
    /// against a stale keepalive deleting a freshly inserted replacement.
    async fn remove_if_current(&self, instance_id: InstanceId, expected: &Arc<Mutex<SshHandle>>) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&instance_id) {
            Some(conn) if Arc::ptr_eq(&conn.handle, expected) => {
                connections.remove(&instance_id);
                true
            }
            _ => false,
        }
    }

    /// Emits a standalone `health_check_failed` event, distinct from the
    /// `disconnected` event `notify_disconnected` emits right after it —
    /// the data model names both as separate event types.
    pub(crate) async fn emit_health_check_failed(&self, instance_id: InstanceId, reason: String) {
        self.events.emit(instance_id, EventKind::HealthCheckFailed { reason }).await;
    }

    /// Called by the keepalive worker and the health monitor on failure:
    /// sets state, emits the event, and fires the reconnect trigger if one
    /// is registered.
    pub(crate) async fn notify_disconnected(&self, instance_id: InstanceId, reason: String) {
        self.state
            .set(instance_id, ConnectionState::Disconnected, reason.clone())
            .await;
        self.events
            .emit(instance_id, EventKind::Disconnected { reason: reason.clone() })
            .await;
        if let Some(trigger) = self.reconnect_trigger.read().await.clone() {
            trigger.trigger(instance_id, reason);
        }
    }
}

fn spawn_keepalive_worker(
    instance_id: InstanceId,
    handle: Arc<Mutex<SshHandle>>,
    mut cancel_rx: oneshot::Receiver<()>,
    manager: Arc<ConnectionManager>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        interval.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let result = handle.lock().await.send_keepalive(true).await;
                    if let Err(e) = result {
                        debug!("instance {instance_id}: keepalive failed: {e}");
                        if manager.remove_if_current(instance_id, &handle).await {
                            manager.notify_disconnected(instance_id, format!("keepalive failed: {e}")).await;
                        }
                        break;
                    }
                }
                _ = &mut cancel_rx => {
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_instance_is_not_connected() {
        // KeyStore has no cheap no-op constructor (it always touches the
        // filesystem on creation), so this test only exercises the parts
        // of ConnectionManager that don't need a key pair.
        let state = Arc::new(StateTracker::new());
        let events = Arc::new(EventLog::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let dir = std::env::temp_dir().join(format!("sshcore-conntest-{}", std::process::id()));
        let key_store = crate::keys::KeyStore::ensure_key_pair(&dir).await.unwrap();
        let manager = ConnectionManager::new(Arc::new(key_store), state, events, rate_limiter);

        assert!(!manager.is_connected(InstanceId(1)).await);
        assert!(manager.get_connection(InstanceId(1)).await.is_none());
        manager.close(InstanceId(1)).await.unwrap(); // idempotent, no panic
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn ip_restriction_refuses_before_dial_without_touching_rate_limiter() {
        let state = Arc::new(StateTracker::new());
        let events = Arc::new(EventLog::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let dir = std::env::temp_dir().join(format!("sshcore-iptest-{}", std::process::id()));
        let key_store = crate::keys::KeyStore::ensure_key_pair(&dir).await.unwrap();
        let manager = ConnectionManager::new(Arc::new(key_store), state, events, rate_limiter);
        let id = InstanceId(1);

        manager.set_ip_restriction(id, "10.0.0.0/8").await;
        let err = manager.connect(id, "127.0.0.1", 1).await.unwrap_err();
        assert!(matches!(err, ConnectError::IpRestricted { .. }));

        // A policy refusal is not a transport failure: no attempt was recorded.
        let snapshot = manager.rate_limiter.get_state(id).await;
        assert_eq!(snapshot.attempts_in_window, 0);
        assert_eq!(snapshot.consecutive_failures, 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
