//! `SshCore`: the single composition root that wires every component in
//! this crate together and presents the one entry point downstream
//! collaborators (HTTP handlers, CLIs, tests) are expected to hold.
//!
//! Wiring order matters: the connection manager needs the key store, state
//! tracker, event log, and rate limiter before it exists; the health
//! monitor and reconnector each need a live connection manager; the tunnel
//! manager borrows the connection manager; and the connection manager's
//! reconnect trigger can only be registered once the reconnector exists.
//! `SshCore::new` performs this wiring once and keeps an `Arc` of each
//! component so callers needing direct access to one (tests, advanced
//! callers) can still reach it via the public fields.

use std::path::Path;
use std::sync::Arc;

use crate::collaborators::{InstanceLister, Orchestrator};
use crate::connection::ConnectionManager;
use crate::data::InstanceId;
use crate::error::Result;
use crate::events::{ConnectionEvent, EventListener};
use crate::health::HealthMonitor;
use crate::keys::KeyStore;
use crate::maintenance::MaintenanceLoops;
use crate::rate_limit::RateLimitSnapshot;
use crate::reconnect::Reconnector;
use crate::state::{ConnectionState, Transition};
use crate::tunnel::{TunnelManager, TunnelSnapshot};

/// The SSH connectivity core for a fleet of agent instances: one
/// multiplexed session and a set of reverse tunnels per instance ID.
pub struct SshCore {
    pub connections: Arc<ConnectionManager>,
    pub health: Arc<HealthMonitor>,
    pub reconnector: Arc<Reconnector>,
    pub tunnels: Arc<TunnelManager>,
    pub key_store: Arc<KeyStore>,
    maintenance: MaintenanceLoops,
}

impl SshCore {
    /// Load or generate the process-wide key pair from `key_dir`, then
    /// construct every component and wire the connection manager's
    /// reconnect trigger to the reconnector. Does not start any background
    /// loop; call `start` once an orchestrator and instance lister are
    /// available.
    pub async fn new(key_dir: &Path) -> Result<Arc<Self>> {
        let key_store = Arc::new(KeyStore::ensure_key_pair(key_dir).await?);
        let state = Arc::new(crate::state::StateTracker::new());
        let events = Arc::new(crate::events::EventLog::new());
        let rate_limiter = Arc::new(crate::rate_limit::RateLimiter::new());

        let connections = ConnectionManager::new(key_store.clone(), state.clone(), events.clone(), rate_limiter);
        let health = Arc::new(HealthMonitor::new(connections.clone()));
        let reconnector = Reconnector::new(connections.clone(), key_store.clone(), state, events);
        connections.set_reconnect_trigger(reconnector.handle()).await;
        let tunnels = TunnelManager::new(connections.clone());
        let maintenance = MaintenanceLoops::new(
            connections.clone(),
            health.clone(),
            tunnels.clone(),
            reconnector.clone(),
        );

        Ok(Arc::new(SshCore {
            connections,
            health,
            reconnector,
            tunnels,
            key_store,
            maintenance,
        }))
    }

    /// Register the orchestrator and start every persistent maintenance
    /// loop (health checker, tunnel health checker, background reconciler).
    pub async fn start(&self, lister: Arc<dyn InstanceLister>, orchestrator: Arc<dyn Orchestrator>) {
        self.reconnector.set_orchestrator(orchestrator.clone()).await;
        self.maintenance.start(lister, orchestrator).await;
    }

    /// Stop every maintenance loop and in-flight reconnect, tear down every
    /// tunnel, then close every connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.maintenance.shutdown().await
    }

    /// Idempotent "get me a live client" for `instance_id`.
    pub async fn ensure_connected(
        &self,
        instance_id: InstanceId,
        orchestrator: &dyn Orchestrator,
    ) -> Result<Arc<tokio::sync::Mutex<crate::connection::SshHandle>>> {
        self.connections.ensure_connected(instance_id, orchestrator).await
    }

    /// Configure (or clear, with an empty string) the source-IP allow list
    /// consulted before every dial for `instance_id`.
    pub async fn set_ip_restriction(&self, instance_id: InstanceId, csv: impl Into<String>) {
        self.connections.set_ip_restriction(instance_id, csv).await;
    }

    /// Register an audit/observability listener invoked on every emitted
    /// connection event, for every instance.
    pub async fn on_event(&self, listener: Arc<dyn EventListener>) {
        self.connections.on_event(listener).await;
    }

    pub async fn event_history(&self, instance_id: InstanceId) -> Vec<ConnectionEvent> {
        self.connections.event_history(instance_id).await
    }

    pub async fn connection_state(&self, instance_id: InstanceId) -> ConnectionState {
        self.connections.connection_state(instance_id).await
    }

    pub async fn state_history(&self, instance_id: InstanceId) -> Vec<Transition> {
        self.connections.state_history(instance_id).await
    }

    pub async fn rate_limit_state(&self, instance_id: InstanceId) -> RateLimitSnapshot {
        self.connections.rate_limit_state(instance_id).await
    }

    pub async fn public_key(&self) -> String {
        self.key_store.public_key().await
    }

    pub async fn public_key_fingerprint(&self) -> String {
        self.key_store.fingerprint().await
    }

    /// Atomically replace the global key pair by reloading from `key_dir`.
    /// Subsequent connects and reconnects use the new pair; in-flight
    /// handshakes are unaffected.
    pub async fn reload_keys(&self, key_dir: &Path) -> Result<()> {
        self.key_store.reload_from_dir(key_dir).await
    }

    pub async fn get_tunnels_for_instance(&self, instance_id: InstanceId) -> Vec<TunnelSnapshot> {
        self.tunnels.get_tunnels_for_instance(instance_id).await
    }

    pub async fn get_vnc_local_port(&self, instance_id: InstanceId) -> Option<u16> {
        self.tunnels.get_vnc_local_port(instance_id).await
    }

    pub async fn get_gateway_local_port(&self, instance_id: InstanceId) -> Option<u16> {
        self.tunnels.get_gateway_local_port(instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_wires_every_component_without_starting_loops() {
        let dir = std::env::temp_dir().join(format!("sshcore-coretest-{}", std::process::id()));
        let core = SshCore::new(&dir).await.unwrap();

        assert!(core.public_key().await.starts_with("ssh-ed25519 "));
        assert_eq!(core.connection_state(InstanceId(1)).await, ConnectionState::Disconnected);
        assert!(core.get_tunnels_for_instance(InstanceId(1)).await.is_empty());

        core.shutdown().await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
