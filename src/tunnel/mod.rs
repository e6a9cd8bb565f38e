//! Tunnel manager: creates and tracks reverse port-forwards over each
//! instance's SSH session, reconciles them against the running instance
//! set, and probes their local listeners for liveness.
//!
//! The accept-loop/`direct-tcpip`/`copy_bidirectional` bridge is grounded on
//! `run_local_forward` in the aitechnerd-sshore tunnel example (bind a
//! local listener, and for each accepted connection open a `direct-tcpip`
//! channel and bidirectionally copy); this crate binds its listener and
//! channel target the other way around from that example's `-L` forward
//! (the control plane is the listener side, the agent port is the
//! `direct-tcpip` target), which is the reverse-tunnel shape this crate
//! needs instead of a local forward.

mod backoff;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use log::{debug, info, warn};
use serde::Serialize;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, RwLock};

use crate::collaborators::{InstanceLister, Orchestrator};
use crate::config::{
    GATEWAY_DEFAULT_REMOTE_PORT, GATEWAY_LABEL, RECONCILE_INITIAL_DELAY, RECONCILE_INTERVAL,
    TUNNEL_ACCEPT_POLL, TUNNEL_PROBE_INTERVAL, VNC_LABEL, VNC_REMOTE_PORT,
};
use crate::connection::ConnectionManager;
use crate::data::InstanceId;
use crate::error::{ConnectError, Result};

use backoff::BackoffTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Error,
}

/// Read-only snapshot of one tunnel's state, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub label: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub status: TunnelStatus,
    pub last_error: Option<String>,
    pub last_check_unix_ms: Option<u128>,
}

struct RuntimeStatus {
    status: TunnelStatus,
    last_error: Option<String>,
    last_check_unix_ms: Option<u128>,
}

struct ActiveTunnel {
    local_port: u16,
    remote_port: u16,
    runtime: Arc<RwLock<RuntimeStatus>>,
    cancel: Option<oneshot::Sender<()>>,
}

impl ActiveTunnel {
    async fn snapshot(&self, label: &str) -> TunnelSnapshot {
        let runtime = self.runtime.read().await;
        TunnelSnapshot {
            label: label.to_string(),
            local_port: self.local_port,
            remote_port: self.remote_port,
            status: runtime.status,
            last_error: runtime.last_error.clone(),
            last_check_unix_ms: runtime.last_check_unix_ms,
        }
    }
}

/// Owns every instance's reverse tunnels. One lock over the tunnel map, one
/// lock over reconciliation backoff state; never held across SSH or
/// listener I/O.
pub struct TunnelManager {
    connections: Arc<ConnectionManager>,
    tunnels: RwLock<HashMap<InstanceId, HashMap<String, ActiveTunnel>>>,
    backoff: RwLock<BackoffTracker>,
    background_cancel: RwLock<Option<oneshot::Sender<()>>>,
    health_cancel: RwLock<Option<oneshot::Sender<()>>>,
}

impl TunnelManager {
    pub fn new(connections: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new(TunnelManager {
            connections,
            tunnels: RwLock::new(HashMap::new()),
            backoff: RwLock::new(BackoffTracker::new()),
            background_cancel: RwLock::new(None),
            health_cancel: RwLock::new(None),
        })
    }

    /// Bind a local listener and bridge every accepted connection to
    /// `remote_port` on the instance's agent over a `direct-tcpip` channel.
    /// `local_port` 0 auto-allocates. Replaces any existing tunnel with the
    /// same label for this instance.
    pub async fn create_reverse_tunnel(
        self: &Arc<Self>,
        instance_id: InstanceId,
        label: &str,
        remote_port: u16,
        local_port: u16,
    ) -> Result<u16> {
        let handle = self
            .connections
            .get_connection(instance_id)
            .await
            .ok_or(ConnectError::NotConnected(instance_id))?;

        let bind_addr = format!("127.0.0.1:{local_port}");
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| ConnectError::Tunnel {
                instance: instance_id,
                label: label.to_string(),
                source,
            })?;
        let bound_port = listener
            .local_addr()
            .map_err(|source| ConnectError::Tunnel {
                instance: instance_id,
                label: label.to_string(),
                source,
            })?
            .port();

        let runtime = Arc::new(RwLock::new(RuntimeStatus {
            status: TunnelStatus::Active,
            last_error: None,
            last_check_unix_ms: None,
        }));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        spawn_accept_loop(
            instance_id,
            label.to_string(),
            listener,
            remote_port,
            handle,
            runtime.clone(),
            cancel_rx,
        );

        let mut tunnels = self.tunnels.write().await;
        let instance_tunnels = tunnels.entry(instance_id).or_default();
        if let Some(mut old) = instance_tunnels.remove(label) {
            if let Some(cancel) = old.cancel.take() {
                let _ = cancel.send(());
            }
        }
        instance_tunnels.insert(
            label.to_string(),
            ActiveTunnel {
                local_port: bound_port,
                remote_port,
                runtime,
                cancel: Some(cancel_tx),
            },
        );

        info!("instance {instance_id}: tunnel '{label}' bound 127.0.0.1:{bound_port} -> agent:{remote_port}");
        Ok(bound_port)
    }

    pub async fn create_tunnel_for_vnc(self: &Arc<Self>, instance_id: InstanceId) -> Result<u16> {
        self.create_reverse_tunnel(instance_id, VNC_LABEL, VNC_REMOTE_PORT, 0).await
    }

    pub async fn create_tunnel_for_gateway(
        self: &Arc<Self>,
        instance_id: InstanceId,
        gateway_port: Option<u16>,
    ) -> Result<u16> {
        let remote_port = gateway_port.unwrap_or(GATEWAY_DEFAULT_REMOTE_PORT);
        self.create_reverse_tunnel(instance_id, GATEWAY_LABEL, remote_port, 0).await
    }

    /// Ensure a live connection, then (re)create the VNC and Gateway
    /// tunnels if none exist yet or any existing one is unhealthy.
    /// Partial failures are logged and do not abort the other tunnel.
    pub async fn start_tunnels_for_instance(
        self: &Arc<Self>,
        instance_id: InstanceId,
        orchestrator: &dyn Orchestrator,
    ) -> Result<()> {
        self.connections.ensure_connected(instance_id, orchestrator).await?;

        if self.all_tunnels_healthy(instance_id).await {
            return Ok(());
        }

        self.stop_tunnels_for_instance(instance_id).await;

        if let Err(e) = self.create_tunnel_for_vnc(instance_id).await {
            warn!("instance {instance_id}: VNC tunnel creation failed: {e}");
        }
        if let Err(e) = self.create_tunnel_for_gateway(instance_id, None).await {
            warn!("instance {instance_id}: Gateway tunnel creation failed: {e}");
        }
        Ok(())
    }

    async fn all_tunnels_healthy(&self, instance_id: InstanceId) -> bool {
        let tunnels = self.tunnels.read().await;
        match tunnels.get(&instance_id) {
            None => false,
            Some(instance_tunnels) => {
                !instance_tunnels.is_empty()
                    && instance_tunnels.len() >= 2
                    && {
                        let mut all_active = true;
                        for tunnel in instance_tunnels.values() {
                            if tunnel.runtime.read().await.status != TunnelStatus::Active {
                                all_active = false;
                                break;
                            }
                        }
                        all_active
                    }
            }
        }
    }

    /// Remove and cancel every tunnel for an instance. Idempotent.
    pub async fn stop_tunnels_for_instance(&self, instance_id: InstanceId) {
        let removed = self.tunnels.write().await.remove(&instance_id);
        if let Some(mut instance_tunnels) = removed {
            for (label, mut tunnel) in instance_tunnels.drain() {
                if let Some(cancel) = tunnel.cancel.take() {
                    let _ = cancel.send(());
                }
                debug!("instance {instance_id}: stopped tunnel '{label}'");
            }
        }
    }

    pub async fn get_tunnels_for_instance(&self, instance_id: InstanceId) -> Vec<TunnelSnapshot> {
        let tunnels = self.tunnels.read().await;
        match tunnels.get(&instance_id) {
            None => Vec::new(),
            Some(instance_tunnels) => {
                let mut out = Vec::with_capacity(instance_tunnels.len());
                for (label, tunnel) in instance_tunnels.iter() {
                    out.push(tunnel.snapshot(label).await);
                }
                out
            }
        }
    }

    pub async fn get_vnc_local_port(&self, instance_id: InstanceId) -> Option<u16> {
        self.local_port_for_label(instance_id, VNC_LABEL).await
    }

    pub async fn get_gateway_local_port(&self, instance_id: InstanceId) -> Option<u16> {
        self.local_port_for_label(instance_id, GATEWAY_LABEL).await
    }

    async fn local_port_for_label(&self, instance_id: InstanceId, label: &str) -> Option<u16> {
        self.tunnels
            .read()
            .await
            .get(&instance_id)?
            .get(label)
            .map(|t| t.local_port)
    }

    /// Launch the background reconciler: after an initial delay, reconcile
    /// tunnels against the running instance set every `RECONCILE_INTERVAL`.
    pub async fn start_background_manager(
        self: &Arc<Self>,
        lister: Arc<dyn InstanceLister>,
        orchestrator: Arc<dyn Orchestrator>,
    ) {
        self.stop_background_manager().await;
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *self.background_cancel.write().await = Some(cancel_tx);

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(RECONCILE_INITIAL_DELAY) => {}
                _ = &mut cancel_rx => return,
            }

            let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        manager.reconcile(lister.as_ref(), orchestrator.as_ref()).await;
                    }
                    _ = &mut cancel_rx => return,
                }
            }
        });
    }

    async fn stop_background_manager(&self) {
        if let Some(cancel) = self.background_cancel.write().await.take() {
            let _ = cancel.send(());
        }
    }

    async fn reconcile(self: &Arc<Self>, lister: &dyn InstanceLister, orchestrator: &dyn Orchestrator) {
        let running = match lister.list_running().await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("tunnel reconcile: failed to list running instances: {e}");
                return;
            }
        };
        let running_set: HashSet<InstanceId> = running.iter().copied().collect();

        let known: Vec<InstanceId> = self.tunnels.read().await.keys().copied().collect();
        let mut stopped = 0usize;
        for id in known {
            if !running_set.contains(&id) {
                self.stop_tunnels_for_instance(id).await;
                self.backoff.write().await.clear(id);
                stopped += 1;
            }
        }

        let mut started = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;
        for id in &running {
            if self.backoff.read().await.should_skip(*id) {
                skipped += 1;
                continue;
            }
            match self.start_tunnels_for_instance(*id, orchestrator).await {
                Ok(()) => {
                    self.backoff.write().await.clear(*id);
                    started += 1;
                }
                Err(e) => {
                    self.backoff.write().await.record_failure(*id, e.to_string());
                    failed += 1;
                }
            }
        }

        self.backoff.write().await.retain_known(&running_set);

        info!(
            "tunnel reconcile: {} running, {started} started, {skipped} skipped (backoff), {failed} failed, {stopped} stopped",
            running.len()
        );
    }

    /// Launch the secondary loop that TCP-dials each active tunnel's bound
    /// local port, marking failures `error` so the next reconcile recreates
    /// them.
    pub async fn start_tunnel_health_checker(self: &Arc<Self>) {
        self.stop_tunnel_health_checker().await;
        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        *self.health_cancel.write().await = Some(cancel_tx);

        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TUNNEL_PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.probe_all_tunnels().await,
                    _ = &mut cancel_rx => return,
                }
            }
        });
    }

    pub async fn stop_tunnel_health_checker(&self) {
        if let Some(cancel) = self.health_cancel.write().await.take() {
            let _ = cancel.send(());
        }
    }

    async fn probe_all_tunnels(&self) {
        let ports: Vec<(InstanceId, String, u16)> = {
            let tunnels = self.tunnels.read().await;
            tunnels
                .iter()
                .flat_map(|(id, labels)| labels.iter().map(move |(label, t)| (*id, label.clone(), t.local_port)))
                .collect()
        };

        for (instance_id, label, local_port) in ports {
            let addr = format!("127.0.0.1:{local_port}");
            let healthy = tokio::time::timeout(TUNNEL_ACCEPT_POLL, tokio::net::TcpStream::connect(&addr))
                .await
                .map(|r| r.is_ok())
                .unwrap_or(false);

            let tunnels = self.tunnels.read().await;
            if let Some(tunnel) = tunnels.get(&instance_id).and_then(|m| m.get(&label)) {
                let mut runtime = tunnel.runtime.write().await;
                runtime.last_check_unix_ms = Some(now_ms());
                if !healthy {
                    runtime.status = TunnelStatus::Error;
                    runtime.last_error = Some("tunnel health probe failed".to_string());
                }
            }
        }
    }

    /// Stop the background manager, the tunnel health checker, and every
    /// instance's tunnels.
    pub async fn stop_all(&self) {
        self.stop_background_manager().await;
        self.stop_tunnel_health_checker().await;
        let ids: Vec<InstanceId> = self.tunnels.read().await.keys().copied().collect();
        for id in ids {
            self.stop_tunnels_for_instance(id).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_accept_loop(
    instance_id: InstanceId,
    label: String,
    listener: TcpListener,
    remote_port: u16,
    handle: Arc<tokio::sync::Mutex<crate::connection::SshHandle>>,
    runtime: Arc<RwLock<RuntimeStatus>>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                result = tokio::time::timeout(TUNNEL_ACCEPT_POLL, listener.accept()) => result,
                _ = &mut cancel_rx => {
                    debug!("instance {instance_id}: tunnel '{label}' accept loop cancelled");
                    return;
                }
            };

            let (tcp_stream, _peer) = match accepted {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!("instance {instance_id}: tunnel '{label}' accept failed: {e}");
                    let mut status = runtime.write().await;
                    status.status = TunnelStatus::Error;
                    status.last_error = Some(e.to_string());
                    return;
                }
                Err(_) => continue, // accept deadline elapsed; re-check cancellation
            };

            let handle = handle.clone();
            let label_for_task = label.clone();
            tokio::spawn(async move {
                let channel = {
                    let guard = handle.lock().await;
                    guard.channel_open_direct_tcpip("127.0.0.1", remote_port as u32, "127.0.0.1", 0).await
                };

                let mut tcp_stream = tcp_stream;
                match channel {
                    Ok(channel) => {
                        let mut channel_stream = channel.into_stream();
                        if let Err(e) = copy_bidirectional(&mut tcp_stream, &mut channel_stream).await {
                            debug!("tunnel '{label_for_task}': stream closed: {e}");
                        }
                    }
                    Err(e) => {
                        warn!("tunnel '{label_for_task}': direct-tcpip dial failed: {e}");
                    }
                }
            });
        }
    });
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::keys::KeyStore;
    use crate::rate_limit::RateLimiter;
    use crate::state::StateTracker;

    async fn new_manager() -> Arc<TunnelManager> {
        let dir = std::env::temp_dir().join(format!("sshcore-tunneltest-{}", std::process::id()));
        let key_store = Arc::new(KeyStore::ensure_key_pair(&dir).await.unwrap());
        let state = Arc::new(StateTracker::new());
        let events = Arc::new(EventLog::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let connections = ConnectionManager::new(key_store, state, events, rate_limiter);
        TunnelManager::new(connections)
    }

    #[tokio::test]
    async fn creating_tunnel_without_connection_errors() {
        let manager = new_manager().await;
        let err = manager
            .create_reverse_tunnel(InstanceId(1), "VNC", 3000, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::NotConnected(_)));
    }

    #[tokio::test]
    async fn stop_tunnels_for_instance_is_idempotent() {
        let manager = new_manager().await;
        manager.stop_tunnels_for_instance(InstanceId(1)).await;
        manager.stop_tunnels_for_instance(InstanceId(1)).await;
        assert!(manager.get_tunnels_for_instance(InstanceId(1)).await.is_empty());
    }

    #[tokio::test]
    async fn unknown_instance_has_no_local_ports() {
        let manager = new_manager().await;
        assert!(manager.get_vnc_local_port(InstanceId(1)).await.is_none());
        assert!(manager.get_gateway_local_port(InstanceId(1)).await.is_none());
    }
}
