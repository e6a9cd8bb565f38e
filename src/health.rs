//! Health monitor: runs `echo ping` over each live session on a timer,
//! lower-level than the transport keepalive so a hung-but-alive agent is
//! still detected.
//!
//! The exec/wait loop over `ChannelMsg` follows the shell-interaction loop
//! in the teacher's `SharedSshClient::new` (`channel.wait()` matched
//! against `ChannelMsg::Data` / `ExitStatus` / `Eof`), adapted from an
//! interactive shell channel to a one-shot `exec` channel.

use std::sync::Arc;

use log::{debug, warn};
use russh::ChannelMsg;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{HEALTH_CHECK_COMMAND, HEALTH_CHECK_INTERVAL, HEALTH_CHECK_TIMEOUT};
use crate::connection::ConnectionManager;
use crate::data::InstanceId;
use crate::error::{ConnectError, Result};

/// Runs the periodic health-check sweep. Owns no connection state itself;
/// it reads the connection manager's current instance set and its cached
/// clients.
pub struct HealthMonitor {
    connections: Arc<ConnectionManager>,
    loop_handle: RwLock<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        HealthMonitor {
            connections,
            loop_handle: RwLock::new(None),
        }
    }

    /// Run `echo ping` on the instance's session with a 5-second total
    /// timeout; updates metrics with the outcome.
    pub async fn health_check(&self, instance_id: InstanceId) -> Result<()> {
        let Some(handle) = self.connections.get_connection(instance_id).await else {
            return Err(ConnectError::NotConnected(instance_id));
        };

        let result = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, run_ping(handle)).await;

        let outcome = match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectError::HealthCheckFailed(instance_id, e.to_string())),
            Err(_) => Err(ConnectError::HealthCheckTimeout(instance_id)),
        };

        self.connections
            .record_health_check(instance_id, outcome.is_ok())
            .await;
        outcome
    }

    /// Launch the periodic sweep. Idempotent: calling twice replaces the
    /// previous loop handle (the old loop is aborted).
    pub async fn start(self: &Arc<Self>) {
        self.stop().await;
        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                let ids = monitor.connections.instance_ids().await;
                for id in ids {
                    if let Err(e) = monitor.health_check(id).await {
                        warn!("instance {id}: health check failed: {e}");
                        monitor.connections.close(id).await.ok();
                        monitor
                            .connections
                            .emit_health_check_failed(id, e.to_string())
                            .await;
                        monitor
                            .connections
                            .notify_disconnected(id, "health check failed".to_string())
                            .await;
                    } else {
                        debug!("instance {id}: health check ok");
                    }
                }
            }
        });
        *self.loop_handle.write().await = Some(handle);
    }

    /// Cancel the periodic sweep. Idempotent.
    pub async fn stop(&self) {
        if let Some(handle) = self.loop_handle.write().await.take() {
            handle.abort();
        }
    }
}

async fn run_ping(handle: Arc<tokio::sync::Mutex<crate::connection::SshHandle>>) -> std::result::Result<(), String> {
    let mut channel = handle
        .lock()
        .await
        .channel_open_session()
        .await
        .map_err(|e| e.to_string())?;

    channel
        .exec(true, HEALTH_CHECK_COMMAND)
        .await
        .map_err(|e| e.to_string())?;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                return if exit_status == 0 {
                    Ok(())
                } else {
                    Err(format!("echo ping exited with status {exit_status}"))
                };
            }
            Some(ChannelMsg::Eof) | None => {
                return Err("channel closed before exit status".to_string());
            }
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventLog;
    use crate::keys::KeyStore;
    use crate::rate_limit::RateLimiter;
    use crate::state::StateTracker;

    async fn new_monitor() -> Arc<HealthMonitor> {
        let dir = std::env::temp_dir().join(format!("sshcore-healthtest-{}", std::process::id()));
        let key_store = Arc::new(KeyStore::ensure_key_pair(&dir).await.unwrap());
        let state = Arc::new(StateTracker::new());
        let events = Arc::new(EventLog::new());
        let rate_limiter = Arc::new(RateLimiter::new());
        let connections = ConnectionManager::new(key_store, state, events, rate_limiter);
        Arc::new(HealthMonitor::new(connections))
    }

    #[tokio::test]
    async fn health_check_on_unknown_instance_errors() {
        let monitor = new_monitor().await;
        let err = monitor.health_check(InstanceId(1)).await.unwrap_err();
        assert!(matches!(err, ConnectError::NotConnected(_)));
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let monitor = new_monitor().await;
        monitor.start().await;
        monitor.start().await;
        monitor.stop().await;
        monitor.stop().await;
    }
}
