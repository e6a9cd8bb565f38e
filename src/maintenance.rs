//! Maintenance loops: wires the health monitor, tunnel manager, and
//! reconnector together and owns the graceful shutdown sequence.
//!
//! Shutdown order is tunnels before connections: a tunnel's accept loop
//! depends on a live connection to open `direct-tcpip` channels, so tearing
//! connections down first would leave tunnel loops failing their next dial
//! instead of shutting down cleanly.

use std::sync::Arc;

use log::info;

use crate::collaborators::{InstanceLister, Orchestrator};
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::reconnect::Reconnector;
use crate::tunnel::TunnelManager;

pub struct MaintenanceLoops {
    connections: Arc<ConnectionManager>,
    health: Arc<HealthMonitor>,
    tunnels: Arc<TunnelManager>,
    reconnector: Arc<Reconnector>,
}

impl MaintenanceLoops {
    pub fn new(
        connections: Arc<ConnectionManager>,
        health: Arc<HealthMonitor>,
        tunnels: Arc<TunnelManager>,
        reconnector: Arc<Reconnector>,
    ) -> Self {
        MaintenanceLoops {
            connections,
            health,
            tunnels,
            reconnector,
        }
    }

    /// Start every persistent maintenance worker: the health checker, the
    /// tunnel health checker, and the background reconciler.
    pub async fn start(&self, lister: Arc<dyn InstanceLister>, orchestrator: Arc<dyn Orchestrator>) {
        self.health.start().await;
        self.tunnels.start_tunnel_health_checker().await;
        self.tunnels.start_background_manager(lister, orchestrator).await;
        info!("maintenance loops started");
    }

    /// Stop every maintenance worker and in-flight reconnect, tear down
    /// every tunnel, then close every connection. Collects but does not
    /// short-circuit on individual connection close errors (see
    /// `ConnectionManager::close_all`).
    pub async fn shutdown(&self) -> Result<()> {
        self.health.stop().await;
        self.tunnels.stop_all().await;
        self.reconnector.cancel_all_reconnections().await;
        let result = self.connections.close_all().await;
        info!("maintenance loops stopped");
        result
    }
}
