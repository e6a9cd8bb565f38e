//! # fleet-sshcore — SSH connectivity core for a fleet control plane
//!
//! `fleet-sshcore` maintains one multiplexed SSH session per running agent
//! instance, plus a set of reverse port-forwards ("tunnels") that expose
//! agent-local services (a desktop/VNC service, a web gateway) through
//! loopback ports on the control plane. Downstream collaborators — HTTP
//! handlers for terminals, file browsing, log streaming, metrics — consume
//! these connections and tunnels by instance ID.
//!
//! This crate is the connectivity core only: HTTP/WebSocket handlers, the
//! container runtime, the instance registry, and the audit sink are all
//! external collaborators. This crate depends on them through two traits
//! ([`collaborators::Orchestrator`], [`collaborators::InstanceLister`]) and
//! exposes one of its own ([`events::EventListener`]).
//!
//! ## What it composes
//!
//! - A per-instance connection lifecycle with state machine, event log, and
//!   metrics ([`connection`], [`state`], [`events`]).
//! - Application-level health checks layered over transport keepalives
//!   ([`health`]).
//! - Automatic reconnection with on-demand key re-upload ([`reconnect`]).
//! - Exponential-backoff reconciliation of reverse tunnels against a moving
//!   set of running instances ([`tunnel`]).
//! - Two layers of rate limiting: sliding window plus consecutive-failure
//!   block with escalation ([`rate_limit`]).
//! - Source-IP whitelisting ([`ip_restrict`]).
//! - Atomic hot-reload of the global ED25519 key pair ([`keys`]).
//!
//! These subsystems share no locks; [`SshCore`] is the composition root
//! that wires them together in the order that avoids deadlock under
//! concurrent failure and shutdown (see its module docs).
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use fleet_sshcore::collaborators::{InstanceLister, Orchestrator};
//! use fleet_sshcore::data::InstanceId;
//! use fleet_sshcore::SshCore;
//!
//! struct MyOrchestrator;
//!
//! #[async_trait::async_trait]
//! impl Orchestrator for MyOrchestrator {
//!     async fn get_ssh_address(&self, _id: InstanceId) -> Result<(String, u16), String> {
//!         Ok(("10.0.0.5".to_string(), 22))
//!     }
//!     async fn configure_ssh_access(&self, _id: InstanceId, _key: &str) -> Result<(), String> {
//!         Ok(())
//!     }
//! }
//!
//! struct MyLister;
//!
//! #[async_trait::async_trait]
//! impl InstanceLister for MyLister {
//!     async fn list_running(&self) -> Result<Vec<InstanceId>, String> {
//!         Ok(vec![InstanceId(7)])
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let core = SshCore::new(Path::new("/var/lib/sshcore/keys")).await?;
//!     let orchestrator: Arc<dyn Orchestrator> = Arc::new(MyOrchestrator);
//!     core.start(Arc::new(MyLister), orchestrator.clone()).await;
//!
//!     let instance = InstanceId(7);
//!     core.ensure_connected(instance, orchestrator.as_ref()).await?;
//!     core.tunnels.start_tunnels_for_instance(instance, orchestrator.as_ref()).await?;
//!
//!     if let Some(port) = core.get_vnc_local_port(instance).await {
//!         println!("VNC reachable at 127.0.0.1:{port}");
//!     }
//!
//!     core.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Main components
//!
//! - [`SshCore`] - Composition root; the entry point most callers hold.
//! - [`connection::ConnectionManager`] - Owns the per-instance SSH sessions.
//! - [`tunnel::TunnelManager`] - Owns the per-instance reverse tunnels.
//! - [`reconnect::Reconnector`] - Single-flight backoff reconnection.
//! - [`health::HealthMonitor`] - Periodic `echo ping` liveness checks.
//! - [`keys::KeyStore`] - The process-wide ED25519 key pair.
//! - [`error::ConnectError`] - Error types surfaced by every component.
//! - [`config`] - Tunable timeouts, intervals, and thresholds.

pub mod collaborators;
pub mod config;
pub mod connection;
pub mod data;
pub mod error;
pub mod events;
pub mod health;
pub mod ip_restrict;
pub mod keys;
pub mod maintenance;
pub mod rate_limit;
pub mod reconnect;
pub mod state;
pub mod tunnel;

mod core;

pub use core::SshCore;
pub use data::InstanceId;
pub use error::{ConnectError, Result};
