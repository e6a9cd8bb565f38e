//! Error types surfaced by the SSH connectivity core.
//!
//! Policy refusals (rate limiting, IP restriction) carry structured fields
//! so callers can act on them directly; transport and collaborator failures
//! are wrapped with the operation and instance id in their message.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::data::InstanceId;

/// Errors returned by the connection manager, tunnel manager, and
/// maintenance loops.
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Rejected by the per-instance rate limiter before a dial was attempted.
    #[error("instance {instance_id}: rate limited ({reason}), retry after {retry_after:?}")]
    RateLimited {
        instance_id: InstanceId,
        reason: String,
        retry_after: Duration,
    },

    /// Rejected by the source-IP allow list before a dial was attempted.
    #[error("instance {instance_id}: source ip {source_ip} not allowed ({reason})")]
    IpRestricted {
        instance_id: InstanceId,
        source_ip: IpAddr,
        reason: String,
    },

    /// No live connection for this instance.
    #[error("instance {0}: not connected")]
    NotConnected(InstanceId),

    /// Dial did not complete within the configured timeout.
    #[error("instance {0}: dial timed out")]
    DialTimeout(InstanceId),

    /// An error occurred in the russh client library (handshake, auth, channel).
    #[error("instance {instance_id}: ssh error: {source}")]
    Ssh {
        instance_id: InstanceId,
        #[source]
        source: russh::Error,
    },

    /// Public-key authentication was rejected by the agent.
    #[error("instance {0}: public key authentication rejected")]
    AuthRejected(InstanceId),

    /// Health-check command did not complete within the configured timeout.
    #[error("instance {0}: health check timed out")]
    HealthCheckTimeout(InstanceId),

    /// Health-check command completed but returned an error.
    #[error("instance {0}: health check failed: {1}")]
    HealthCheckFailed(InstanceId, String),

    /// Orchestrator's `GetSSHAddress` failed.
    #[error("instance {0}: address lookup failed: {1}")]
    AddressLookup(InstanceId, String),

    /// Orchestrator's `ConfigureSSHAccess` failed.
    #[error("instance {0}: key upload failed: {1}")]
    KeyUpload(InstanceId, String),

    /// No orchestrator is registered; reconnection cannot proceed.
    #[error("no orchestrator registered")]
    NoOrchestrator,

    /// A tunnel operation failed to bind or accept.
    #[error("instance {instance}: tunnel '{label}' failed: {source}")]
    Tunnel {
        instance: InstanceId,
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// The key store could not load or persist the key pair.
    #[error("key store: {0}")]
    KeyStore(String),

    /// One or more errors occurred while closing every connection or tunnel;
    /// this carries the first one encountered.
    #[error("shutdown encountered {count} error(s); first: {first}")]
    Shutdown { count: usize, first: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConnectError>;
