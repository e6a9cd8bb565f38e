//! Collaborator interfaces consumed by the connectivity core. Concrete
//! implementations (container runtime, instance registry) live outside
//! this crate; the core only depends on these traits.

use async_trait::async_trait;

use crate::data::InstanceId;

/// Abstraction over the container runtime: resolves an instance's SSH
/// endpoint and installs the core's public key as an authorized key.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Resolve a reachable SSH endpoint for `instance_id`.
    async fn get_ssh_address(&self, instance_id: InstanceId) -> Result<(String, u16), String>;

    /// Install `public_key_text` as an authorized key on the agent.
    /// Idempotent; may be called on every reconnect attempt.
    async fn configure_ssh_access(
        &self,
        instance_id: InstanceId,
        public_key_text: &str,
    ) -> Result<(), String>;
}

/// Returns the current set of running instance ids; drives tunnel
/// reconciliation.
#[async_trait]
pub trait InstanceLister: Send + Sync {
    async fn list_running(&self) -> Result<Vec<InstanceId>, String>;
}
