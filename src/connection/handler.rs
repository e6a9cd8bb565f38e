//! `russh::client::Handler` implementation.
//!
//! Host-key verification is an explicit non-goal here (agents are
//! ephemeral; trust is established by the orchestrator placing our public
//! key, not by pinning the agent's host key) — every server key is
//! accepted, the way `TunnelClientHandler::check_server_key` in the
//! Xiechengqi tcp-tunnel example does when strict checking is disabled.

pub struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
