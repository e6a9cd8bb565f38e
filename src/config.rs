//! Tunable timeouts, intervals, and thresholds for the connectivity core.
//!
//! Centralizes the defaults named throughout the design (dial/keepalive/
//! health-check/backoff/rate-limit timing) the same way the teacher crate
//! centralized its SSH algorithm preference tables — one place to read and
//! adjust the knobs that govern connection behavior.

use std::time::Duration;

/// SSH user used for every handshake. One global key pair, one user.
pub const SSH_USER: &str = "root";

/// TCP dial timeout; the handshake must also complete within this budget.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between `keepalive@openssh.com` global requests per connection.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Total timeout for a single `echo ping` health-check command.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between health-checker sweeps over all live connections.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between tunnel TCP health probes.
pub const TUNNEL_PROBE_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between background tunnel reconciliation ticks.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first reconciliation tick, to let the instance lister
/// warm up after a cold start. Kept as a tunable per an open design question:
/// a fresh lister may report zero instances during this window, which is
/// harmless (reconcile is idempotent) but avoids a guaranteed-useless first pass.
pub const RECONCILE_INITIAL_DELAY: Duration = Duration::from_secs(10);

/// Reconnect backoff: initial delay, cap, and maximum attempts per
/// single-flight reconnect loop before giving up and marking the instance failed.
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(16);
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Tunnel reconciliation backoff: initial delay and cap, doubling per failure.
pub const TUNNEL_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
pub const TUNNEL_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Rate limiter: sliding window length and max attempts admitted within it.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
pub const RATE_LIMIT_MAX_ATTEMPTS: usize = 10;

/// Rate limiter: consecutive failures before a block is imposed, and the
/// escalating block duration (doubles per repeated offence, capped).
pub const RATE_LIMIT_FAILURE_THRESHOLD: u32 = 5;
pub const RATE_LIMIT_BLOCK_INITIAL: Duration = Duration::from_secs(30);
pub const RATE_LIMIT_BLOCK_MAX: Duration = Duration::from_secs(5 * 60);

/// Capacity of the per-instance state-transition history and event ring buffer.
pub const STATE_HISTORY_CAPACITY: usize = 50;
pub const EVENT_LOG_CAPACITY: usize = 100;

/// Accept-loop poll interval for tunnel listeners, so the loop can observe
/// cancellation promptly without a true async-cancellable `accept`.
pub const TUNNEL_ACCEPT_POLL: Duration = Duration::from_secs(1);

/// Default remote ports and labels for the two well-known tunnel kinds.
pub const VNC_LABEL: &str = "VNC";
pub const VNC_REMOTE_PORT: u16 = 3000;
pub const GATEWAY_LABEL: &str = "Gateway";
pub const GATEWAY_DEFAULT_REMOTE_PORT: u16 = 8080;

/// Remote command used by the health monitor.
pub const HEALTH_CHECK_COMMAND: &str = "echo ping";
