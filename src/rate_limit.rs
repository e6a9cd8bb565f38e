//! Two-tier per-instance rate limiter: a sliding attempt window plus a
//! consecutive-failure escalating block.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;

use crate::config::{
    RATE_LIMIT_BLOCK_INITIAL, RATE_LIMIT_BLOCK_MAX, RATE_LIMIT_FAILURE_THRESHOLD,
    RATE_LIMIT_MAX_ATTEMPTS, RATE_LIMIT_WINDOW,
};
use crate::data::InstanceId;
use crate::error::{ConnectError, Result};

struct LimiterState {
    attempts: VecDeque<Instant>,
    consecutive_failures: u32,
    blocked_until: Option<Instant>,
    escalation: u32,
}

impl LimiterState {
    fn new() -> Self {
        LimiterState {
            attempts: VecDeque::new(),
            consecutive_failures: 0,
            blocked_until: None,
            escalation: 0,
        }
    }
}

/// Observability snapshot of one instance's rate-limit state.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitSnapshot {
    pub attempts_in_window: usize,
    pub consecutive_failures: u32,
    pub blocked: bool,
    pub escalation: u32,
}

pub struct RateLimiter {
    instances: RwLock<HashMap<InstanceId, LimiterState>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            instances: RwLock::new(HashMap::new()),
        }
    }

    /// Admit or refuse a connect attempt for `instance_id`.
    pub async fn allow(&self, instance_id: InstanceId) -> Result<()> {
        let now = Instant::now();
        let mut instances = self.instances.write().await;
        let state = instances.entry(instance_id).or_insert_with(LimiterState::new);

        if let Some(blocked_until) = state.blocked_until {
            if now < blocked_until {
                return Err(ConnectError::RateLimited {
                    instance_id,
                    reason: "consecutive failure block active".into(),
                    retry_after: blocked_until - now,
                });
            }
        }

        while let Some(&oldest) = state.attempts.front() {
            if now.duration_since(oldest) >= RATE_LIMIT_WINDOW {
                state.attempts.pop_front();
            } else {
                break;
            }
        }

        if state.attempts.len() >= RATE_LIMIT_MAX_ATTEMPTS {
            let oldest = *state.attempts.front().expect("len checked above");
            let retry_after = RATE_LIMIT_WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(ConnectError::RateLimited {
                instance_id,
                reason: format!(
                    "sliding window exceeded ({} attempts in {:?})",
                    state.attempts.len(),
                    RATE_LIMIT_WINDOW
                ),
                retry_after,
            });
        }

        state.attempts.push_back(now);
        Ok(())
    }

    /// Record a failed connect attempt; escalate the block once the
    /// consecutive-failure threshold is reached.
    pub async fn record_failure(&self, instance_id: InstanceId) {
        let now = Instant::now();
        let mut instances = self.instances.write().await;
        let state = instances.entry(instance_id).or_insert_with(LimiterState::new);

        state.consecutive_failures += 1;
        if state.consecutive_failures >= RATE_LIMIT_FAILURE_THRESHOLD {
            let delay = RATE_LIMIT_BLOCK_INITIAL
                .saturating_mul(1u32.checked_shl(state.escalation).unwrap_or(u32::MAX))
                .min(RATE_LIMIT_BLOCK_MAX);
            state.blocked_until = Some(now + delay);
            state.escalation = state.escalation.saturating_add(1);
        }
    }

    /// Record a successful connect attempt; resets consecutive failures,
    /// the block, and the escalation counter. Attempt timestamps are left
    /// alone to age out of the window naturally.
    pub async fn record_success(&self, instance_id: InstanceId) {
        let mut instances = self.instances.write().await;
        let state = instances.entry(instance_id).or_insert_with(LimiterState::new);
        state.consecutive_failures = 0;
        state.blocked_until = None;
        state.escalation = 0;
    }

    /// Wipe all rate-limit state for one instance.
    pub async fn reset(&self, instance_id: InstanceId) {
        self.instances.write().await.remove(&instance_id);
    }

    /// Snapshot of counters for observability.
    pub async fn get_state(&self, instance_id: InstanceId) -> RateLimitSnapshot {
        let now = Instant::now();
        let instances = self.instances.read().await;
        match instances.get(&instance_id) {
            Some(state) => RateLimitSnapshot {
                attempts_in_window: state.attempts.len(),
                consecutive_failures: state.consecutive_failures,
                blocked: state.blocked_until.is_some_and(|t| now < t),
                escalation: state.escalation,
            },
            None => RateLimitSnapshot {
                attempts_in_window: 0,
                consecutive_failures: 0,
                blocked: false,
                escalation: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_admits_up_to_max_then_refuses() {
        let limiter = RateLimiter::new();
        let id = InstanceId(1);
        for _ in 0..RATE_LIMIT_MAX_ATTEMPTS {
            limiter.allow(id).await.unwrap();
        }
        let err = limiter.allow(id).await.unwrap_err();
        assert!(matches!(err, ConnectError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn rate_limit_isolated_per_instance() {
        let limiter = RateLimiter::new();
        let a = InstanceId(1);
        let b = InstanceId(2);
        for _ in 0..RATE_LIMIT_MAX_ATTEMPTS {
            limiter.allow(a).await.unwrap();
        }
        assert!(limiter.allow(a).await.is_err());
        assert!(limiter.allow(b).await.is_ok());
    }

    #[tokio::test]
    async fn consecutive_failures_below_threshold_do_not_block() {
        let limiter = RateLimiter::new();
        let id = InstanceId(1);
        for _ in 0..(RATE_LIMIT_FAILURE_THRESHOLD - 1) {
            limiter.record_failure(id).await;
        }
        assert!(limiter.allow(id).await.is_ok());
    }

    #[tokio::test]
    async fn consecutive_failures_at_threshold_blocks() {
        let limiter = RateLimiter::new();
        let id = InstanceId(1);
        for _ in 0..RATE_LIMIT_FAILURE_THRESHOLD {
            limiter.record_failure(id).await;
        }
        let err = limiter.allow(id).await.unwrap_err();
        match err {
            ConnectError::RateLimited { retry_after, .. } => {
                assert!(retry_after <= RATE_LIMIT_BLOCK_INITIAL);
            }
            _ => panic!("expected RateLimited"),
        }
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let limiter = RateLimiter::new();
        let id = InstanceId(1);
        for _ in 0..(RATE_LIMIT_FAILURE_THRESHOLD - 1) {
            limiter.record_failure(id).await;
        }
        limiter.record_success(id).await;
        let snapshot = limiter.get_state(id).await;
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(!snapshot.blocked);
    }
}
