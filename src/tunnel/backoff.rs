//! Per-instance reconciliation backoff: doubling delay with a cap, tracked
//! independently of the reconnector's own backoff (these guard different
//! retry loops — tunnel reconciliation vs. SSH reconnection).

use std::time::Instant;

use crate::config::{TUNNEL_BACKOFF_INITIAL, TUNNEL_BACKOFF_MAX};

pub struct TunnelBackoff {
    attempt: u32,
    next_retry: Instant,
    pub last_error: Option<String>,
}

impl TunnelBackoff {
    fn new() -> Self {
        TunnelBackoff {
            attempt: 0,
            next_retry: Instant::now(),
            last_error: None,
        }
    }

    pub fn should_skip(&self, now: Instant) -> bool {
        now < self.next_retry
    }
}

/// Per-instance backoff state, created lazily on first failure.
#[derive(Default)]
pub struct BackoffTracker {
    entries: std::collections::HashMap<crate::data::InstanceId, TunnelBackoff>,
}

impl BackoffTracker {
    pub fn new() -> Self {
        BackoffTracker::default()
    }

    pub fn should_skip(&self, id: crate::data::InstanceId) -> bool {
        self.entries
            .get(&id)
            .map(|b| b.should_skip(Instant::now()))
            .unwrap_or(false)
    }

    pub fn clear(&mut self, id: crate::data::InstanceId) {
        self.entries.remove(&id);
    }

    pub fn record_failure(&mut self, id: crate::data::InstanceId, error: String) {
        let entry = self.entries.entry(id).or_insert_with(TunnelBackoff::new);
        entry.attempt += 1;
        let factor = 1u32.checked_shl(entry.attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let delay = TUNNEL_BACKOFF_INITIAL.saturating_mul(factor).min(TUNNEL_BACKOFF_MAX);
        entry.next_retry = Instant::now() + delay;
        entry.last_error = Some(error);
    }

    pub fn retain_known(&mut self, known: &std::collections::HashSet<crate::data::InstanceId>) {
        self.entries.retain(|id, _| known.contains(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InstanceId;
    use std::time::Duration;

    #[test]
    fn fresh_instance_is_never_skipped() {
        let tracker = BackoffTracker::new();
        assert!(!tracker.should_skip(InstanceId(1)));
    }

    #[test]
    fn failure_schedules_a_future_retry() {
        let mut tracker = BackoffTracker::new();
        let id = InstanceId(1);
        tracker.record_failure(id, "boom".into());
        assert!(tracker.should_skip(id));
        assert_eq!(tracker.entries.get(&id).unwrap().attempt, 1);
    }

    #[test]
    fn clear_removes_backoff() {
        let mut tracker = BackoffTracker::new();
        let id = InstanceId(1);
        tracker.record_failure(id, "boom".into());
        tracker.clear(id);
        assert!(!tracker.should_skip(id));
    }

    #[test]
    fn backoff_doubles_until_cap() {
        let mut tracker = BackoffTracker::new();
        let id = InstanceId(1);
        for _ in 0..10 {
            tracker.record_failure(id, "boom".into());
        }
        let entry = tracker.entries.get(&id).unwrap();
        let remaining = entry.next_retry.saturating_duration_since(Instant::now());
        assert!(remaining <= TUNNEL_BACKOFF_MAX + Duration::from_secs(1));
    }
}
