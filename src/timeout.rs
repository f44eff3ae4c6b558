//! Timeout supervision: decides how long the next read may wait and which
//! deadline (if any) has fired.
//!
//! Two independent bounds apply. The total timeout runs from process start;
//! the idle timeout runs from the last delivered line (or from start if no
//! line has arrived yet). When both have elapsed, the total timeout wins.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Timeout configuration for one monitored run. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPolicy {
    pub total: Option<Duration>,
    pub idle: Option<Duration>,
}

impl TimeoutPolicy {
    pub fn new(total: Option<Duration>, idle: Option<Duration>) -> Self {
        Self { total, idle }
    }

    /// True when neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.total.is_none() && self.idle.is_none()
    }
}

/// Why a run was stopped before its output stream closed on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutCause {
    /// Wall-clock runtime exceeded the total timeout.
    TotalTimeout,
    /// No output for longer than the idle timeout.
    IdleTimeout,
    /// An external caller requested termination.
    Cancelled,
}

impl TimeoutCause {
    /// Cancellation shares the kill path but is not a timeout.
    pub fn is_timeout(self) -> bool {
        matches!(self, TimeoutCause::TotalTimeout | TimeoutCause::IdleTimeout)
    }
}

impl std::fmt::Display for TimeoutCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutCause::TotalTimeout => write!(f, "total timeout"),
            TimeoutCause::IdleTimeout => write!(f, "idle timeout"),
            TimeoutCause::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-run deadline bookkeeping.
#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: TimeoutPolicy,
    start: Instant,
    last_output: Instant,
}

impl Supervisor {
    pub fn new(policy: TimeoutPolicy, start: Instant) -> Self {
        Self {
            policy,
            start,
            last_output: start,
        }
    }

    pub fn policy(&self) -> TimeoutPolicy {
        self.policy
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Reset the idle window. Called together with every delivered line.
    pub fn record_output(&mut self, now: Instant) {
        self.last_output = now;
    }

    fn remaining_total(&self, now: Instant) -> Option<Duration> {
        self.policy
            .total
            .map(|total| total.saturating_sub(now.saturating_duration_since(self.start)))
    }

    fn remaining_idle(&self, now: Instant) -> Option<Duration> {
        self.policy
            .idle
            .map(|idle| idle.saturating_sub(now.saturating_duration_since(self.last_output)))
    }

    /// How long the next read may block. `None` means block indefinitely.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        match (self.remaining_total(now), self.remaining_idle(now)) {
            (Some(total), Some(idle)) => Some(total.min(idle)),
            (Some(total), None) => Some(total),
            (None, Some(idle)) => Some(idle),
            (None, None) => None,
        }
    }

    /// The deadline that has fired at `now`, if any. Total takes precedence.
    pub fn expired(&self, now: Instant) -> Option<TimeoutCause> {
        if self.remaining_total(now) == Some(Duration::ZERO) {
            return Some(TimeoutCause::TotalTimeout);
        }
        if self.remaining_idle(now) == Some(Duration::ZERO) {
            return Some(TimeoutCause::IdleTimeout);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_unbounded_policy_has_no_deadline() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::default(), start);
        assert!(sup.policy().is_unbounded());
        assert_eq!(sup.next_deadline(start + secs(1000)), None);
        assert_eq!(sup.expired(start + secs(1000)), None);
    }

    #[test]
    fn test_total_only_counts_down_from_start() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::new(Some(secs(10)), None), start);
        assert_eq!(sup.next_deadline(start), Some(secs(10)));
        assert_eq!(sup.next_deadline(start + secs(4)), Some(secs(6)));
        assert_eq!(sup.expired(start + secs(9)), None);
    }

    #[test]
    fn test_total_clips_to_zero_and_fires() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::new(Some(secs(2)), None), start);
        assert_eq!(sup.next_deadline(start + secs(5)), Some(Duration::ZERO));
        assert_eq!(sup.expired(start + secs(5)), Some(TimeoutCause::TotalTimeout));
    }

    #[test]
    fn test_idle_window_resets_on_output() {
        let start = Instant::now();
        let mut sup = Supervisor::new(TimeoutPolicy::new(None, Some(secs(3))), start);
        assert_eq!(sup.next_deadline(start + secs(1)), Some(secs(2)));

        sup.record_output(start + secs(2));
        assert_eq!(sup.next_deadline(start + secs(2)), Some(secs(3)));
        assert_eq!(sup.expired(start + secs(4)), None);
        assert_eq!(sup.expired(start + secs(5)), Some(TimeoutCause::IdleTimeout));
    }

    #[test]
    fn test_idle_counts_from_start_before_first_line() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::new(None, Some(secs(1))), start);
        assert_eq!(sup.expired(start + secs(1)), Some(TimeoutCause::IdleTimeout));
    }

    #[test]
    fn test_deadline_is_min_of_both_bounds() {
        let start = Instant::now();
        let mut sup = Supervisor::new(TimeoutPolicy::new(Some(secs(10)), Some(secs(3))), start);
        assert_eq!(sup.next_deadline(start), Some(secs(3)));

        sup.record_output(start + secs(8));
        // Only 2s of total budget left, less than the fresh idle window.
        assert_eq!(sup.next_deadline(start + secs(8)), Some(secs(2)));
    }

    #[test]
    fn test_total_wins_when_both_elapse_together() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::new(Some(secs(2)), Some(secs(2))), start);
        assert_eq!(sup.expired(start + secs(2)), Some(TimeoutCause::TotalTimeout));
        assert_eq!(sup.expired(start + secs(7)), Some(TimeoutCause::TotalTimeout));
    }

    #[test]
    fn test_idle_fires_first_when_shorter() {
        let start = Instant::now();
        let sup = Supervisor::new(TimeoutPolicy::new(Some(secs(10)), Some(secs(1))), start);
        assert_eq!(sup.expired(start + secs(1)), Some(TimeoutCause::IdleTimeout));
    }

    #[test]
    fn test_burst_of_output_still_advances_total() {
        let start = Instant::now();
        let mut sup = Supervisor::new(TimeoutPolicy::new(Some(secs(5)), Some(secs(5))), start);
        for i in 1..=5 {
            sup.record_output(start + secs(i));
        }
        assert_eq!(sup.expired(start + secs(5)), Some(TimeoutCause::TotalTimeout));
    }

    #[test]
    fn test_cause_classification() {
        assert!(TimeoutCause::TotalTimeout.is_timeout());
        assert!(TimeoutCause::IdleTimeout.is_timeout());
        assert!(!TimeoutCause::Cancelled.is_timeout());
        assert_eq!(TimeoutCause::IdleTimeout.to_string(), "idle timeout");
    }
}
