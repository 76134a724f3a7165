//! Sliding-window-log evaluation.
//!
//! Everything here is pure: the caller supplies the stored sequence and the
//! current time, and decides what to persist.

use chrono::TimeDelta;
use serde::Serialize;
use std::time::Duration;

use super::clock::Timestamp;
use crate::error::{LimiterError, Result};

/// A call limit over a trailing time window.
///
/// Policies are supplied per call and never persisted, so a caller may
/// tighten or relax a limit without touching the recorded history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    max_calls: u32,
    span: TimeDelta,
}

impl Policy {
    /// Create a policy allowing `max_calls` within any `window`.
    pub fn new(max_calls: u32, window: Duration) -> Result<Self> {
        if max_calls == 0 {
            return Err(LimiterError::InvalidPolicy(
                "max_calls must be positive".to_string(),
            ));
        }
        let span = window_span(window)?;
        Ok(Self { max_calls, span })
    }
}

/// Validate a window length and convert it for timestamp arithmetic.
pub fn window_span(window: Duration) -> Result<TimeDelta> {
    if window.is_zero() {
        return Err(LimiterError::InvalidPolicy(
            "window must be positive".to_string(),
        ));
    }
    TimeDelta::from_std(window).map_err(|_| {
        LimiterError::InvalidPolicy(format!("window of {:?} is too large", window))
    })
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the invocation may proceed
    pub allowed: bool,
    /// Calls still permitted in the current window after this one
    pub remaining: u32,
    /// Time until a slot frees up; zero when allowed
    pub retry_after: Duration,
}

impl Decision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after: Duration::ZERO,
        }
    }

    fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            retry_after,
        }
    }
}

/// Decision plus the sequence that reflects it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    /// Pruned sequence, extended with `now` when allowed
    pub sequence: Vec<Timestamp>,
}

/// Read-only summary of the records still inside a window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub count: usize,
    pub oldest: Option<Timestamp>,
    pub newest: Option<Timestamp>,
}

impl Usage {
    pub fn of(active: &[Timestamp]) -> Self {
        Self {
            count: active.len(),
            oldest: active.first().copied(),
            newest: active.last().copied(),
        }
    }
}

/// Whether `t` has left the window as seen from `now`.
///
/// A timestamp ahead of `now` has a negative age and never expires, so a
/// clock stepping backwards cannot hand out extra quota.
fn is_expired(t: &Timestamp, now: Timestamp, span: TimeDelta) -> bool {
    now.signed_duration_since(*t) >= span
}

/// Drop the expired prefix of a sorted sequence.
pub fn prune(sequence: &[Timestamp], now: Timestamp, span: TimeDelta) -> &[Timestamp] {
    let first_active = sequence.partition_point(|t| is_expired(t, now, span));
    &sequence[first_active..]
}

/// Decide an attempt at `now` against the stored `sequence` (oldest first).
pub fn evaluate(sequence: &[Timestamp], now: Timestamp, policy: &Policy) -> Evaluation {
    let active = prune(sequence, now, policy.span);
    let used = active.len();
    let max_calls = policy.max_calls as usize;

    if used < max_calls {
        let mut updated = Vec::with_capacity(used + 1);
        updated.extend_from_slice(active);
        let at = updated.partition_point(|t| *t <= now);
        updated.insert(at, now);

        return Evaluation {
            decision: Decision::allow((max_calls - used - 1) as u32),
            sequence: updated,
        };
    }

    // One slot opens once the record at `used - max_calls` expires. Under a
    // steady policy that is the oldest record; after a limit was lowered
    // more than one record has to go first.
    let blocking = active[used - max_calls];
    let age = now.signed_duration_since(blocking);
    let retry_after = (policy.span - age).to_std().unwrap_or(Duration::ZERO);

    Evaluation {
        decision: Decision::deny(retry_after),
        sequence: active.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn at(secs: i64) -> Timestamp {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn policy(max_calls: u32, window_secs: u64) -> Policy {
        Policy::new(max_calls, Duration::from_secs(window_secs)).unwrap()
    }

    #[test]
    fn test_policy_rejects_zero_calls() {
        assert!(matches!(
            Policy::new(0, Duration::from_secs(60)),
            Err(LimiterError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_policy_rejects_zero_window() {
        assert!(matches!(
            Policy::new(3, Duration::ZERO),
            Err(LimiterError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_policy_rejects_unrepresentable_window() {
        assert!(matches!(
            Policy::new(3, Duration::from_secs(u64::MAX)),
            Err(LimiterError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_three_per_minute_then_deny() {
        let policy = policy(3, 60);
        let mut sequence = Vec::new();

        for (t, expected_remaining) in [(0, 2), (1, 1), (2, 0)] {
            let eval = evaluate(&sequence, at(t), &policy);
            assert!(eval.decision.allowed);
            assert_eq!(eval.decision.remaining, expected_remaining);
            assert_eq!(eval.decision.retry_after, Duration::ZERO);
            sequence = eval.sequence;
        }

        let eval = evaluate(&sequence, at(3), &policy);
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.remaining, 0);
        assert_eq!(eval.decision.retry_after, Duration::from_secs(57));
        assert_eq!(eval.sequence, sequence);
    }

    #[test]
    fn test_expired_records_free_slots() {
        let policy = policy(3, 60);
        let sequence = vec![at(0), at(1), at(2)];

        let eval = evaluate(&sequence, at(61), &policy);
        assert!(eval.decision.allowed);
        // t=0 and t=1 are both a full window old at t=61
        assert_eq!(eval.decision.remaining, 1);
        assert_eq!(eval.sequence, vec![at(2), at(61)]);
    }

    #[test]
    fn test_record_exactly_one_window_old_is_expired() {
        let span = TimeDelta::seconds(60);
        let sequence = vec![at(0), at(1)];
        assert_eq!(prune(&sequence, at(60), span), &[at(1)]);
        assert_eq!(prune(&sequence, at(59), span), &[at(0), at(1)]);
    }

    #[test]
    fn test_future_records_are_never_pruned() {
        let policy = policy(2, 10);
        // Both records lie ahead of `now`, as after a backwards clock step.
        let sequence = vec![at(100), at(101)];

        let eval = evaluate(&sequence, at(0), &policy);
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.retry_after, Duration::from_secs(110));
    }

    #[test]
    fn test_allow_under_skew_keeps_order() {
        let policy = policy(3, 600);
        let sequence = vec![at(10), at(50)];

        let eval = evaluate(&sequence, at(20), &policy);
        assert!(eval.decision.allowed);
        assert_eq!(eval.sequence, vec![at(10), at(20), at(50)]);
    }

    #[test]
    fn test_lowered_limit_waits_for_enough_expiries() {
        let sequence = vec![at(0), at(10), at(20), at(30)];

        // Four records active but only two allowed: the record at t=20 must
        // leave the window before one slot opens.
        let eval = evaluate(&sequence, at(40), &policy(2, 60));
        assert!(!eval.decision.allowed);
        assert_eq!(eval.decision.retry_after, Duration::from_secs(40));

        // Raising the limit uses the same history.
        let eval = evaluate(&sequence, at(40), &policy(10, 60));
        assert!(eval.decision.allowed);
        assert_eq!(eval.decision.remaining, 5);
    }

    #[test]
    fn test_deny_returns_pruned_sequence() {
        let sequence = vec![at(0), at(30), at(40)];
        let eval = evaluate(&sequence, at(65), &policy(2, 60));
        assert!(!eval.decision.allowed);
        assert_eq!(eval.sequence, vec![at(30), at(40)]);
        assert_eq!(eval.decision.retry_after, Duration::from_secs(25));
    }

    #[test]
    fn test_usage_of_active_records() {
        let usage = Usage::of(&[at(5), at(9)]);
        assert_eq!(usage.count, 2);
        assert_eq!(usage.oldest, Some(at(5)));
        assert_eq!(usage.newest, Some(at(9)));
        assert_eq!(Usage::of(&[]), Usage::default());
    }
}
