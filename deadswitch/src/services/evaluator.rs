//! Trigger evaluator
//!
//! Pure timing logic deciding whether a switch has outlived its allowed
//! silence. Persisting the transition is the orchestrator's job.

use crate::database::{Switch, SwitchStatus};
use chrono::{DateTime, Duration, Utc};

/// Outcome of evaluating one switch at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// `now - last_seen >= trigger_duration`
    pub expired: bool,
    pub trigger_at: DateTime<Utc>,
    /// How far past `trigger_at` we are, never negative
    pub overdue_by: Duration,
}

impl Evaluation {
    /// Time left before the switch expires, never negative
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.trigger_at - now).max(Duration::zero())
    }
}

/// Evaluate raw timing inputs
pub fn evaluate(
    last_seen: DateTime<Utc>,
    trigger_duration_minutes: i64,
    now: DateTime<Utc>,
) -> Evaluation {
    let trigger_at = last_seen + Duration::minutes(trigger_duration_minutes);
    let elapsed = now - last_seen;

    Evaluation {
        expired: elapsed >= Duration::minutes(trigger_duration_minutes),
        trigger_at,
        overdue_by: (now - trigger_at).max(Duration::zero()),
    }
}

/// Evaluate a stored switch. Triggered and deleted switches are terminal and
/// yield `None`.
pub fn evaluate_switch(switch: &Switch, now: DateTime<Utc>) -> Option<Evaluation> {
    if switch.status == SwitchStatus::Triggered || switch.is_deleted() {
        return None;
    }
    Some(evaluate(switch.last_seen, switch.trigger_duration_minutes, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DeliveryState, Lifecycle};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap()
    }

    fn switch(status: SwitchStatus, lifecycle: Lifecycle) -> Switch {
        Switch {
            id: "s".to_string(),
            content: String::new(),
            key_fragment: String::new(),
            management_token_hash: String::new(),
            recipient_email: "r@example.com".to_string(),
            trigger_duration_minutes: 60,
            last_seen: t0(),
            version: 0,
            status,
            triggered_at: None,
            lifecycle,
            deleted_at: None,
            delivery: DeliveryState::None,
            email_delivered: false,
            webhook_delivered: false,
            delivery_attempts: 0,
            delivery_lease_until: 0,
            delivered_at: None,
            last_error: None,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[test]
    fn test_not_expired_before_duration() {
        let eval = evaluate(t0(), 60, t0() + Duration::minutes(59));
        assert!(!eval.expired);
        assert_eq!(eval.overdue_by, Duration::zero());
        assert_eq!(eval.remaining(t0() + Duration::minutes(59)), Duration::minutes(1));
    }

    #[test]
    fn test_expired_exactly_at_duration() {
        let eval = evaluate(t0(), 60, t0() + Duration::minutes(60));
        assert!(eval.expired);
        assert_eq!(eval.trigger_at, t0() + Duration::minutes(60));
        assert_eq!(eval.overdue_by, Duration::zero());
    }

    #[test]
    fn test_one_second_short_is_active() {
        let eval = evaluate(t0(), 60, t0() + Duration::minutes(60) - Duration::seconds(1));
        assert!(!eval.expired);
    }

    #[test]
    fn test_overdue_is_measured() {
        let now = t0() + Duration::minutes(75);
        let eval = evaluate(t0(), 60, now);
        assert!(eval.expired);
        assert_eq!(eval.overdue_by, Duration::minutes(15));
        assert_eq!(eval.remaining(now), Duration::zero());
    }

    #[test]
    fn test_clock_before_last_seen() {
        let eval = evaluate(t0(), 60, t0() - Duration::minutes(5));
        assert!(!eval.expired);
        assert_eq!(eval.overdue_by, Duration::zero());
    }

    #[test]
    fn test_triggered_switch_is_terminal() {
        let now = t0() + Duration::days(3);
        assert!(evaluate_switch(&switch(SwitchStatus::Triggered, Lifecycle::Active), now).is_none());
        assert!(evaluate_switch(&switch(SwitchStatus::Active, Lifecycle::Deleted), now).is_none());
        assert!(evaluate_switch(&switch(SwitchStatus::Active, Lifecycle::Active), now)
            .unwrap()
            .expired);
    }
}
