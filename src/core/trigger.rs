//! Trigger specifications and the schedule evaluator.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::cron::CronSchedule;
use crate::core::SchedulerError;
use crate::util::serde::duration_ms;

/// Cap on evaluator steps when skipping missed fires of calendar triggers.
const MAX_SKIP_STEPS: u32 = 100_000;

/// When a job becomes due.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire every `every`, measured from the previous *scheduled* fire time.
    Interval {
        /// Period between fires.
        #[serde(with = "duration_ms", rename = "every_ms")]
        every: Duration,
    },
    /// Fire whenever the cron expression matches.
    Cron {
        /// Parsed expression.
        expression: CronSchedule,
    },
    /// Fire exactly once.
    Once {
        /// Fire time.
        at: DateTime<Utc>,
    },
}

impl Trigger {
    /// Fixed-period trigger.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` for a zero interval.
    pub fn interval(every: Duration) -> Result<Self, SchedulerError> {
        let trigger = Self::Interval { every };
        trigger.validate()?;
        Ok(trigger)
    }

    /// Cron trigger; see [`crate::core::cron`] for the accepted syntax.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` for an invalid expression.
    pub fn cron(expression: &str) -> Result<Self, SchedulerError> {
        Ok(Self::Cron {
            expression: CronSchedule::parse(expression)?,
        })
    }

    /// One-shot trigger.
    pub const fn once(at: DateTime<Utc>) -> Self {
        Self::Once { at }
    }

    /// Check invariants that cannot be enforced by construction (for example
    /// after deserialization).
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` describing the problem.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match self {
            Self::Interval { every } if every.is_zero() => Err(SchedulerError::Configuration(
                "interval trigger must be greater than zero".into(),
            )),
            Self::Interval { every } if chrono::Duration::from_std(*every).is_err() => {
                Err(SchedulerError::Configuration(format!(
                    "interval {every:?} is too large"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Next fire time strictly after `after`; see [`next_fire_time`].
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_fire_time(self, after)
    }

    /// First fire time for a job registered at `registered_at`.
    ///
    /// One-shot triggers keep their time even when it is already in the
    /// past, so a late registration still fires once.
    pub fn first_fire(&self, registered_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Once { at } => Some(*at),
            _ => next_fire_time(self, registered_at),
        }
    }

    /// Latest scheduled fire time that is `<= now`, walking forward from
    /// `scheduled` (which must itself be `<= now`). Returns that time and the
    /// number of fires skipped to reach it.
    pub fn latest_due(
        &self,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (DateTime<Utc>, u64) {
        if scheduled >= now {
            return (scheduled, 0);
        }
        match self {
            Self::Interval { every } => {
                let Ok(step) = chrono::Duration::from_std(*every) else {
                    return (scheduled, 0);
                };
                let (Some(lag), Some(step_ns)) =
                    ((now - scheduled).num_nanoseconds(), step.num_nanoseconds())
                else {
                    return (scheduled, 0);
                };
                if step_ns <= 0 {
                    return (scheduled, 0);
                }
                let skipped = lag / step_ns;
                let target = i32::try_from(skipped)
                    .ok()
                    .and_then(|n| step.checked_mul(n))
                    .and_then(|offset| scheduled.checked_add_signed(offset))
                    .unwrap_or(scheduled);
                (target, u64::try_from(skipped).unwrap_or(0))
            }
            Self::Cron { .. } | Self::Once { .. } => {
                let mut current = scheduled;
                let mut skipped = 0u64;
                for _ in 0..MAX_SKIP_STEPS {
                    match next_fire_time(self, current) {
                        Some(next) if next <= now => {
                            current = next;
                            skipped += 1;
                        }
                        _ => break,
                    }
                }
                (current, skipped)
            }
        }
    }
}

/// Compute the smallest fire time strictly after `after`, or `None` when the
/// trigger will never fire again.
///
/// Pure: the same inputs always produce the same output. Interval triggers add
/// the period to `after` directly, so callers pass the previous *scheduled*
/// fire time to avoid accumulating lag.
pub fn next_fire_time(trigger: &Trigger, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match trigger {
        Trigger::Interval { every } => {
            let step = chrono::Duration::from_std(*every).ok()?;
            if step <= chrono::Duration::zero() {
                return None;
            }
            after.checked_add_signed(step)
        }
        Trigger::Cron { expression } => expression.next_after(after),
        Trigger::Once { at } => (*at > after).then_some(*at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_interval_adds_period() {
        let trigger = Trigger::interval(Duration::from_secs(30)).unwrap();
        assert_eq!(trigger.next_after(t0()), Some(t0() + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = Trigger::interval(Duration::ZERO).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
    }

    #[test]
    fn test_invalid_cron_rejected() {
        assert!(Trigger::cron("not a cron").is_err());
        assert!(Trigger::cron("0 0 * * *").is_ok());
    }

    #[test]
    fn test_once_fires_only_before_reference() {
        let at = t0() + chrono::Duration::minutes(5);
        let trigger = Trigger::once(at);
        assert_eq!(trigger.next_after(t0()), Some(at));
        assert_eq!(trigger.next_after(at), None);
        assert_eq!(trigger.next_after(at + chrono::Duration::seconds(1)), None);
    }

    #[test]
    fn test_first_fire() {
        let past = t0() - chrono::Duration::hours(1);
        assert_eq!(Trigger::once(past).first_fire(t0()), Some(past));

        let interval = Trigger::interval(Duration::from_secs(10)).unwrap();
        assert_eq!(interval.first_fire(t0()), Some(t0() + chrono::Duration::seconds(10)));

        let cron = Trigger::cron("0 0 * * *").unwrap();
        assert_eq!(
            cron.first_fire(t0()),
            Some(Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_latest_due_interval() {
        let trigger = Trigger::interval(Duration::from_secs(10)).unwrap();
        let now = t0() + chrono::Duration::seconds(95);
        let (latest, skipped) = trigger.latest_due(t0(), now);
        assert_eq!(latest, t0() + chrono::Duration::seconds(90));
        assert_eq!(skipped, 9);
    }

    #[test]
    fn test_latest_due_cron() {
        let trigger = Trigger::cron("0 * * * *").unwrap();
        let now = t0() + chrono::Duration::minutes(200);
        let (latest, skipped) = trigger.latest_due(t0(), now);
        assert_eq!(latest, Utc.with_ymd_and_hms(2024, 5, 1, 15, 0, 0).unwrap());
        assert_eq!(skipped, 3);
    }

    #[test]
    fn test_latest_due_not_behind() {
        let trigger = Trigger::interval(Duration::from_secs(10)).unwrap();
        assert_eq!(trigger.latest_due(t0(), t0()), (t0(), 0));
    }

    #[test]
    fn test_trigger_serde() {
        let trigger = Trigger::interval(Duration::from_millis(1500)).unwrap();
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json, serde_json::json!({"type": "interval", "every_ms": 1500}));

        let cron: Trigger =
            serde_json::from_value(serde_json::json!({"type": "cron", "expression": "@hourly"}))
                .unwrap();
        assert!(matches!(cron, Trigger::Cron { .. }));
    }

    proptest! {
        // Chaining the evaluator from scheduled times never drifts.
        #[test]
        fn interval_chain_has_no_drift(period_ms in 1u64..86_400_000, steps in 1usize..50) {
            let trigger = Trigger::interval(Duration::from_millis(period_ms)).unwrap();
            let mut scheduled = t0();
            for _ in 0..steps {
                let next = trigger.next_after(scheduled).unwrap();
                prop_assert_eq!((next - scheduled).num_milliseconds() as u64, period_ms);
                scheduled = next;
            }
        }

        // Cron results are strictly later than the reference and match the expression.
        #[test]
        fn cron_next_is_strictly_later_and_matches(
            offset_secs in 0i64..(400 * 86_400),
            minute in 0u32..60,
            hour in 0u32..24,
        ) {
            let expr = format!("{minute} {hour} * * *");
            let schedule = CronSchedule::parse(&expr).unwrap();
            let after = t0() + chrono::Duration::seconds(offset_secs);
            let next = schedule.next_after(after).unwrap();
            prop_assert!(next > after);
            prop_assert!(schedule.matches(next));
            prop_assert!((next - after) <= chrono::Duration::days(1));
        }
    }
}
