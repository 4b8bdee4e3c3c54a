//! Aggregate statistics over run history.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

use crate::core::{JobRun, RunState};

/// Counts and timings derived from a set of history records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySummary {
    /// Records inspected.
    pub total: usize,
    /// Succeeded runs.
    pub succeeded: usize,
    /// Failed runs followed by another attempt.
    pub retried: usize,
    /// Failed runs with no further attempt.
    pub failed: usize,
    /// Runs abandoned at shutdown.
    pub abandoned: usize,
    /// `succeeded / (succeeded + failed)`, or `None` with no finished invocations.
    pub success_rate: Option<f64>,
    /// Mean execution time of runs that started and finished, in milliseconds.
    pub average_duration_ms: Option<f64>,
}

impl HistorySummary {
    /// Summarise `runs`; typically the output of a history cursor.
    pub fn from_runs<I>(runs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Borrow<JobRun>,
    {
        let mut summary = Self::default();
        let mut timed = 0u32;
        let mut total_ms = 0f64;

        for run in runs {
            let run = run.borrow();
            summary.total += 1;
            match run.state {
                RunState::Succeeded => summary.succeeded += 1,
                RunState::Failed if run.next_retry_at.is_some() => summary.retried += 1,
                RunState::Failed => summary.failed += 1,
                RunState::Abandoned => summary.abandoned += 1,
                RunState::Pending | RunState::Running => {}
            }
            if let Some(duration) = run.duration() {
                timed += 1;
                #[allow(clippy::cast_precision_loss)]
                {
                    total_ms += duration.num_milliseconds() as f64;
                }
            }
        }

        let finished = summary.succeeded + summary.failed;
        if finished > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                summary.success_rate = Some(summary.succeeded as f64 / finished as f64);
            }
        }
        if timed > 0 {
            summary.average_duration_ms = Some(total_ms / f64::from(timed));
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ActionError, RunError};
    use crate::util::serde::InvocationId;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::milliseconds(ms)
    }

    #[test]
    fn test_summary_counts_and_rates() {
        let inv = InvocationId::new();
        let mut interim = JobRun::pending(1, inv, "job", 1, t(0), t(0));
        interim.mark_running(t(0));
        interim.fail(t(100), RunError::from(&ActionError::transient("x")), Some(t(1000)));

        let mut ok = JobRun::pending(2, inv, "job", 2, t(0), t(1000));
        ok.mark_running(t(1000));
        ok.succeed(t(1300), None);

        let mut gave_up = JobRun::pending(3, InvocationId::new(), "job", 1, t(2000), t(2000));
        gave_up.fail(t(2000), RunError::from(&ActionError::permanent("x")), None);

        let summary = HistorySummary::from_runs([&interim, &ok, &gave_up]);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.retried, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.success_rate, Some(0.5));
        // gave_up never started; the other two took 100ms and 300ms
        assert_eq!(summary.average_duration_ms, Some(200.0));
    }

    #[test]
    fn test_empty_summary() {
        let summary = HistorySummary::from_runs(Vec::<JobRun>::new());
        assert_eq!(summary, HistorySummary::default());
        assert!(summary.success_rate.is_none());
    }
}
