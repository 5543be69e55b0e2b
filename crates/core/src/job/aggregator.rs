//! Derivation of job state from task counters.
//!
//! This is the only place that decides a job is `Finished`. Stores call it
//! inside the same transaction that changed the counters.

use super::{JobCounts, JobState};

/// Compute the job state that follows a counter change.
///
/// An `Active` job whose tasks are all terminal becomes `Finished`; a
/// `Finished` job that regained a non-terminal task becomes `Active` again.
/// Jobs without tasks never finish on their own.
pub fn next_job_state(current: JobState, counts: &JobCounts) -> JobState {
    let done = counts.done();
    match current {
        JobState::Active if counts.total > 0 && done == counts.total => JobState::Finished,
        JobState::Finished if done < counts.total => JobState::Active,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(total: i64, success: i64, failure: i64, skipped: i64) -> JobCounts {
        JobCounts {
            total,
            waiting: total - success - failure - skipped,
            success,
            failure,
            skipped,
            ..Default::default()
        }
    }

    #[test]
    fn test_active_finishes_when_all_terminal() {
        assert_eq!(
            next_job_state(JobState::Active, &counts(3, 1, 1, 1)),
            JobState::Finished
        );
        assert_eq!(
            next_job_state(JobState::Active, &counts(3, 2, 0, 0)),
            JobState::Active
        );
    }

    #[test]
    fn test_failures_still_finish() {
        assert_eq!(
            next_job_state(JobState::Active, &counts(2, 0, 2, 0)),
            JobState::Finished
        );
    }

    #[test]
    fn test_finished_reopens() {
        assert_eq!(
            next_job_state(JobState::Finished, &counts(2, 1, 0, 0)),
            JobState::Active
        );
        assert_eq!(
            next_job_state(JobState::Finished, &counts(2, 1, 1, 0)),
            JobState::Finished
        );
    }

    #[test]
    fn test_zero_tasks_never_finish() {
        assert_eq!(
            next_job_state(JobState::Active, &counts(0, 0, 0, 0)),
            JobState::Active
        );
    }

    #[test]
    fn test_waiting_and_cancelled_untouched() {
        assert_eq!(
            next_job_state(JobState::Waiting, &counts(1, 1, 0, 0)),
            JobState::Waiting
        );
        assert_eq!(
            next_job_state(JobState::Cancelled, &counts(2, 0, 0, 1)),
            JobState::Cancelled
        );
    }
}
