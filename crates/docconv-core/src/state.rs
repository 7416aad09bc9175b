//! Job state machine.
//!
//! Every queue store applies claims, updates and lease reclaims through these
//! functions so the transition rules live in one place. Callers hold whatever
//! lock or row lock makes the read-modify-write atomic.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{Job, JobState, JobUpdate};

/// Convert a std duration for timestamp arithmetic, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn transition(job: &mut Job, next: JobState) -> Result<()> {
    if !job.state.can_transition_to(next) {
        return Err(Error::InvalidState(format!(
            "job {} cannot move from {} to {}",
            job.id, job.state, next
        )));
    }
    job.state = next;
    Ok(())
}

fn clear_lease(job: &mut Job) {
    job.lease_owner = None;
    job.lease_expires_at = None;
}

fn require_claim(job: &Job, worker_id: &str) -> Result<()> {
    if job.state.is_terminal() {
        return Err(Error::Conflict(format!(
            "job {} is already {}",
            job.id, job.state
        )));
    }
    if job.state != JobState::Active || job.lease_owner.as_deref() != Some(worker_id) {
        return Err(Error::Conflict(format!(
            "worker {} does not hold the claim on job {}",
            worker_id, job.id
        )));
    }
    Ok(())
}

/// Transition an eligible job to `active` under `worker_id`.
pub fn claim(job: &mut Job, worker_id: &str, lease_ttl: Duration, now: DateTime<Utc>) -> Result<()> {
    if !job.is_claimable(now) {
        return Err(Error::Conflict(format!("job {} is not claimable", job.id)));
    }
    transition(job, JobState::Active)?;
    job.processed_at.get_or_insert(now);
    job.lease_owner = Some(worker_id.to_string());
    job.lease_expires_at = Some(now + to_chrono(lease_ttl));
    job.run_at = None;
    job.progress = 0;
    Ok(())
}

/// Apply a mutation, enforcing claim ownership and terminal immutability.
pub fn apply_update(job: &mut Job, update: &JobUpdate, now: DateTime<Utc>) -> Result<()> {
    match update {
        JobUpdate::Progress { worker_id, percent } => {
            require_claim(job, worker_id)?;
            job.progress = (*percent).clamp(0, 100);
        }
        JobUpdate::Heartbeat {
            worker_id,
            lease_ttl,
        } => {
            require_claim(job, worker_id)?;
            job.lease_expires_at = Some(now + to_chrono(*lease_ttl));
        }
        JobUpdate::Complete { worker_id, result } => {
            require_claim(job, worker_id)?;
            transition(job, JobState::Completed)?;
            job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
            job.result = Some(result.clone());
            job.failure_reason = None;
            job.progress = 100;
            job.finished_at = Some(now);
            clear_lease(job);
        }
        JobUpdate::Retry {
            worker_id,
            reason,
            delay,
        } => {
            require_claim(job, worker_id)?;
            job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
            if job.cancel_requested {
                // a requested cancel outranks another attempt
                transition(job, JobState::Cancelled)?;
                job.finished_at = Some(now);
            } else if job.attempts_made >= job.max_attempts {
                transition(job, JobState::Failed)?;
                job.failure_reason = Some(reason.clone());
                job.finished_at = Some(now);
            } else {
                transition(job, JobState::Delayed)?;
                job.run_at = Some(now + to_chrono(*delay));
                job.progress = 0;
            }
            job.last_error = Some(reason.clone());
            clear_lease(job);
        }
        JobUpdate::Fail { worker_id, reason } => {
            require_claim(job, worker_id)?;
            transition(job, JobState::Failed)?;
            job.attempts_made = (job.attempts_made + 1).min(job.max_attempts);
            job.failure_reason = Some(reason.clone());
            job.last_error = Some(reason.clone());
            job.finished_at = Some(now);
            clear_lease(job);
        }
        JobUpdate::Cancelled { worker_id } => {
            require_claim(job, worker_id)?;
            transition(job, JobState::Cancelled)?;
            job.finished_at = Some(now);
            clear_lease(job);
        }
        JobUpdate::RequestCancel => match job.state {
            JobState::Active => job.cancel_requested = true,
            state if state.is_terminal() => {
                return Err(Error::InvalidState(format!(
                    "job {} is already {}",
                    job.id, state
                )))
            }
            state => {
                return Err(Error::InvalidState(format!(
                    "job {} is {}; remove it instead",
                    job.id, state
                )))
            }
        },
    }
    Ok(())
}

/// Return a stalled `active` job to the queue.
///
/// A job whose cancellation was already requested is finalized as
/// `cancelled` instead, and one reclaimed more than
/// [`defaults::JOB_MAX_RECLAIMS`] times is finalized as `failed`. The attempt
/// counter is left unchanged.
pub fn reclaim(job: &mut Job, now: DateTime<Utc>) -> Result<JobState> {
    if !job.lease_expired(now) {
        return Err(Error::Conflict(format!(
            "job {} still holds a live lease",
            job.id
        )));
    }
    job.lease_reclaims += 1;
    if job.cancel_requested {
        transition(job, JobState::Cancelled)?;
        job.finished_at = Some(now);
    } else if job.lease_reclaims > defaults::JOB_MAX_RECLAIMS {
        transition(job, JobState::Failed)?;
        let reason = format!(
            "worker lease expired {} times without an outcome",
            job.lease_reclaims
        );
        job.failure_reason = Some(reason.clone());
        job.last_error = Some(reason);
        job.finished_at = Some(now);
    } else {
        transition(job, JobState::Waiting)?;
        job.progress = 0;
    }
    clear_lease(job);
    Ok(job.state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobPayload, JobType, NewJob};
    use serde_json::json;
    use uuid::Uuid;

    const LEASE: Duration = Duration::from_secs(30);

    fn waiting_job(max_attempts: i32) -> Job {
        Job::from_new(
            Uuid::now_v7(),
            NewJob::new(JobType::ExcelToCsv, JobPayload::new("/tmp/book.xlsx"))
                .with_max_attempts(max_attempts),
            Utc::now(),
        )
    }

    fn claimed(max_attempts: i32) -> Job {
        let mut job = waiting_job(max_attempts);
        claim(&mut job, "w-1", LEASE, Utc::now()).unwrap();
        job
    }

    #[test]
    fn test_claim_stamps_processed_at_once() {
        let mut job = waiting_job(3);
        let first = Utc::now();
        claim(&mut job, "w-1", LEASE, first).unwrap();
        assert_eq!(job.state, JobState::Active);
        assert_eq!(job.processed_at, Some(first));
        assert_eq!(job.lease_owner.as_deref(), Some("w-1"));

        apply_update(
            &mut job,
            &JobUpdate::Retry {
                worker_id: "w-1".into(),
                reason: "boom".into(),
                delay: Duration::ZERO,
            },
            first,
        )
        .unwrap();
        let later = first + chrono::Duration::seconds(10);
        claim(&mut job, "w-2", LEASE, later).unwrap();
        assert_eq!(job.processed_at, Some(first));
        assert_eq!(job.lease_owner.as_deref(), Some("w-2"));
    }

    #[test]
    fn test_claim_rejects_active_job() {
        let mut job = claimed(3);
        assert!(matches!(
            claim(&mut job, "w-2", LEASE, Utc::now()),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn test_complete_sets_result_and_counts_attempt() {
        let mut job = claimed(3);
        let now = Utc::now();
        apply_update(
            &mut job,
            &JobUpdate::Complete {
                worker_id: "w-1".into(),
                result: json!({"path": "out.pdf"}),
            },
            now,
        )
        .unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.progress, 100);
        assert_eq!(job.finished_at, Some(now));
        assert!(job.result.is_some());
        assert!(job.failure_reason.is_none());
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn test_second_terminal_mutation_conflicts() {
        let mut job = claimed(3);
        let done = JobUpdate::Complete {
            worker_id: "w-1".into(),
            result: json!({}),
        };
        apply_update(&mut job, &done, Utc::now()).unwrap();
        let err = apply_update(&mut job, &done, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        let err = apply_update(
            &mut job,
            &JobUpdate::Fail {
                worker_id: "w-1".into(),
                reason: "late".into(),
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(job.failure_reason.is_none());
    }

    #[test]
    fn test_retry_delays_until_attempts_exhausted() {
        let mut job = claimed(2);
        let now = Utc::now();
        let retry = JobUpdate::Retry {
            worker_id: "w-1".into(),
            reason: "converter crashed".into(),
            delay: Duration::from_secs(2),
        };
        apply_update(&mut job, &retry, now).unwrap();
        assert_eq!(job.state, JobState::Delayed);
        assert_eq!(job.attempts_made, 1);
        assert_eq!(job.run_at, Some(now + chrono::Duration::seconds(2)));
        assert!(job.failure_reason.is_none());
        assert_eq!(job.last_error.as_deref(), Some("converter crashed"));

        claim(&mut job, "w-1", LEASE, now + chrono::Duration::seconds(2)).unwrap();
        apply_update(&mut job, &retry, now).unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failure_reason.as_deref(), Some("converter crashed"));
        assert!(job.result.is_none());
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut job = claimed(3);
        apply_update(
            &mut job,
            &JobUpdate::Fail {
                worker_id: "w-1".into(),
                reason: "bad options".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 1);
    }

    #[test]
    fn test_non_owner_cannot_mutate() {
        let mut job = claimed(3);
        let err = apply_update(
            &mut job,
            &JobUpdate::Progress {
                worker_id: "w-9".into(),
                percent: 50,
            },
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(job.progress, 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut job = claimed(3);
        apply_update(
            &mut job,
            &JobUpdate::Progress {
                worker_id: "w-1".into(),
                percent: 140,
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_heartbeat_extends_lease() {
        let mut job = claimed(3);
        let later = Utc::now() + chrono::Duration::seconds(20);
        apply_update(
            &mut job,
            &JobUpdate::Heartbeat {
                worker_id: "w-1".into(),
                lease_ttl: LEASE,
            },
            later,
        )
        .unwrap();
        assert_eq!(job.lease_expires_at, Some(later + chrono::Duration::seconds(30)));
    }

    #[test]
    fn test_request_cancel_only_flags_active_jobs() {
        let mut job = waiting_job(3);
        assert!(matches!(
            apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()),
            Err(Error::InvalidState(_))
        ));

        claim(&mut job, "w-1", LEASE, Utc::now()).unwrap();
        apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()).unwrap();
        assert!(job.cancel_requested);
        assert_eq!(job.state, JobState::Active);

        apply_update(
            &mut job,
            &JobUpdate::Cancelled {
                worker_id: "w-1".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert!(matches!(
            apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn test_reclaim_requires_expired_lease() {
        let mut job = claimed(3);
        let now = Utc::now();
        assert!(matches!(reclaim(&mut job, now), Err(Error::Conflict(_))));

        let expired = now + chrono::Duration::seconds(31);
        assert_eq!(reclaim(&mut job, expired).unwrap(), JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert!(job.lease_owner.is_none());
        assert!(job.processed_at.is_some());
    }

    #[test]
    fn test_reclaim_finalizes_cancel_requested_job() {
        let mut job = claimed(3);
        apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()).unwrap();
        let expired = Utc::now() + chrono::Duration::seconds(31);
        assert_eq!(reclaim(&mut job, expired).unwrap(), JobState::Cancelled);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_claim_keeps_cancel_request() {
        let mut job = claimed(3);
        apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()).unwrap();
        job.state = JobState::Waiting;
        job.lease_owner = None;

        claim(&mut job, "w-2", LEASE, Utc::now()).unwrap();
        assert!(job.cancel_requested);
    }

    #[test]
    fn test_retry_after_cancel_request_ends_cancelled() {
        let mut job = claimed(3);
        apply_update(&mut job, &JobUpdate::RequestCancel, Utc::now()).unwrap();

        let now = Utc::now();
        apply_update(
            &mut job,
            &JobUpdate::Retry {
                worker_id: "w-1".into(),
                reason: "soffice exited with 1".into(),
                delay: Duration::from_secs(2),
            },
            now,
        )
        .unwrap();
        assert_eq!(job.state, JobState::Cancelled);
        assert_eq!(job.finished_at, Some(now));
        assert!(job.run_at.is_none());
        assert!(job.lease_owner.is_none());
        assert!(!job.is_claimable(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_repeated_reclaims_fail_the_job() {
        let mut job = waiting_job(3);
        let mut now = Utc::now();
        for round in 1..=defaults::JOB_MAX_RECLAIMS {
            claim(&mut job, "w-crash", LEASE, now).unwrap();
            now += chrono::Duration::seconds(31);
            assert_eq!(reclaim(&mut job, now).unwrap(), JobState::Waiting, "round {}", round);
        }

        claim(&mut job, "w-crash", LEASE, now).unwrap();
        now += chrono::Duration::seconds(31);
        assert_eq!(reclaim(&mut job, now).unwrap(), JobState::Failed);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.lease_reclaims, defaults::JOB_MAX_RECLAIMS + 1);
        assert!(job.failure_reason.as_deref().unwrap().contains("lease expired"));
        assert_eq!(job.finished_at, Some(now));
    }
}
