//! Caller-facing job operations.
//!
//! `JobService` is the only thing the HTTP layer talks to. It validates
//! requests against the dispatcher before anything reaches the store, and
//! maps every store or transport failure to `Error::Unavailable` so callers
//! can tell an outage apart from a business failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use docconv_core::{
    defaults, Error, InputCleanup, Job, JobPage, JobPayload, JobState, JobStore, JobType,
    JobUpdate, NewJob, PageMode, QueueStats, Result, StateFilter,
};

use crate::cancel::CancelRegistry;
use crate::cleanup::RetainInput;
use crate::dispatcher::Dispatcher;
use crate::results::{Download, ResultStore};

/// How often `cancel` re-reads an active job while waiting for the worker.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Per-request enqueue settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Attempt ceiling; the service default applies when `None`.
    pub max_attempts: Option<i32>,
}

/// Public view of a job returned by `status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub state: JobState,
    pub progress: i32,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub cancel_requested: bool,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let completed = job.state == JobState::Completed;
        let failed = job.state == JobState::Failed;
        Self {
            job_id: job.id,
            job_type: job.job_type,
            state: job.state,
            progress: job.progress,
            attempts_made: job.attempts_made,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            processed_at: job.processed_at,
            finished_at: job.finished_at,
            run_at: job.run_at.filter(|_| job.state == JobState::Delayed),
            result: job.result.clone().filter(|_| completed),
            failure_reason: job.failure_reason.clone().filter(|_| failed),
            last_error: job.last_error.clone(),
            cancel_requested: job.cancel_requested,
        }
    }
}

/// Result of a successful `cancel` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started; its record was deleted.
    Removed,
    /// The running attempt was interrupted and the job is now `cancelled`.
    Cancelled,
    /// Cancellation was requested but the worker has not acknowledged it yet.
    Pending,
}

impl CancelOutcome {
    pub fn message(&self) -> &'static str {
        match self {
            CancelOutcome::Removed => "Job removed from the queue",
            CancelOutcome::Cancelled => "Job cancelled",
            CancelOutcome::Pending => "Cancellation requested; the job is still stopping",
        }
    }
}

/// Map store failures to `Unavailable`, leaving business errors as they are.
fn store_error(e: Error) -> Error {
    if e.is_infrastructure() {
        Error::Unavailable(format!("job queue is unreachable: {}", e))
    } else {
        e
    }
}

/// Enqueue, inspect and cancel conversion jobs.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    results: ResultStore,
    cancellations: CancelRegistry,
    input_cleanup: Arc<dyn InputCleanup>,
    cancel_grace: Duration,
    default_max_attempts: i32,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            results: ResultStore::new(defaults::RESULTS_DIR),
            cancellations: CancelRegistry::new(),
            input_cleanup: Arc::new(RetainInput),
            cancel_grace: Duration::from_millis(defaults::JOB_CANCEL_GRACE_MS),
            default_max_attempts: defaults::JOB_MAX_ATTEMPTS,
        }
    }

    pub fn with_results(mut self, results: ResultStore) -> Self {
        self.results = results;
        self
    }

    /// Share cancellation tokens with the worker pool in the same process.
    pub fn with_cancellations(mut self, cancellations: CancelRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn with_input_cleanup(mut self, cleanup: Arc<dyn InputCleanup>) -> Self {
        self.input_cleanup = cleanup;
        self
    }

    /// How long `cancel` waits for a running job to stop.
    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_default_max_attempts(mut self, max_attempts: i32) -> Self {
        self.default_max_attempts = max_attempts.max(1);
        self
    }

    /// Apply `JOB_CANCEL_GRACE_MS` and `JOB_MAX_ATTEMPTS` from the environment.
    pub fn configured_from_env(self) -> Self {
        let grace = std::env::var("JOB_CANCEL_GRACE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(self.cancel_grace);
        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(self.default_max_attempts);
        self.with_cancel_grace(grace)
            .with_default_max_attempts(max_attempts)
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Validate and persist a new job. Returns its id.
    ///
    /// Unroutable types and rejected options fail here and never reach the
    /// store.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        payload: JobPayload,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        if payload.input.as_os_str().is_empty() {
            return Err(Error::Validation("input must not be empty".into()));
        }
        let max_attempts = options.max_attempts.unwrap_or(self.default_max_attempts);
        if max_attempts < 1 {
            return Err(Error::Validation(format!(
                "max_attempts must be at least 1, got {}",
                max_attempts
            )));
        }
        self.dispatcher.validate(job_type, &payload.options)?;

        let job = self
            .store
            .create(NewJob::new(job_type, payload).with_max_attempts(max_attempts))
            .await
            .map_err(store_error)?;

        info!(
            subsystem = "jobs",
            component = "service",
            op = "enqueue",
            job_id = %job.id,
            job_type = %job_type,
            max_attempts,
            "Job queued"
        );
        Ok(job.id)
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let job = self.store.get(job_id).await.map_err(store_error)?;
        Ok(JobStatusView::from(&job))
    }

    /// Read the stored output of a completed job.
    pub async fn download(&self, job_id: Uuid) -> Result<Download> {
        let job = self.store.get(job_id).await.map_err(store_error)?;
        self.results.load(&job).await
    }

    /// Cancel a job.
    ///
    /// `waiting` and `delayed` jobs are deleted outright. For an `active` job
    /// the cancel flag is set, the in-process signal fired, and the call waits
    /// up to the grace period for the worker to settle the race: `cancelled`
    /// succeeds, `completed` or `failed` is rejected with `InvalidState`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome> {
        // A pending job can be claimed between the read and the delete; the
        // second pass then sees it active.
        for _ in 0..2 {
            let job = self.store.get(job_id).await.map_err(store_error)?;
            match job.state {
                JobState::Waiting | JobState::Delayed => {
                    match self.store.remove_if_pending(job_id).await {
                        Ok(removed) => return Ok(self.finish_removal(&removed).await),
                        Err(Error::InvalidState(_)) => continue,
                        Err(e) => return Err(store_error(e)),
                    }
                }
                JobState::Active => return self.cancel_active(job_id).await,
                state => {
                    return Err(Error::InvalidState(format!(
                        "job {} is already {}",
                        job_id, state
                    )))
                }
            }
        }
        Err(Error::Conflict(format!(
            "job {} changed state while cancelling",
            job_id
        )))
    }

    async fn finish_removal(&self, job: &Job) -> CancelOutcome {
        self.input_cleanup.release(job).await;
        info!(
            subsystem = "jobs",
            component = "service",
            op = "cancel",
            job_id = %job.id,
            state = %job.state,
            "Removed pending job"
        );
        CancelOutcome::Removed
    }

    async fn cancel_active(&self, job_id: Uuid) -> Result<CancelOutcome> {
        match self.store.update(job_id, JobUpdate::RequestCancel).await {
            Ok(_) => {}
            // finished or retried since the read; the poll below resolves it
            Err(Error::InvalidState(msg)) => {
                debug!(subsystem = "jobs", component = "service", job_id = %job_id, reason = %msg, "Cancel flag not set")
            }
            Err(e) => return Err(store_error(e)),
        }
        let signalled = self.cancellations.fire(job_id).await;
        debug!(
            subsystem = "jobs",
            component = "service",
            op = "cancel",
            job_id = %job_id,
            local = signalled,
            "Cancellation requested"
        );

        let deadline = Instant::now() + self.cancel_grace;
        loop {
            let job = self.store.get(job_id).await.map_err(store_error)?;
            match job.state {
                JobState::Cancelled => {
                    info!(subsystem = "jobs", component = "service", op = "cancel", job_id = %job_id, "Job cancelled");
                    return Ok(CancelOutcome::Cancelled);
                }
                JobState::Completed | JobState::Failed => {
                    return Err(Error::InvalidState(format!(
                        "job {} finished as {} before it could be cancelled",
                        job_id, job.state
                    )));
                }
                JobState::Waiting | JobState::Delayed => {
                    match self.store.remove_if_pending(job_id).await {
                        Ok(removed) => return Ok(self.finish_removal(&removed).await),
                        Err(Error::InvalidState(_)) => {}
                        Err(e) => return Err(store_error(e)),
                    }
                }
                JobState::Active => {}
            }

            if Instant::now() >= deadline {
                warn!(
                    subsystem = "jobs",
                    component = "service",
                    op = "cancel",
                    job_id = %job_id,
                    grace_ms = self.cancel_grace.as_millis() as u64,
                    "Job still running after cancel grace period"
                );
                return Ok(CancelOutcome::Pending);
            }
            sleep(CANCEL_POLL).await;
        }
    }

    /// List jobs. `limit` defaults to 20 and is capped at 500.
    pub async fn list(
        &self,
        filter: StateFilter,
        limit: Option<i64>,
        offset: Option<i64>,
        mode: PageMode,
    ) -> Result<JobPage> {
        let limit = limit.unwrap_or(defaults::PAGE_LIMIT);
        if limit < 1 {
            return Err(Error::Validation(format!(
                "limit must be at least 1, got {}",
                limit
            )));
        }
        let offset = offset.unwrap_or(defaults::PAGE_OFFSET);
        if offset < 0 {
            return Err(Error::Validation(format!(
                "offset must not be negative, got {}",
                offset
            )));
        }
        self.store
            .list(filter, offset, limit.min(defaults::PAGE_LIMIT_MAX), mode)
            .await
            .map_err(store_error)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await.map_err(store_error)
    }

    /// Fails with `Unavailable` when the store cannot be reached.
    pub async fn health(&self) -> Result<()> {
        self.store.ping().await.map_err(store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::from_new(
            Uuid::now_v7(),
            NewJob::new(JobType::HtmlToMarkdown, JobPayload::new("/in/page.html")),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_view_hides_stale_fields() {
        let mut job = job();
        job.state = JobState::Active;
        job.last_error = Some("pandoc exited with status 1".into());
        job.run_at = Some(Utc::now());

        let view = JobStatusView::from(&job);
        assert_eq!(view.run_at, None);
        assert_eq!(view.result, None);
        assert_eq!(view.last_error.as_deref(), Some("pandoc exited with status 1"));

        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "html-to-markdown");
        assert_eq!(json["state"], "active");
        assert!(json.get("result").is_none());
        assert!(json.get("failure_reason").is_none());
    }

    #[test]
    fn test_status_view_failed_job() {
        let mut job = job();
        job.state = JobState::Failed;
        job.attempts_made = 3;
        job.failure_reason = Some("bad input".into());

        let json = serde_json::to_value(JobStatusView::from(&job)).unwrap();
        assert_eq!(json["failure_reason"], "bad input");
        assert_eq!(json["attempts_made"], 3);
    }

    #[test]
    fn test_store_error_mapping() {
        assert!(matches!(
            store_error(Error::Unavailable("connection refused".into())),
            Error::Unavailable(msg) if msg.contains("connection refused")
        ));
        assert!(matches!(
            store_error(Error::NotFound(Uuid::nil())),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_cancel_outcome_messages() {
        assert_eq!(CancelOutcome::Removed.message(), "Job removed from the queue");
        assert!(CancelOutcome::Pending.message().contains("still stopping"));
    }
}
