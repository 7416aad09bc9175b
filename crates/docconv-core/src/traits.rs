//! Core traits for queue storage and conversion collaborators.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    ConversionOutput, Job, JobPage, JobType, JobUpdate, NewJob, PageMode, QueueStats, StateFilter,
};

// =============================================================================
// QUEUE STORE
// =============================================================================

/// Durable, shared storage of job records.
///
/// Implementations must make `claim_next` atomic: concurrent callers never
/// receive the same job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `waiting` job.
    ///
    /// Fails with `Conflict` when a non-terminal job already owns the same
    /// input path.
    async fn create(&self, new_job: NewJob) -> Result<Job>;

    /// Claim the oldest eligible job (`waiting`, or `delayed` and due).
    async fn claim_next(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<Job>>;

    /// Get a job by ID. Fails with `NotFound` if absent.
    async fn get(&self, job_id: Uuid) -> Result<Job>;

    /// Apply a state/progress/result mutation atomically.
    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<Job>;

    /// Delete a job record. Fails with `NotFound` if absent.
    async fn remove(&self, job_id: Uuid) -> Result<()>;

    /// Delete a job only while it is still `waiting` or `delayed`.
    ///
    /// Returns the job as it was when removed. Fails with `InvalidState` if
    /// the job has been claimed or finished in the meantime.
    async fn remove_if_pending(&self, job_id: Uuid) -> Result<Job>;

    /// List jobs oldest-first within each state.
    async fn list(
        &self,
        filter: StateFilter,
        offset: i64,
        limit: i64,
        mode: PageMode,
    ) -> Result<JobPage>;

    /// Return every `active` job whose lease expired before `now` to the queue.
    ///
    /// Returns the affected jobs after the transition.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Job counts per state.
    async fn stats(&self) -> Result<QueueStats>;

    /// Remove terminal jobs finished before `older_than`. Returns rows removed.
    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Handle notified whenever a job becomes claimable.
    fn job_notify(&self) -> Arc<Notify>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<()>;
}

// =============================================================================
// CONVERTERS
// =============================================================================

/// External collaborator performing one conversion type.
#[async_trait]
pub trait Converter: Send + Sync {
    /// The conversion type this converter handles.
    fn job_type(&self) -> JobType;

    /// Human-readable name of this converter.
    fn name(&self) -> &str;

    /// Reject unusable options at enqueue time.
    fn validate_options(&self, _options: &JsonMap<String, JsonValue>) -> Result<()> {
        Ok(())
    }

    /// Whether dropping an in-flight `convert` future aborts the conversion.
    fn interruptible(&self) -> bool {
        true
    }

    /// Convert the file at `input`.
    async fn convert(
        &self,
        input: &Path,
        options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput>;
}

// =============================================================================
// INPUT OWNERSHIP
// =============================================================================

/// Receives ownership of a job's input once the job has finished.
#[async_trait]
pub trait InputCleanup: Send + Sync {
    async fn release(&self, job: &Job);
}
