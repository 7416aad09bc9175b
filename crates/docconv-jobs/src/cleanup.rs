//! Input file handover once a job has finished.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use docconv_core::{InputCleanup, Job};

/// Deletes the input file.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeleteInput;

#[async_trait]
impl InputCleanup for DeleteInput {
    async fn release(&self, job: &Job) {
        match tokio::fs::remove_file(&job.payload.input).await {
            Ok(()) => debug!(
                subsystem = "jobs",
                component = "cleanup",
                job_id = %job.id,
                input = %job.payload.input.display(),
                "Removed job input"
            ),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                subsystem = "jobs",
                component = "cleanup",
                job_id = %job.id,
                input = %job.payload.input.display(),
                error = %e,
                "Failed to remove job input"
            ),
        }
    }
}

/// Leaves the input in place for the uploader to manage.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetainInput;

#[async_trait]
impl InputCleanup for RetainInput {
    async fn release(&self, _job: &Job) {}
}

/// Pick the cleanup policy from `DELETE_INPUTS` (default `false`).
pub fn input_cleanup_from_env() -> Arc<dyn InputCleanup> {
    let delete = std::env::var("DELETE_INPUTS")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    if delete {
        Arc::new(DeleteInput)
    } else {
        Arc::new(RetainInput)
    }
}
