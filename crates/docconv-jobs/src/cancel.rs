//! In-process cancellation signals for running jobs.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Cancellation tokens of the jobs currently executing in this process.
///
/// Shared between the worker pool, which registers a token per claimed job,
/// and the job service, which fires it on cancel. Workers in other processes
/// learn about a cancel request from the `cancel_requested` flag on their
/// next heartbeat.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and track a fresh token for `job_id`.
    pub async fn register(&self, job_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.lock().await.insert(job_id, token.clone());
        token
    }

    /// Fire the token for `job_id`. Returns false when the job is not running here.
    pub async fn fire(&self, job_id: Uuid) -> bool {
        match self.tokens.lock().await.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn release(&self, job_id: Uuid) {
        self.tokens.lock().await.remove(&job_id);
    }

    pub async fn len(&self) -> usize {
        self.tokens.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
