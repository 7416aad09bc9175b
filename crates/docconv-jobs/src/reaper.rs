//! Periodic maintenance: expired-lease reclaim and retention cleanup.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docconv_core::state::to_chrono;
use docconv_core::{defaults, InputCleanup, JobState, JobStore, Result};

use crate::results::ResultStore;
use crate::worker::WorkerEvent;

/// Returns `active` jobs whose worker stopped heartbeating to the queue.
pub struct LeaseReaper {
    store: Arc<dyn JobStore>,
    input_cleanup: Arc<dyn InputCleanup>,
    event_tx: broadcast::Sender<WorkerEvent>,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(
        store: Arc<dyn JobStore>,
        input_cleanup: Arc<dyn InputCleanup>,
        event_tx: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            store,
            input_cleanup,
            event_tx,
            interval: Duration::from_secs(defaults::JOB_REAPER_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One reclaim pass. Returns how many jobs were reclaimed.
    ///
    /// Jobs with a pending cancel request are finalized as `cancelled` and
    /// their input is released; the rest go back to `waiting`.
    pub async fn sweep(&self) -> Result<usize> {
        let reclaimed = self.store.reclaim_expired(Utc::now()).await?;
        if reclaimed.is_empty() {
            return Ok(0);
        }

        for job in reclaimed.iter().filter(|j| j.state.is_terminal()) {
            self.input_cleanup.release(job).await;
            let event = match job.state {
                JobState::Failed => {
                    warn!(
                        subsystem = "jobs",
                        component = "reaper",
                        job_id = %job.id,
                        lease_reclaims = job.lease_reclaims,
                        "Job failed after repeated lease expiry"
                    );
                    WorkerEvent::JobFailed {
                        job_id: job.id,
                        job_type: job.job_type,
                        attempts: job.attempts_made,
                        error: job.failure_reason.clone().unwrap_or_default(),
                    }
                }
                _ => WorkerEvent::JobCancelled {
                    job_id: job.id,
                    job_type: job.job_type,
                },
            };
            let _ = self.event_tx.send(event);
        }

        info!(
            subsystem = "jobs",
            component = "reaper",
            count = reclaimed.len(),
            "Reclaimed jobs with expired leases"
        );
        let _ = self.event_tx.send(WorkerEvent::JobsReclaimed {
            job_ids: reclaimed.iter().map(|j| j.id).collect(),
        });
        Ok(reclaimed.len())
    }

    /// Sweep every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(
                            subsystem = "jobs",
                            component = "reaper",
                            error = %e,
                            "Lease reclaim failed"
                        );
                    }
                }
            }
        }
        debug!(subsystem = "jobs", component = "reaper", "Lease reaper stopped");
    }
}

/// Deletes terminal job records, and their stored outputs, past a retention window.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    results: ResultStore,
    retention: Duration,
    period: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, results: ResultStore, retention: Duration) -> Self {
        Self {
            store,
            results,
            retention,
            period: Duration::from_secs(3600),
        }
    }

    /// Read `JOB_RETENTION_HOURS`; `None` when retention is disabled.
    pub fn retention_from_env() -> Option<Duration> {
        std::env::var("JOB_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|h| *h > 0)
            .map(|h| Duration::from_secs(h * 3600))
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// One cleanup pass. Returns (records removed, files removed).
    pub async fn sweep(&self) -> Result<(u64, u64)> {
        let cutoff = Utc::now() - to_chrono(self.retention);
        let records = self.store.cleanup(cutoff).await?;
        let files = self
            .results
            .prune(SystemTime::now() - self.retention, self.store.as_ref())
            .await?;
        if records > 0 || files > 0 {
            info!(
                subsystem = "jobs",
                component = "retention",
                records,
                files,
                retention_hours = self.retention.as_secs() / 3600,
                "Removed expired jobs"
            );
        }
        Ok((records, files))
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(
                            subsystem = "jobs",
                            component = "retention",
                            error = %e,
                            "Retention cleanup failed"
                        );
                    }
                }
            }
        }
    }
}
