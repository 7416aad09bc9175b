//! Worker pool executing claimed conversion jobs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use docconv_core::{defaults, Error, InputCleanup, Job, JobState, JobStore, JobType, JobUpdate, Result};

use crate::cancel::CancelRegistry;
use crate::cleanup::RetainInput;
use crate::dispatcher::Dispatcher;
use crate::reaper::LeaseReaper;
use crate::results::ResultStore;
use crate::retry::RetryPolicy;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds when the queue is empty.
    pub poll_interval_ms: u64,
    /// Number of worker loops, each running one job at a time.
    pub max_concurrent_jobs: usize,
    /// Whether to enable job processing.
    pub enabled: bool,
    /// Claim lease; heartbeats are sent every third of it.
    pub lease_ttl: Duration,
    /// How often the lease reaper scans for stalled claims.
    pub reaper_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            enabled: true,
            lease_ttl: Duration::from_secs(defaults::JOB_LEASE_SECS),
            reaper_interval: Duration::from_secs(defaults::JOB_REAPER_INTERVAL_SECS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Worker loops |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `JOB_LEASE_SECS` | `30` | Claim lease length |
    /// | `JOB_REAPER_INTERVAL_SECS` | `10` | Expired-lease scan period |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrent_jobs)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults.poll_interval_ms);

        let lease_ttl = std::env::var("JOB_LEASE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.lease_ttl);

        let reaper_interval = std::env::var("JOB_REAPER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.reaper_interval);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            enabled,
            lease_ttl,
            reaper_interval,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the number of worker loops.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(1))
    }
}

/// Event emitted by the worker pool after each job transition.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Pool started with this many worker loops.
    WorkerStarted { workers: usize },
    /// A job was claimed and is executing.
    JobStarted {
        job_id: Uuid,
        job_type: JobType,
        worker_id: String,
        attempt: i32,
    },
    /// Job progress was updated.
    JobProgress {
        job_id: Uuid,
        percent: i32,
        message: Option<String>,
    },
    /// A job completed successfully.
    JobCompleted {
        job_id: Uuid,
        job_type: JobType,
        attempts: i32,
        duration_ms: u64,
    },
    /// An attempt failed and the job was delayed for another try.
    JobRetrying {
        job_id: Uuid,
        job_type: JobType,
        attempt: i32,
        delay_ms: u64,
        error: String,
    },
    /// A job failed terminally.
    JobFailed {
        job_id: Uuid,
        job_type: JobType,
        attempts: i32,
        error: String,
    },
    /// A running job was cancelled.
    JobCancelled { job_id: Uuid, job_type: JobType },
    /// The reaper returned stalled claims to the queue.
    JobsReclaimed { job_ids: Vec<Uuid> },
    /// Pool stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker pool.
pub struct WorkerHandle {
    shutdown: CancellationToken,
    event_tx: broadcast::Sender<WorkerEvent>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Stop claiming, let in-flight jobs finish, and wait for the loops to exit.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor
                .await
                .map_err(|e| Error::Internal(format!("Worker pool task failed: {}", e)))?;
        }
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }
}

/// Outcome of running one attempt alongside its heartbeat.
enum Attempt {
    /// The converter finished; carries the result descriptor or the failure.
    Finished(Result<JsonValue>),
    /// The lease was lost to the reaper; the job now belongs to someone else.
    Lost(String),
}

/// Bounded pool of worker loops sharing one queue store.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    results: ResultStore,
    input_cleanup: Arc<dyn InputCleanup>,
    cancellations: CancelRegistry,
    retry: RetryPolicy,
    config: WorkerConfig,
    event_tx: broadcast::Sender<WorkerEvent>,
    instance: String,
}

impl WorkerPool {
    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Start the worker loops and the lease reaper.
    pub fn start(self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let event_tx = self.event_tx.clone();
        let pool = Arc::new(self);
        let supervisor = tokio::spawn(pool.supervise(shutdown.clone()));

        WorkerHandle {
            shutdown,
            event_tx,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    async fn supervise(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!(subsystem = "jobs", component = "worker", "Job worker is disabled, not starting");
            return;
        }

        let workers = self.config.max_concurrent_jobs.max(1);
        info!(
            subsystem = "jobs",
            component = "worker",
            instance = %self.instance,
            workers,
            poll_interval_ms = self.config.poll_interval_ms,
            lease_secs = self.config.lease_ttl.as_secs(),
            "Worker pool started"
        );
        let _ = self.event_tx.send(WorkerEvent::WorkerStarted { workers });

        let mut tasks = JoinSet::new();
        for slot in 0..workers {
            let worker_id = format!("{}-{}", self.instance, slot);
            tasks.spawn(self.clone().run_loop(worker_id, shutdown.clone()));
        }

        let reaper = LeaseReaper::new(
            self.store.clone(),
            self.input_cleanup.clone(),
            self.event_tx.clone(),
        )
        .with_interval(self.config.reaper_interval);
        tasks.spawn(reaper.run(shutdown.clone()));

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(subsystem = "jobs", component = "worker", error = ?e, "Worker task panicked");
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!(subsystem = "jobs", component = "worker", instance = %self.instance, "Worker pool stopped");
    }

    /// Claim, execute, record, repeat. Sleeps only when the queue is empty.
    async fn run_loop(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        let notify = self.store.job_notify();
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);

        while !shutdown.is_cancelled() {
            match self.store.claim_next(&worker_id, self.config.lease_ttl).await {
                Ok(Some(job)) => self.execute_job(&worker_id, job).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = sleep(poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(
                        subsystem = "jobs",
                        component = "worker",
                        worker_id = %worker_id,
                        error = %e,
                        "Failed to claim job"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(poll_interval) => {}
                    }
                }
            }
        }

        debug!(subsystem = "jobs", component = "worker", worker_id = %worker_id, "Worker loop exited");
    }

    /// Execute a single claimed job and record its outcome.
    async fn execute_job(&self, worker_id: &str, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type;
        let attempt = job.attempts_made + 1;

        info!(
            subsystem = "jobs",
            component = "worker",
            job_id = %job_id,
            job_type = %job_type,
            worker_id,
            attempt,
            "Processing job"
        );
        let _ = self.event_tx.send(WorkerEvent::JobStarted {
            job_id,
            job_type,
            worker_id: worker_id.to_string(),
            attempt,
        });

        let token = self.cancellations.register(job_id).await;
        let outcome = self.run_attempt(worker_id, &job, &token).await;
        self.cancellations.release(job_id).await;

        match outcome {
            Attempt::Finished(result) => self.record(worker_id, &job, result, start).await,
            Attempt::Lost(reason) => warn!(
                subsystem = "jobs",
                component = "worker",
                job_id = %job_id,
                worker_id,
                reason = %reason,
                "Lost claim while executing; abandoning job"
            ),
        }
    }

    /// Run the conversion while heartbeating the lease.
    async fn run_attempt(&self, worker_id: &str, job: &Job, token: &CancellationToken) -> Attempt {
        let convert = async {
            // catches a cancel requested between the claim and token registration
            if self.report_progress(worker_id, job.id, 10, "converting").await {
                token.cancel();
            }
            let output = self.dispatcher.dispatch(job, token).await?;
            self.report_progress(worker_id, job.id, 90, "storing result").await;
            let stored = self
                .results
                .save(job.id, &output)
                .await
                .map_err(|e| Error::Conversion(format!("failed to store result: {}", e)))?;
            Ok::<JsonValue, Error>(serde_json::to_value(&stored)?)
        };
        tokio::pin!(convert);

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut convert => return Attempt::Finished(result),
                _ = heartbeat.tick() => {
                    let update = JobUpdate::Heartbeat {
                        worker_id: worker_id.to_string(),
                        lease_ttl: self.config.lease_ttl,
                    };
                    match self.store.update(job.id, update).await {
                        Ok(current) => {
                            // cancel requests from other processes arrive here
                            if current.cancel_requested && !token.is_cancelled() {
                                debug!(
                                    subsystem = "jobs",
                                    component = "worker",
                                    job_id = %job.id,
                                    "Cancel requested; signalling converter"
                                );
                                token.cancel();
                            }
                        }
                        Err(Error::Conflict(msg)) => return Attempt::Lost(msg),
                        Err(e) => warn!(
                            subsystem = "jobs",
                            component = "worker",
                            job_id = %job.id,
                            error = %e,
                            "Heartbeat failed"
                        ),
                    }
                }
            }
        }
    }

    /// Record progress. Returns whether cancellation has been requested.
    async fn report_progress(&self, worker_id: &str, job_id: Uuid, percent: i32, message: &str) -> bool {
        let update = JobUpdate::Progress {
            worker_id: worker_id.to_string(),
            percent,
        };
        match self.store.update(job_id, update).await {
            Ok(current) => {
                let _ = self.event_tx.send(WorkerEvent::JobProgress {
                    job_id,
                    percent,
                    message: Some(message.to_string()),
                });
                current.cancel_requested
            }
            Err(e) => {
                debug!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Progress update rejected"
                );
                false
            }
        }
    }

    /// Persist the outcome of an attempt and publish the matching event.
    async fn record(&self, worker_id: &str, job: &Job, result: Result<JsonValue>, start: Instant) {
        let job_id = job.id;
        let attempt = job.attempts_made + 1;
        let worker_id = worker_id.to_string();

        let (update, error_msg) = match result {
            Ok(descriptor) => (
                JobUpdate::Complete {
                    worker_id,
                    result: descriptor,
                },
                None,
            ),
            Err(Error::Interrupted(_)) => (JobUpdate::Cancelled { worker_id }, None),
            Err(e) if e.is_infrastructure() => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Infrastructure failure during attempt; leaving job for the lease reaper"
                );
                return;
            }
            Err(e) if e.is_retryable() => {
                let reason = e.to_string();
                (
                    JobUpdate::Retry {
                        worker_id,
                        reason: reason.clone(),
                        delay: self.retry.delay_for(attempt),
                    },
                    Some(reason),
                )
            }
            Err(e) => {
                let reason = e.to_string();
                (
                    JobUpdate::Fail {
                        worker_id,
                        reason: reason.clone(),
                    },
                    Some(reason),
                )
            }
        };

        let updated = match self.store.update(job_id, update).await {
            Ok(updated) => updated,
            Err(Error::Conflict(msg)) => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    reason = %msg,
                    "Outcome rejected; claim no longer held"
                );
                return;
            }
            Err(e) => {
                error!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    error = %e,
                    "Failed to record outcome; lease reaper will return the job"
                );
                return;
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let error = error_msg.unwrap_or_default();
        let event = match updated.state {
            JobState::Completed => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempts = updated.attempts_made,
                    duration_ms,
                    "Job completed successfully"
                );
                WorkerEvent::JobCompleted {
                    job_id,
                    job_type: job.job_type,
                    attempts: updated.attempts_made,
                    duration_ms,
                }
            }
            JobState::Delayed => {
                let delay_ms = self.retry.delay_for(attempt).as_millis() as u64;
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempt,
                    delay_ms,
                    error = %error,
                    "Job attempt failed; retrying"
                );
                WorkerEvent::JobRetrying {
                    job_id,
                    job_type: job.job_type,
                    attempt,
                    delay_ms,
                    error,
                }
            }
            JobState::Failed => {
                warn!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    job_type = %job.job_type,
                    attempts = updated.attempts_made,
                    error = %error,
                    duration_ms,
                    "Job failed"
                );
                WorkerEvent::JobFailed {
                    job_id,
                    job_type: job.job_type,
                    attempts: updated.attempts_made,
                    error,
                }
            }
            JobState::Cancelled => {
                info!(
                    subsystem = "jobs",
                    component = "worker",
                    job_id = %job_id,
                    "Job cancelled"
                );
                WorkerEvent::JobCancelled {
                    job_id,
                    job_type: job.job_type,
                }
            }
            JobState::Waiting | JobState::Active => return,
        };

        if updated.state.is_terminal() {
            self.input_cleanup.release(&updated).await;
        }
        let _ = self.event_tx.send(event);
    }
}

/// Builder for creating a worker pool.
pub struct WorkerBuilder {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    results: ResultStore,
    input_cleanup: Arc<dyn InputCleanup>,
    cancellations: CancelRegistry,
    retry: RetryPolicy,
    config: WorkerConfig,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            dispatcher: Dispatcher::new(),
            results: ResultStore::new(defaults::RESULTS_DIR),
            input_cleanup: Arc::new(RetainInput),
            cancellations: CancelRegistry::new(),
            retry: RetryPolicy::default(),
            config: WorkerConfig::default(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_results(mut self, results: ResultStore) -> Self {
        self.results = results;
        self
    }

    pub fn with_input_cleanup(mut self, cleanup: Arc<dyn InputCleanup>) -> Self {
        self.input_cleanup = cleanup;
        self
    }

    /// Share cancellation tokens with a `JobService` in the same process.
    pub fn with_cancellations(mut self, cancellations: CancelRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build and return the pool.
    pub fn build(self) -> WorkerPool {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        let instance = Uuid::now_v7().simple().to_string();
        WorkerPool {
            store: self.store,
            dispatcher: Arc::new(self.dispatcher),
            results: self.results,
            input_cleanup: self.input_cleanup,
            cancellations: self.cancellations,
            retry: self.retry,
            config: self.config,
            event_tx,
            // last 8 hex digits are the random tail of a v7 id
            instance: instance[instance.len() - 8..].to_string(),
        }
    }
}
