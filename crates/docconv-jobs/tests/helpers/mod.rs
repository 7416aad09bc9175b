//! Test doubles and harness shared by the worker and service suites.
//!
//! Everything runs against `MemoryJobStore`; converters are scripted so the
//! tests never need LibreOffice or pandoc installed.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use docconv_db::MemoryJobStore;
use docconv_jobs::{
    CancelRegistry, ConversionOutput, Converter, Dispatcher, Error, Job, JobPage, JobService,
    JobState, JobStatusView, JobStore, JobType, JobUpdate, NewJob, PageMode, QueueStats,
    ResultStore, Result, RetryPolicy, StateFilter, WorkerBuilder, WorkerConfig, WorkerHandle,
};

/// Converter that fails its first `failures` calls per input, then succeeds.
#[derive(Clone)]
pub struct ScriptedConverter {
    job_type: JobType,
    failures: usize,
    error: fn(String) -> Error,
    delay: Duration,
    interruptible: bool,
    calls: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl ScriptedConverter {
    pub fn new(job_type: JobType, failures: usize) -> Self {
        Self {
            job_type,
            failures,
            error: Error::Conversion,
            delay: Duration::ZERO,
            interruptible: true,
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn succeeding(job_type: JobType) -> Self {
        Self::new(job_type, 0)
    }

    pub fn with_error(mut self, error: fn(String) -> Error) -> Self {
        self.error = error;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn non_interruptible(mut self) -> Self {
        self.interruptible = false;
        self
    }

    pub fn calls(&self, input: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(Path::new(input))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl Converter for ScriptedConverter {
    fn job_type(&self) -> JobType {
        self.job_type
    }

    fn name(&self) -> &str {
        "scripted"
    }

    fn interruptible(&self) -> bool {
        self.interruptible
    }

    async fn convert(
        &self,
        input: &Path,
        _options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(input.to_path_buf()).or_insert(0);
            *n += 1;
            *n
        };
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if call <= self.failures {
            return Err((self.error)(format!("call {} for {} failed", call, input.display())));
        }
        Ok(ConversionOutput {
            bytes: format!("converted {}", input.display()).into_bytes(),
            content_type: "text/csv".into(),
            extension: "csv".into(),
            metadata: json!({ "call": call }),
        })
    }
}

/// Store whose backing service is down: every call fails with `Unavailable`.
#[derive(Default)]
pub struct UnreachableStore {
    notify: Arc<Notify>,
}

fn down<T>() -> Result<T> {
    Err(Error::Unavailable("connection refused".into()))
}

#[async_trait]
impl JobStore for UnreachableStore {
    async fn create(&self, _new_job: NewJob) -> Result<Job> {
        down()
    }

    async fn claim_next(&self, _worker_id: &str, _lease_ttl: Duration) -> Result<Option<Job>> {
        down()
    }

    async fn get(&self, _job_id: Uuid) -> Result<Job> {
        down()
    }

    async fn update(&self, _job_id: Uuid, _update: JobUpdate) -> Result<Job> {
        down()
    }

    async fn remove(&self, _job_id: Uuid) -> Result<()> {
        down()
    }

    async fn remove_if_pending(&self, _job_id: Uuid) -> Result<Job> {
        down()
    }

    async fn list(
        &self,
        _filter: StateFilter,
        _offset: i64,
        _limit: i64,
        _mode: PageMode,
    ) -> Result<JobPage> {
        down()
    }

    async fn reclaim_expired(&self, _now: DateTime<Utc>) -> Result<Vec<Job>> {
        down()
    }

    async fn stats(&self) -> Result<QueueStats> {
        down()
    }

    async fn cleanup(&self, _older_than: DateTime<Utc>) -> Result<u64> {
        down()
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn ping(&self) -> Result<()> {
        down()
    }
}

/// Fast settings so retries and reclaims finish within a test run.
pub fn fast_config() -> WorkerConfig {
    WorkerConfig::default()
        .with_poll_interval(10)
        .with_max_concurrent(2)
        .with_reaper_interval(Duration::from_millis(25))
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base(Duration::from_millis(10))
        .with_max(Duration::from_secs(1))
}

/// Worker pool plus service sharing one in-memory store.
pub struct Harness {
    pub store: Arc<MemoryJobStore>,
    pub service: JobService,
    pub handle: WorkerHandle,
    pub results_dir: TempDir,
}

impl Harness {
    pub fn start(dispatcher: Dispatcher, config: WorkerConfig) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        Self::start_with_store(store, dispatcher, config)
    }

    pub fn start_with_store(
        store: Arc<MemoryJobStore>,
        dispatcher: Dispatcher,
        config: WorkerConfig,
    ) -> Self {
        let results_dir = tempfile::tempdir().unwrap();
        let results = ResultStore::new(results_dir.path());
        let cancellations = CancelRegistry::new();

        let handle = WorkerBuilder::new(store.clone())
            .with_config(config)
            .with_dispatcher(dispatcher.clone())
            .with_results(results.clone())
            .with_cancellations(cancellations.clone())
            .with_retry_policy(fast_retry())
            .build()
            .start();

        let service = JobService::new(store.clone(), Arc::new(dispatcher))
            .with_results(results)
            .with_cancellations(cancellations)
            .with_cancel_grace(Duration::from_secs(2));

        Self {
            store,
            service,
            handle,
            results_dir,
        }
    }
}

/// Poll `status` until the job reaches `state`, failing after five seconds.
pub async fn wait_for_state(service: &JobService, job_id: Uuid, state: JobState) -> JobStatusView {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let view = service.status(job_id).await.unwrap();
        if view.state == state {
            return view;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            job_id,
            view.state,
            state
        );
        sleep(Duration::from_millis(10)).await;
    }
}
