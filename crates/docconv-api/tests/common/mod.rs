//! Router test harness backed by the in-process queue store.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, Response},
    Router,
};
use chrono::{DateTime, Utc};
use http_body_util::BodyExt;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tempfile::TempDir;
use tokio::sync::Notify;
use tower::ServiceExt;
use uuid::Uuid;

use docconv_api::{router, AppState};
use docconv_core::{
    ConversionOutput, Converter, Error, Job, JobPage, JobStore, JobType, JobUpdate, NewJob,
    PageMode, QueueStats, Result, StateFilter,
};
use docconv_db::MemoryJobStore;
use docconv_jobs::{Dispatcher, JobService, ResultStore};

pub const WORKER: &str = "api-test-worker";

/// Converter that echoes the input path as CSV.
pub struct EchoConverter(pub JobType);

#[async_trait]
impl Converter for EchoConverter {
    fn job_type(&self) -> JobType {
        self.0
    }

    fn name(&self) -> &str {
        "echo"
    }

    async fn convert(
        &self,
        input: &Path,
        _options: &JsonMap<String, JsonValue>,
    ) -> Result<ConversionOutput> {
        Ok(ConversionOutput {
            bytes: format!("converted {}", input.display()).into_bytes(),
            content_type: "text/csv".into(),
            extension: "csv".into(),
            metadata: JsonValue::Null,
        })
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryJobStore>,
    pub results: ResultStore,
    _results_dir: TempDir,
}

impl TestApp {
    /// Router over a fresh store; no worker pool runs, tests drive jobs by hand.
    pub fn new() -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let results_dir = TempDir::new().unwrap();
        let results = ResultStore::new(results_dir.path());
        let dispatcher = Dispatcher::new()
            .with_converter(EchoConverter(JobType::ExcelToCsv))
            .with_converter(EchoConverter(JobType::MarkdownToHtml));

        let jobs = JobService::new(store.clone(), Arc::new(dispatcher))
            .with_results(results.clone())
            .with_cancel_grace(Duration::from_millis(100));
        let router = router(AppState::new(jobs), vec![]);

        Self {
            router,
            store,
            results,
            _results_dir: results_dir,
        }
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<JsonValue>,
    ) -> Response<Body> {
        send(&self.router, method, uri, body).await
    }

    /// Enqueue through the API and return the new job ID.
    pub async fn enqueue(&self, job_type: &str, input: &str) -> Uuid {
        let response = self
            .request(
                Method::POST,
                "/api/v1/jobs",
                Some(serde_json::json!({ "type": job_type, "input": input })),
            )
            .await;
        assert_eq!(response.status(), 201);
        let body = body_json(response).await;
        body["job_id"].as_str().unwrap().parse().unwrap()
    }

    /// Claim the next job and complete it with the echo converter's output.
    pub async fn complete_next(&self) -> Uuid {
        let job = self
            .store
            .claim_next(WORKER, Duration::from_secs(30))
            .await
            .unwrap()
            .expect("a claimable job");
        let output = EchoConverter(job.job_type)
            .convert(&job.payload.input, &job.payload.options)
            .await
            .unwrap();
        let stored = self.results.save(job.id, &output).await.unwrap();
        self.store
            .update(
                job.id,
                JobUpdate::Complete {
                    worker_id: WORKER.into(),
                    result: serde_json::to_value(stored).unwrap(),
                },
            )
            .await
            .unwrap();
        job.id
    }
}

pub async fn send(app: &Router, method: Method, uri: &str, body: Option<JsonValue>) -> Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> JsonValue {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Store whose backend is down.
pub struct DownStore {
    notify: Arc<Notify>,
}

impl DownStore {
    pub fn new() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
        }
    }
}

fn refused<T>() -> Result<T> {
    Err(Error::Unavailable("connection refused".into()))
}

#[async_trait]
impl JobStore for DownStore {
    async fn create(&self, _new_job: NewJob) -> Result<Job> {
        refused()
    }

    async fn claim_next(&self, _worker_id: &str, _lease_ttl: Duration) -> Result<Option<Job>> {
        refused()
    }

    async fn get(&self, _job_id: Uuid) -> Result<Job> {
        refused()
    }

    async fn update(&self, _job_id: Uuid, _update: JobUpdate) -> Result<Job> {
        refused()
    }

    async fn remove(&self, _job_id: Uuid) -> Result<()> {
        refused()
    }

    async fn remove_if_pending(&self, _job_id: Uuid) -> Result<Job> {
        refused()
    }

    async fn list(
        &self,
        _filter: StateFilter,
        _offset: i64,
        _limit: i64,
        _mode: PageMode,
    ) -> Result<JobPage> {
        refused()
    }

    async fn reclaim_expired(&self, _now: DateTime<Utc>) -> Result<Vec<Job>> {
        refused()
    }

    async fn stats(&self) -> Result<QueueStats> {
        refused()
    }

    async fn cleanup(&self, _older_than: DateTime<Utc>) -> Result<u64> {
        refused()
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn ping(&self) -> Result<()> {
        refused()
    }
}

/// Router over a store that refuses every call.
pub fn down_router() -> Router {
    let dispatcher = Dispatcher::new().with_converter(EchoConverter(JobType::ExcelToCsv));
    let jobs = JobService::new(Arc::new(DownStore::new()), Arc::new(dispatcher));
    router(AppState::new(jobs), vec![])
}
