//! Job record and queue data types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use uuid::Uuid;

use crate::defaults;
use crate::error::Error;

// =============================================================================
// JOB TYPES
// =============================================================================

/// Supported conversion kinds.
///
/// Each variant must be backed by a registered converter before a job of
/// that type can be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Word processor / presentation / spreadsheet document to PDF
    OfficeToPdf,
    /// Spreadsheet (xlsx, xls, ods) to CSV (first sheet)
    ExcelToCsv,
    /// CSV to xlsx
    CsvToExcel,
    /// Markdown to standalone HTML
    MarkdownToHtml,
    /// HTML to GitHub-flavored markdown
    HtmlToMarkdown,
    /// PDF text layer extraction
    PdfToText,
    /// OCR of a raster image
    ImageToText,
}

impl JobType {
    /// Every conversion type, in declaration order.
    pub const ALL: [JobType; 7] = [
        JobType::OfficeToPdf,
        JobType::ExcelToCsv,
        JobType::CsvToExcel,
        JobType::MarkdownToHtml,
        JobType::HtmlToMarkdown,
        JobType::PdfToText,
        JobType::ImageToText,
    ];

    /// Wire/database name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::OfficeToPdf => "office-to-pdf",
            JobType::ExcelToCsv => "excel-to-csv",
            JobType::CsvToExcel => "csv-to-excel",
            JobType::MarkdownToHtml => "markdown-to-html",
            JobType::HtmlToMarkdown => "html-to-markdown",
            JobType::PdfToText => "pdf-to-text",
            JobType::ImageToText => "image-to-text",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnsupportedType(s.to_string()))
    }
}

// =============================================================================
// JOB STATE
// =============================================================================

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Cancelled,
}

impl JobState {
    /// Listing order used when a listing spans every state.
    pub const ALL: [JobState; 6] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Delayed => "delayed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// `completed`, `failed` and `cancelled` accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Edges of the job state machine.
    ///
    /// `active -> waiting` only happens when the lease reaper returns a
    /// stalled claim to the queue.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Waiting, Cancelled)
                | (Delayed, Active)
                | (Delayed, Cancelled)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Active, Cancelled)
                | (Active, Waiting)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown job state: {}", s)))
    }
}

// =============================================================================
// JOB RECORD
// =============================================================================

/// Reference to the input file plus converter options.
///
/// Options are passed through verbatim to the converter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub input: PathBuf,
    #[serde(default)]
    pub options: JsonMap<String, JsonValue>,
}

impl JobPayload {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            options: JsonMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Canonical string form of the input reference, used for ownership checks.
    pub fn input_key(&self) -> String {
        self.input.to_string_lossy().into_owned()
    }
}

/// A conversion job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub progress: i32,
    pub result: Option<JsonValue>,
    pub failure_reason: Option<String>,
    /// Message of the most recent retried failure.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Earliest claim time while `delayed`.
    pub run_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Times an expired lease returned this job to the queue.
    #[serde(default)]
    pub lease_reclaims: i32,
}

impl Job {
    /// Build a fresh `waiting` record for a new job.
    pub fn from_new(id: Uuid, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            job_type: new.job_type,
            payload: new.payload,
            state: JobState::Waiting,
            attempts_made: 0,
            max_attempts: new.max_attempts,
            progress: 0,
            result: None,
            failure_reason: None,
            last_error: None,
            created_at: now,
            processed_at: None,
            finished_at: None,
            run_at: None,
            lease_owner: None,
            lease_expires_at: None,
            cancel_requested: false,
            lease_reclaims: 0,
        }
    }

    /// Whether `claim_next` may pick this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.attempts_made >= self.max_attempts {
            return false;
        }
        match self.state {
            JobState::Waiting => true,
            JobState::Delayed => self.run_at.map_or(true, |at| at <= now),
            _ => false,
        }
    }

    /// Whether an `active` claim's lease has lapsed.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active && self.lease_expires_at.map_or(true, |at| at <= now)
    }
}

/// Parameters for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: JobPayload,
    pub max_attempts: i32,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: JobPayload) -> Self {
        Self {
            job_type,
            payload,
            max_attempts: defaults::JOB_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Atomic mutation applied through `JobStore::update`.
///
/// Variants carrying a `worker_id` are only accepted from the current claim
/// holder.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    /// Report execution progress (0-100).
    Progress { worker_id: String, percent: i32 },
    /// Extend the claim lease.
    Heartbeat { worker_id: String, lease_ttl: Duration },
    /// Attempt succeeded.
    Complete { worker_id: String, result: JsonValue },
    /// Attempt failed and the job should run again after `delay`.
    Retry {
        worker_id: String,
        reason: String,
        delay: Duration,
    },
    /// Attempt failed terminally.
    Fail { worker_id: String, reason: String },
    /// Attempt was interrupted by a cancellation request.
    Cancelled { worker_id: String },
    /// Flag an active job for cooperative cancellation.
    RequestCancel,
}

impl JobUpdate {
    /// Whether this update moves the job into a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobUpdate::Complete { .. } | JobUpdate::Fail { .. } | JobUpdate::Cancelled { .. }
        )
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            JobUpdate::Progress { worker_id, .. }
            | JobUpdate::Heartbeat { worker_id, .. }
            | JobUpdate::Complete { worker_id, .. }
            | JobUpdate::Retry { worker_id, .. }
            | JobUpdate::Fail { worker_id, .. }
            | JobUpdate::Cancelled { worker_id } => Some(worker_id),
            JobUpdate::RequestCancel => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobUpdate::Progress { .. } => "progress",
            JobUpdate::Heartbeat { .. } => "heartbeat",
            JobUpdate::Complete { .. } => "complete",
            JobUpdate::Retry { .. } => "retry",
            JobUpdate::Fail { .. } => "fail",
            JobUpdate::Cancelled { .. } => "cancelled",
            JobUpdate::RequestCancel => "request_cancel",
        }
    }
}

// =============================================================================
// LISTING
// =============================================================================

/// State filter for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StateFilter {
    #[default]
    All,
    Only(JobState),
}

impl StateFilter {
    /// States covered by this filter, in listing order.
    pub fn states(&self) -> Vec<JobState> {
        match self {
            StateFilter::All => JobState::ALL.to_vec(),
            StateFilter::Only(state) => vec![*state],
        }
    }
}

impl FromStr for StateFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "all" {
            return Ok(StateFilter::All);
        }
        s.parse().map(StateFilter::Only)
    }
}

/// How the offset/limit window is applied when a listing spans several states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PageMode {
    /// Window applied to each state independently, results concatenated in
    /// `JobState::ALL` order. A page may hold up to `limit` jobs per state.
    #[default]
    PerState,
    /// One window over all matching jobs ordered by `created_at`.
    Global,
}

impl FromStr for PageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-state" | "per_state" => Ok(PageMode::PerState),
            "global" => Ok(PageMode::Global),
            other => Err(Error::Validation(format!(
                "Unknown pagination mode: {}",
                other
            ))),
        }
    }
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPage {
    pub jobs: Vec<Job>,
    /// All jobs matching the filter, independent of the window.
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Job counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: i64,
    pub active: i64,
    pub delayed: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub total: i64,
}

impl QueueStats {
    pub fn count(&self, state: JobState) -> i64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Active => self.active,
            JobState::Delayed => self.delayed,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Cancelled => self.cancelled,
        }
    }

    pub fn add(&mut self, state: JobState, n: i64) {
        let slot = match state {
            JobState::Waiting => &mut self.waiting,
            JobState::Active => &mut self.active,
            JobState::Delayed => &mut self.delayed,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += n;
        self.total += n;
    }
}

// =============================================================================
// CONVERSION OUTPUT
// =============================================================================

/// Output produced by a converter.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub bytes: Vec<u8>,
    /// MIME type of `bytes`.
    pub content_type: String,
    /// File extension (without dot) used when storing the output.
    pub extension: String,
    /// Converter-specific metadata, copied into the job result.
    pub metadata: JsonValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_job() -> Job {
        Job::from_new(
            Uuid::nil(),
            NewJob::new(JobType::OfficeToPdf, JobPayload::new("/tmp/in.docx")),
            Utc::now(),
        )
    }

    #[test]
    fn test_job_type_round_trips_through_str() {
        for job_type in JobType::ALL {
            assert_eq!(job_type.as_str().parse::<JobType>().unwrap(), job_type);
        }
    }

    #[test]
    fn test_job_type_unknown_is_unsupported() {
        let err = "docx-to-gif".parse::<JobType>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedType(ref t) if t == "docx-to-gif"));
    }

    #[test]
    fn test_job_type_serde_kebab_case() {
        assert_eq!(
            serde_json::to_value(JobType::ExcelToCsv).unwrap(),
            json!("excel-to-csv")
        );
        let parsed: JobType = serde_json::from_value(json!("image-to-text")).unwrap();
        assert_eq!(parsed, JobType::ImageToText);
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(!JobState::Delayed.is_terminal());
    }

    #[test]
    fn test_terminal_states_have_no_outgoing_edges() {
        for from in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_nothing_reenters_waiting_except_reclaim() {
        for from in JobState::ALL {
            let allowed = from.can_transition_to(JobState::Waiting);
            assert_eq!(allowed, from == JobState::Active, "{} -> waiting", from);
        }
    }

    #[test]
    fn test_state_filter_parse() {
        assert_eq!("all".parse::<StateFilter>().unwrap(), StateFilter::All);
        assert_eq!("".parse::<StateFilter>().unwrap(), StateFilter::All);
        assert_eq!(
            "delayed".parse::<StateFilter>().unwrap(),
            StateFilter::Only(JobState::Delayed)
        );
        assert!("paused".parse::<StateFilter>().is_err());
    }

    #[test]
    fn test_page_mode_parse() {
        assert_eq!("per-state".parse::<PageMode>().unwrap(), PageMode::PerState);
        assert_eq!("global".parse::<PageMode>().unwrap(), PageMode::Global);
        assert!("pages".parse::<PageMode>().is_err());
        assert_eq!(PageMode::default(), PageMode::PerState);
    }

    #[test]
    fn test_new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, defaults::JOB_MAX_ATTEMPTS);
        assert_eq!(job.progress, 0);
        assert!(job.processed_at.is_none());
        assert!(job.finished_at.is_none());
    }

    #[test]
    fn test_delayed_job_claimable_only_after_run_at() {
        let now = Utc::now();
        let mut job = sample_job();
        job.state = JobState::Delayed;
        job.run_at = Some(now + chrono::Duration::seconds(5));
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn test_exhausted_job_not_claimable() {
        let mut job = sample_job();
        job.attempts_made = job.max_attempts;
        assert!(!job.is_claimable(Utc::now()));
    }

    #[test]
    fn test_payload_options_default_to_empty() {
        let payload: JobPayload = serde_json::from_value(json!({"input": "/tmp/a.md"})).unwrap();
        assert!(payload.options.is_empty());
        assert_eq!(payload.input_key(), "/tmp/a.md");
    }

    #[test]
    fn test_queue_stats_add_and_count() {
        let mut stats = QueueStats::default();
        stats.add(JobState::Waiting, 2);
        stats.add(JobState::Failed, 1);
        assert_eq!(stats.count(JobState::Waiting), 2);
        assert_eq!(stats.count(JobState::Failed), 1);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn test_job_update_terminal_flags() {
        let worker_id = "w-1".to_string();
        assert!(JobUpdate::Complete {
            worker_id: worker_id.clone(),
            result: json!({})
        }
        .is_terminal());
        assert!(!JobUpdate::Retry {
            worker_id: worker_id.clone(),
            reason: "x".into(),
            delay: Duration::from_secs(1)
        }
        .is_terminal());
        assert!(JobUpdate::RequestCancel.worker_id().is_none());
        assert_eq!(
            JobUpdate::Heartbeat {
                worker_id,
                lease_ttl: Duration::from_secs(1)
            }
            .name(),
            "heartbeat"
        );
    }
}
