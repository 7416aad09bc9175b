//! Centralized default constants for docconv.
//!
//! **This module is the single source of truth** for shared default values.
//! Crates reference these constants instead of defining their own magic
//! numbers; environment variables override them at startup.

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Default worker event broadcast channel capacity.
pub const EVENT_BUS_CAPACITY: usize = 256;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for job listings.
pub const PAGE_LIMIT: i64 = 20;

/// Maximum page size accepted by job listings.
pub const PAGE_LIMIT_MAX: i64 = 500;

/// Default page offset.
pub const PAGE_OFFSET: i64 = 0;

// =============================================================================
// JOB PROCESSING
// =============================================================================

/// Default maximum execution attempts per job.
pub const JOB_MAX_ATTEMPTS: i32 = 3;

/// Base delay for exponential retry backoff (milliseconds).
///
/// Attempt `n` failing delays the next eligibility by `base * 2^(n-1)`.
pub const JOB_BACKOFF_BASE_MS: u64 = 2_000;

/// Ceiling on a single backoff delay (1 hour).
pub const JOB_BACKOFF_MAX_MS: u64 = 3_600_000;

/// Poll interval when the queue is empty (milliseconds).
pub const JOB_POLL_INTERVAL_MS: u64 = 500;

/// Default number of concurrent worker loops.
pub const JOB_MAX_CONCURRENT: usize = 4;

/// Converter timeout in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 60;

/// Claim lease length in seconds. Workers heartbeat every third of this.
pub const JOB_LEASE_SECS: u64 = 30;

/// Lease reclaims tolerated before a job is failed outright. Reclaims do not
/// consume attempts, so this bounds a converter that keeps killing its worker.
pub const JOB_MAX_RECLAIMS: i32 = 3;

/// How often the reaper scans for expired leases (seconds).
pub const JOB_REAPER_INTERVAL_SECS: u64 = 10;

/// How long a cancel request on an active job waits for the worker (milliseconds).
pub const JOB_CANCEL_GRACE_MS: u64 = 5_000;

// =============================================================================
// STORAGE
// =============================================================================

/// Directory where conversion outputs are written.
pub const RESULTS_DIR: &str = "./data/results";

// =============================================================================
// EXTERNAL CONVERTERS
// =============================================================================

/// LibreOffice executable.
pub const LIBREOFFICE_PATH: &str = "soffice";

/// Pandoc executable.
pub const PANDOC_PATH: &str = "pandoc";

/// Poppler pdftotext executable.
pub const PDFTOTEXT_PATH: &str = "pdftotext";

/// Tesseract OCR executable.
pub const TESSERACT_PATH: &str = "tesseract";

/// Default OCR language passed to tesseract.
pub const OCR_LANGUAGE: &str = "eng";
