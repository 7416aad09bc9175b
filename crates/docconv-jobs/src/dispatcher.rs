//! Routing from conversion type to converter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use docconv_core::{defaults, ConversionOutput, Converter, Error, Job, JobType, Result};

/// Registry of converters keyed by conversion type.
///
/// Enqueue consults it to reject unroutable jobs; the worker pool uses it to
/// run a claimed job under the configured timeout.
#[derive(Clone)]
pub struct Dispatcher {
    converters: HashMap<JobType, Arc<dyn Converter>>,
    timeout: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            converters: HashMap::new(),
            timeout: Duration::from_secs(defaults::JOB_TIMEOUT_SECS),
        }
    }

    /// Set the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a converter, replacing any previous one for the same type.
    pub fn with_converter<C: Converter + 'static>(mut self, converter: C) -> Self {
        self.register(Arc::new(converter));
        self
    }

    pub fn register(&mut self, converter: Arc<dyn Converter>) {
        let job_type = converter.job_type();
        debug!(
            subsystem = "jobs",
            component = "dispatcher",
            job_type = %job_type,
            converter = converter.name(),
            "Registered converter"
        );
        self.converters.insert(job_type, converter);
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Registered conversion types.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.converters.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn supports(&self, job_type: JobType) -> bool {
        self.converters.contains_key(&job_type)
    }

    /// Look up the converter for `job_type`.
    pub fn resolve(&self, job_type: JobType) -> Result<Arc<dyn Converter>> {
        self.converters
            .get(&job_type)
            .cloned()
            .ok_or_else(|| Error::UnsupportedType(job_type.to_string()))
    }

    /// Check that `job_type` is routable and its options are acceptable.
    pub fn validate(&self, job_type: JobType, options: &JsonMap<String, JsonValue>) -> Result<()> {
        self.resolve(job_type)?.validate_options(options)
    }

    /// Run the converter for a claimed job.
    ///
    /// Returns `Error::Timeout` when the converter exceeds the timeout, and
    /// `Error::Interrupted` when `cancel` fires while an interruptible
    /// converter is running. Non-interruptible converters ignore `cancel`.
    pub async fn dispatch(&self, job: &Job, cancel: &CancellationToken) -> Result<ConversionOutput> {
        let converter = self.resolve(job.job_type)?;
        let start = Instant::now();
        let call = tokio::time::timeout(
            self.timeout,
            converter.convert(&job.payload.input, &job.payload.options),
        );

        let outcome = if converter.interruptible() {
            tokio::select! {
                res = call => res,
                _ = cancel.cancelled() => {
                    debug!(
                        subsystem = "jobs",
                        component = "dispatcher",
                        job_id = %job.id,
                        "Conversion interrupted by cancellation"
                    );
                    return Err(Error::Interrupted(format!("job {} was cancelled", job.id)));
                }
            }
        } else {
            call.await
        };

        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    subsystem = "jobs",
                    component = "dispatcher",
                    job_id = %job.id,
                    job_type = %job.job_type,
                    converter = converter.name(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Converter exceeded timeout"
                );
                Err(Error::Timeout(self.timeout.as_secs()))
            }
        }
    }
}
