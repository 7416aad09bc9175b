//! Conversion output storage.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

use docconv_core::{defaults, ConversionOutput, Error, Job, JobState, JobStore, Result};

/// Descriptor stored as `Job.result` once a job completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Result bytes ready to hand to a caller.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub file_name: String,
}

/// Writes each job's output to `<dir>/<job_id>.<ext>`.
///
/// Writes go to a temporary sibling and are renamed into place, so a re-run
/// of the same job replaces the file atomically instead of appending to it.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create from `RESULTS_DIR` (default `./data/results`).
    pub fn from_env() -> Self {
        let dir = std::env::var("RESULTS_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| defaults::RESULTS_DIR.to_string());
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(job_id: Uuid, extension: &str) -> String {
        let ext: String = extension
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if ext.is_empty() {
            format!("{}.bin", job_id)
        } else {
            format!("{}.{}", job_id, ext)
        }
    }

    /// Persist a conversion output and return the descriptor to record.
    pub async fn save(&self, job_id: Uuid, output: &ConversionOutput) -> Result<StoredResult> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let file_name = Self::file_name(job_id, &output.extension);
        let path = self.dir.join(&file_name);
        let staging = self.dir.join(format!(".{}.partial", file_name));

        tokio::fs::write(&staging, &output.bytes).await?;
        if let Err(e) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e.into());
        }

        debug!(
            subsystem = "jobs",
            component = "results",
            job_id = %job_id,
            output_bytes = output.bytes.len(),
            path = %path.display(),
            "Stored conversion output"
        );

        Ok(StoredResult {
            path,
            file_name,
            size: output.bytes.len() as u64,
            content_type: output.content_type.clone(),
            metadata: output.metadata.clone(),
        })
    }

    /// Read back the output of a completed job.
    pub async fn load(&self, job: &Job) -> Result<Download> {
        if job.state != JobState::Completed {
            return Err(Error::InvalidState(format!(
                "job {} is {}, not completed",
                job.id, job.state
            )));
        }
        let descriptor: StoredResult = job
            .result
            .clone()
            .ok_or_else(|| Error::Internal(format!("completed job {} has no result", job.id)))
            .and_then(|v| serde_json::from_value(v).map_err(Error::from))?;

        let bytes = tokio::fs::read(&descriptor.path).await.map_err(|e| {
            Error::Internal(format!(
                "result file for job {} is unreadable: {}",
                job.id, e
            ))
        })?;

        Ok(Download {
            bytes,
            content_type: descriptor.content_type,
            file_name: descriptor.file_name,
        })
    }

    /// Job that owns a stored file, parsed from `<job_id>.<ext>`.
    ///
    /// Staging files (`.<job_id>.<ext>.partial`) and foreign names have no owner.
    fn owner(file_name: &str) -> Option<Uuid> {
        file_name.split('.').next().and_then(|stem| stem.parse().ok())
    }

    /// Delete stored outputs last modified before `older_than` whose job
    /// record is gone from `jobs`.
    ///
    /// Files of jobs still on record are kept, so a download never finds the
    /// record without its file.
    pub async fn prune(&self, older_than: SystemTime, jobs: &dyn JobStore) -> Result<u64> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                _ => continue,
            };
            let stale = meta.modified().map(|m| m < older_than).unwrap_or(false);
            if !stale {
                continue;
            }
            if let Some(job_id) = Self::owner(&entry.file_name().to_string_lossy()) {
                match jobs.get(job_id).await {
                    Ok(_) => continue,
                    Err(Error::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    subsystem = "jobs",
                    component = "results",
                    path = %entry.path().display(),
                    error = %e,
                    "Failed to prune result file"
                ),
            }
        }
        Ok(removed)
    }
}
