//! PostgreSQL queue store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Pool, Postgres, Row};
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use docconv_core::state::{self, to_chrono};
use docconv_core::{
    new_v7, Error, Job, JobPage, JobPayload, JobState, JobStore, JobUpdate, NewJob, PageMode,
    QueueStats, Result, StateFilter,
};

const JOB_COLUMNS: &str = "id, job_type, input_ref, options, state::text AS state, attempts_made,
     max_attempts, progress, result, failure_reason, last_error, created_at, processed_at,
     finished_at, run_at, lease_owner, lease_expires_at, cancel_requested, lease_reclaims";

/// PostgreSQL implementation of `JobStore`.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers, in this process
/// or others, never receive the same row.
pub struct PgJobStore {
    pool: Pool<Postgres>,
    notify: Arc<Notify>,
}

impl PgJobStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            pool,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Apply pending schema migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Parse a job row into a Job struct.
    fn parse_job_row(row: &PgRow) -> Result<Job> {
        let job_type: String = row.try_get("job_type")?;
        let state: String = row.try_get("state")?;
        let input: String = row.try_get("input_ref")?;
        let options = match row.try_get::<JsonValue, _>("options")? {
            JsonValue::Object(map) => map,
            _ => JsonMap::new(),
        };

        Ok(Job {
            id: row.try_get("id")?,
            job_type: job_type
                .parse()
                .map_err(|_| Error::Internal(format!("unknown job_type in store: {}", job_type)))?,
            payload: JobPayload {
                input: input.into(),
                options,
            },
            state: state
                .parse()
                .map_err(|_| Error::Internal(format!("unknown state in store: {}", state)))?,
            attempts_made: row.try_get("attempts_made")?,
            max_attempts: row.try_get("max_attempts")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            failure_reason: row.try_get("failure_reason")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
            finished_at: row.try_get("finished_at")?,
            run_at: row.try_get("run_at")?,
            lease_owner: row.try_get("lease_owner")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            lease_reclaims: row.try_get("lease_reclaims")?,
        })
    }

    async fn lock_job(conn: &mut PgConnection, job_id: Uuid) -> Result<Job> {
        let query = format!("SELECT {} FROM job_queue WHERE id = $1 FOR UPDATE", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(Error::NotFound(job_id))?;
        Self::parse_job_row(&row)
    }

    /// Write back every mutable column of a job locked by the caller.
    async fn persist(conn: &mut PgConnection, job: &Job) -> Result<()> {
        sqlx::query(
            "UPDATE job_queue
             SET state = $2::job_state, attempts_made = $3, progress = $4, result = $5,
                 failure_reason = $6, last_error = $7, processed_at = $8, finished_at = $9,
                 run_at = $10, lease_owner = $11, lease_expires_at = $12, cancel_requested = $13,
                 lease_reclaims = $14
             WHERE id = $1",
        )
        .bind(job.id)
        .bind(job.state.as_str())
        .bind(job.attempts_made)
        .bind(job.progress)
        .bind(&job.result)
        .bind(&job.failure_reason)
        .bind(&job.last_error)
        .bind(job.processed_at)
        .bind(job.finished_at)
        .bind(job.run_at)
        .bind(&job.lease_owner)
        .bind(job.lease_expires_at)
        .bind(job.cancel_requested)
        .bind(job.lease_reclaims)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    fn state_names(filter: StateFilter) -> Vec<String> {
        filter
            .states()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job> {
        let job = Job::from_new(new_v7(), new_job, Utc::now());
        let query = format!(
            "INSERT INTO job_queue (id, job_type, input_ref, options, state, max_attempts, created_at)
             VALUES ($1, $2, $3, $4, 'waiting'::job_state, $5, $6)
             RETURNING {}",
            JOB_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(job.id)
            .bind(job.job_type.as_str())
            .bind(job.payload.input_key())
            .bind(JsonValue::Object(job.payload.options.clone()))
            .bind(job.max_attempts)
            .bind(job.created_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db) if db.is_unique_violation() => Error::Conflict(
                    format!("input {} is owned by another live job", job.payload.input_key()),
                ),
                other => Error::Database(other),
            })?;

        self.notify.notify_waiters();
        Self::parse_job_row(&row)
    }

    async fn claim_next(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let query = format!(
            "UPDATE job_queue
             SET state = 'active'::job_state, processed_at = COALESCE(processed_at, $1),
                 lease_owner = $2, lease_expires_at = $3, run_at = NULL, progress = 0
             WHERE id = (
                 SELECT id FROM job_queue
                 WHERE attempts_made < max_attempts
                   AND (state = 'waiting'::job_state
                        OR (state = 'delayed'::job_state AND (run_at IS NULL OR run_at <= $1)))
                 ORDER BY created_at ASC, id ASC
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {}",
            JOB_COLUMNS
        );

        let row = sqlx::query(&query)
            .bind(now)
            .bind(worker_id)
            .bind(now + to_chrono(lease_ttl))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        let query = format!("SELECT {} FROM job_queue WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(Error::NotFound(job_id))?;
        Self::parse_job_row(&row)
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let mut job = Self::lock_job(&mut tx, job_id).await?;
        state::apply_update(&mut job, &update, Utc::now())?;
        Self::persist(&mut tx, &job).await?;
        tx.commit().await?;

        debug!(
            subsystem = "db",
            component = "jobs",
            op = update.name(),
            job_id = %job_id,
            state = %job.state,
            "Job updated"
        );
        Ok(job)
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(job_id));
        }
        Ok(())
    }

    async fn remove_if_pending(&self, job_id: Uuid) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let job = Self::lock_job(&mut tx, job_id).await?;
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Err(Error::InvalidState(format!(
                "job {} is {}",
                job_id, job.state
            )));
        }
        sqlx::query("DELETE FROM job_queue WHERE id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn list(
        &self,
        filter: StateFilter,
        offset: i64,
        limit: i64,
        mode: PageMode,
    ) -> Result<JobPage> {
        let mut jobs = Vec::new();
        match mode {
            PageMode::PerState => {
                let query = format!(
                    "SELECT {} FROM job_queue WHERE state = $1::job_state
                     ORDER BY created_at ASC, id ASC
                     LIMIT $2 OFFSET $3",
                    JOB_COLUMNS
                );
                for job_state in filter.states() {
                    let rows = sqlx::query(&query)
                        .bind(job_state.as_str())
                        .bind(limit)
                        .bind(offset)
                        .fetch_all(&self.pool)
                        .await?;
                    for row in &rows {
                        jobs.push(Self::parse_job_row(row)?);
                    }
                }
            }
            PageMode::Global => {
                let query = format!(
                    "SELECT {} FROM job_queue WHERE state::text = ANY($1)
                     ORDER BY created_at ASC, id ASC
                     LIMIT $2 OFFSET $3",
                    JOB_COLUMNS
                );
                let rows = sqlx::query(&query)
                    .bind(Self::state_names(filter))
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?;
                for row in &rows {
                    jobs.push(Self::parse_job_row(row)?);
                }
            }
        }

        let total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM job_queue WHERE state::text = ANY($1)")
                .bind(Self::state_names(filter))
                .fetch_one(&self.pool)
                .await?;

        Ok(JobPage {
            jobs,
            total,
            limit,
            offset,
        })
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let query = format!(
            "SELECT {} FROM job_queue
             WHERE state = 'active'::job_state
               AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
             ORDER BY created_at ASC
             FOR UPDATE SKIP LOCKED",
            JOB_COLUMNS
        );
        let rows = sqlx::query(&query).bind(now).fetch_all(&mut *tx).await?;

        let mut reclaimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut job = Self::parse_job_row(row)?;
            state::reclaim(&mut job, now)?;
            Self::persist(&mut tx, &job).await?;
            reclaimed.push(job);
        }
        tx.commit().await?;

        if reclaimed.iter().any(|j| j.state == JobState::Waiting) {
            self.notify.notify_waiters();
        }
        if !reclaimed.is_empty() {
            info!(
                subsystem = "db",
                component = "jobs",
                op = "reclaim_expired",
                count = reclaimed.len(),
                "Reclaimed jobs with expired leases"
            );
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT state::text AS state, COUNT(*) AS n FROM job_queue GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let name: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            if let Ok(job_state) = name.parse::<JobState>() {
                stats.add(job_state, n);
            }
        }
        Ok(stats)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM job_queue
             WHERE state IN ('completed'::job_state, 'failed'::job_state, 'cancelled'::job_state)
               AND finished_at < $1",
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Unavailable(format!("queue store unreachable: {}", e)))?;
        Ok(())
    }
}
