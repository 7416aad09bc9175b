//! In-process queue store.
//!
//! Keeps every job in memory behind a single async mutex, with an ordered
//! index per state so claims and listings stay oldest-first. Used for local
//! development and tests; state does not survive a restart.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use docconv_core::state;
use docconv_core::{
    new_v7, Error, Job, JobPage, JobState, JobStore, JobUpdate, NewJob, PageMode, QueueStats,
    Result, StateFilter,
};

type OrderKey = (DateTime<Utc>, Uuid);

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    by_state: HashMap<JobState, BTreeSet<OrderKey>>,
    /// Input path -> id of the non-terminal job owning it.
    live_inputs: HashMap<String, Uuid>,
}

impl Inner {
    fn key(job: &Job) -> OrderKey {
        (job.created_at, job.id)
    }

    fn index(&mut self, job: &Job) {
        self.by_state
            .entry(job.state)
            .or_default()
            .insert(Self::key(job));
    }

    fn unindex(&mut self, job: &Job) {
        if let Some(set) = self.by_state.get_mut(&job.state) {
            set.remove(&Self::key(job));
        }
    }

    fn insert(&mut self, job: Job) {
        self.index(&job);
        if !job.state.is_terminal() {
            self.live_inputs.insert(job.payload.input_key(), job.id);
        }
        self.jobs.insert(job.id, job);
    }

    fn take(&mut self, job_id: Uuid) -> Option<Job> {
        let job = self.jobs.remove(&job_id)?;
        self.unindex(&job);
        self.release_input(&job);
        Some(job)
    }

    fn release_input(&mut self, job: &Job) {
        let key = job.payload.input_key();
        if self.live_inputs.get(&key) == Some(&job.id) {
            self.live_inputs.remove(&key);
        }
    }

    /// Run `f` against a job, keeping indices consistent with its new state.
    ///
    /// The job is left untouched when `f` fails.
    fn mutate<T>(
        &mut self,
        job_id: Uuid,
        f: impl FnOnce(&mut Job) -> Result<T>,
    ) -> Result<(T, Job)> {
        let current = self.jobs.get(&job_id).ok_or(Error::NotFound(job_id))?;
        let mut next = current.clone();
        let out = f(&mut next)?;

        let previous = self.take(job_id).ok_or(Error::NotFound(job_id))?;
        if previous.state != next.state {
            tracing::trace!(
                subsystem = "db",
                component = "memory",
                job_id = %job_id,
                from = %previous.state,
                to = %next.state,
                "Job transition"
            );
        }
        self.insert(next.clone());
        Ok((out, next))
    }

    fn ordered(&self, job_state: JobState) -> impl Iterator<Item = &Job> + '_ {
        self.by_state
            .get(&job_state)
            .into_iter()
            .flat_map(|set| set.iter())
            .filter_map(|(_, id)| self.jobs.get(id))
    }

    fn next_claimable(&self, now: DateTime<Utc>) -> Option<Uuid> {
        let waiting = self.ordered(JobState::Waiting).find(|j| j.is_claimable(now));
        let delayed = self.ordered(JobState::Delayed).find(|j| j.is_claimable(now));
        match (waiting, delayed) {
            (Some(w), Some(d)) => Some(if Self::key(d) < Self::key(w) { d.id } else { w.id }),
            (Some(j), None) | (None, Some(j)) => Some(j.id),
            (None, None) => None,
        }
    }

    fn count(&self, job_state: JobState) -> i64 {
        self.by_state.get(&job_state).map_or(0, |s| s.len() as i64)
    }
}

/// Queue store kept entirely in process memory.
pub struct MemoryJobStore {
    inner: Mutex<Inner>,
    notify: Arc<Notify>,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, new_job: NewJob) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        let key = new_job.payload.input_key();
        if let Some(owner) = inner.live_inputs.get(&key) {
            return Err(Error::Conflict(format!(
                "input {} is owned by live job {}",
                key, owner
            )));
        }

        // Keep created_at strictly increasing so FIFO order is total.
        let mut now = Utc::now();
        if let Some(newest) = inner
            .by_state
            .values()
            .filter_map(|set| set.last())
            .map(|(at, _)| *at)
            .max()
        {
            if now <= newest {
                now = newest + chrono::Duration::microseconds(1);
            }
        }

        let job = Job::from_new(new_v7(), new_job, now);
        inner.insert(job.clone());
        drop(inner);

        self.notify.notify_waiters();
        Ok(job)
    }

    async fn claim_next(&self, worker_id: &str, lease_ttl: Duration) -> Result<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let Some(job_id) = inner.next_claimable(now) else {
            return Ok(None);
        };
        let ((), job) = inner.mutate(job_id, |job| state::claim(job, worker_id, lease_ttl, now))?;
        Ok(Some(job))
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        let inner = self.inner.lock().await;
        inner.jobs.get(&job_id).cloned().ok_or(Error::NotFound(job_id))
    }

    async fn update(&self, job_id: Uuid, update: JobUpdate) -> Result<Job> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let ((), job) = inner.mutate(job_id, |job| state::apply_update(job, &update, now))?;
        Ok(job)
    }

    async fn remove(&self, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.take(job_id).map(|_| ()).ok_or(Error::NotFound(job_id))
    }

    async fn remove_if_pending(&self, job_id: Uuid) -> Result<Job> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get(&job_id).ok_or(Error::NotFound(job_id))?;
        if !matches!(job.state, JobState::Waiting | JobState::Delayed) {
            return Err(Error::InvalidState(format!(
                "job {} is {}",
                job_id, job.state
            )));
        }
        inner.take(job_id).ok_or(Error::NotFound(job_id))
    }

    async fn list(
        &self,
        filter: StateFilter,
        offset: i64,
        limit: i64,
        mode: PageMode,
    ) -> Result<JobPage> {
        let skip = offset.max(0) as usize;
        let take = limit.max(0) as usize;
        let states = filter.states();
        let inner = self.inner.lock().await;

        let jobs: Vec<Job> = match mode {
            PageMode::PerState => states
                .iter()
                .flat_map(|s| inner.ordered(*s).skip(skip).take(take))
                .cloned()
                .collect(),
            PageMode::Global => {
                let mut all: Vec<&Job> = states.iter().flat_map(|s| inner.ordered(*s)).collect();
                all.sort_by_key(|j| Inner::key(j));
                all.into_iter().skip(skip).take(take).cloned().collect()
            }
        };
        let total = states.iter().map(|s| inner.count(*s)).sum();

        Ok(JobPage {
            jobs,
            total,
            limit,
            offset,
        })
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut inner = self.inner.lock().await;
        let expired: Vec<Uuid> = inner
            .ordered(JobState::Active)
            .filter(|j| j.lease_expired(now))
            .map(|j| j.id)
            .collect();

        let mut reclaimed = Vec::with_capacity(expired.len());
        for job_id in expired {
            let (_, job) = inner.mutate(job_id, |job| state::reclaim(job, now))?;
            reclaimed.push(job);
        }
        drop(inner);

        if reclaimed.iter().any(|j| j.state == JobState::Waiting) {
            self.notify.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn stats(&self) -> Result<QueueStats> {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats::default();
        for job_state in JobState::ALL {
            stats.add(job_state, inner.count(job_state));
        }
        Ok(stats)
    }

    async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.finished_at.is_some_and(|at| at < older_than))
            .map(|j| j.id)
            .collect();
        for job_id in &stale {
            inner.take(*job_id);
        }
        Ok(stale.len() as u64)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
