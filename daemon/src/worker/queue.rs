use chrono::{DateTime, Utc};
use flow_common::{
    flow::FlowType,
    time::{get_current_time_in_millis, TimestampMillis},
    tokio::sync::Notify,
};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};

use crate::{
    config::{
        COMPLETED_JOB_RETENTION_COUNT, COMPLETED_JOB_RETENTION_SECS, FAILED_JOB_RETENTION_SECS,
        JOB_MAX_ATTEMPTS, JOB_RETRY_BASE_DELAY_MS,
    },
    core::storage::StorageError,
};

const JOBS_TREE: &str = "jobs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
}

/// One unit of polling work: run the tracker engine for one flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub flow_id: String,
    pub flow_type: FlowType,
    /// Params snapshot carried for observability; the engine re-derives
    /// from the stored flow
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest dispatch time (delay + retry backoff)
    pub not_before: TimestampMillis,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: String, flow_id: String, flow_type: FlowType, params: Value) -> Self {
        let now = Utc::now();
        Self {
            id,
            flow_id,
            flow_type,
            params,
            state: JobState::Waiting,
            attempts: 0,
            max_attempts: JOB_MAX_ATTEMPTS,
            not_before: get_current_time_in_millis(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.not_before = get_current_time_in_millis() + delay_ms;
        self
    }
}

/// Durable, single-process job queue on a sled tree.
///
/// One logical worker consumes it; the in-memory flow lock plus the
/// engine's terminal-status guard make duplicate jobs harmless. Sharing one
/// queue across processes is NOT supported without an external lease.
pub struct JobQueue {
    jobs: Tree,
    notify: Notify,
}

impl JobQueue {
    pub fn new(db: &Db) -> Result<Self, StorageError> {
        Ok(Self {
            jobs: db.open_tree(JOBS_TREE)?,
            notify: Notify::new(),
        })
    }

    fn read(&self, id: &str) -> Result<Option<Job>, StorageError> {
        match self.jobs.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write(&self, job: &Job) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(job)?;
        self.jobs.insert(job.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = Result<Job, StorageError>> + '_ {
        self.jobs.iter().values().map(|result| {
            let bytes = result?;
            Ok(serde_json::from_slice(&bytes)?)
        })
    }

    /// Insert a job unless its id is already present.
    /// Returns whether the job was actually enqueued.
    pub fn enqueue(&self, job: Job) -> Result<bool, StorageError> {
        if self.jobs.contains_key(job.id.as_bytes())? {
            debug!("job {} already queued", job.id);
            return Ok(false);
        }
        debug!("enqueueing job {} for flow {}", job.id, job.flow_id);
        self.write(&job)?;
        self.notify.notify_one();
        Ok(true)
    }

    /// Block until the queue may have dispatchable work
    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }

    /// Earliest waiting job whose dispatch time has arrived, flipped to
    /// active before being handed out
    pub fn next_ready(&self) -> Result<Option<Job>, StorageError> {
        let now = get_current_time_in_millis();
        let mut candidate: Option<Job> = None;
        for job in self.iter() {
            let job = job?;
            if job.state != JobState::Waiting || job.not_before > now {
                continue;
            }
            let earlier = candidate
                .as_ref()
                .map(|c| job.not_before < c.not_before)
                .unwrap_or(true);
            if earlier {
                candidate = Some(job);
            }
        }

        if let Some(mut job) = candidate {
            job.state = JobState::Active;
            job.attempts += 1;
            job.updated_at = Utc::now();
            self.write(&job)?;
            return Ok(Some(job));
        }
        Ok(None)
    }

    pub fn complete(&self, id: &str) -> Result<(), StorageError> {
        if let Some(mut job) = self.read(id)? {
            job.state = JobState::Completed;
            job.updated_at = Utc::now();
            self.write(&job)?;
            if log::log_enabled!(log::Level::Trace) {
                trace!("job {} completed", id);
            }
        }
        Ok(())
    }

    /// Record a failed attempt. The job goes back to waiting with
    /// exponential backoff until its attempts are exhausted, then parks in
    /// the failed store.
    pub fn fail(&self, id: &str, error: &str) -> Result<(), StorageError> {
        let Some(mut job) = self.read(id)? else {
            return Ok(());
        };
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        if job.attempts >= job.max_attempts {
            debug!("job {} failed permanently: {}", id, error);
            job.state = JobState::Failed;
        } else {
            // 2s, 4s, 8s, ...
            let backoff = JOB_RETRY_BASE_DELAY_MS
                .saturating_mul(2u64.saturating_pow(job.attempts.saturating_sub(1)));
            debug!(
                "job {} attempt {}/{} failed, retrying in {}ms: {}",
                id, job.attempts, job.max_attempts, backoff, error
            );
            job.state = JobState::Waiting;
            job.not_before = get_current_time_in_millis() + backoff;
        }
        self.write(&job)?;
        self.notify.notify_one();
        Ok(())
    }

    /// Jobs left active by a crashed process go back to waiting
    pub fn requeue_stale_active(&self) -> Result<usize, StorageError> {
        let mut requeued = 0;
        for job in self.iter().collect::<Vec<_>>() {
            let mut job = job?;
            if job.state == JobState::Active {
                job.state = JobState::Waiting;
                job.not_before = get_current_time_in_millis();
                job.updated_at = Utc::now();
                self.write(&job)?;
                requeued += 1;
            }
        }
        if requeued > 0 {
            self.notify.notify_one();
        }
        Ok(requeued)
    }

    pub fn jobs_for_flow(&self, flow_id: &str) -> Result<Vec<Job>, StorageError> {
        let mut jobs = Vec::new();
        for job in self.iter() {
            let job = job?;
            if job.flow_id == flow_id {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    /// Apply the retention policy: completed jobs expire after 24h (or
    /// beyond the last 1000), failed jobs after 7 days.
    pub fn apply_retention(&self) -> Result<usize, StorageError> {
        let now = Utc::now();
        let mut completed: Vec<Job> = Vec::new();
        let mut removed = 0;

        for job in self.iter().collect::<Vec<_>>() {
            let job = job?;
            let age_secs = (now - job.updated_at).num_seconds().max(0) as u64;
            match job.state {
                JobState::Completed => {
                    if age_secs > COMPLETED_JOB_RETENTION_SECS {
                        self.jobs.remove(job.id.as_bytes())?;
                        removed += 1;
                    } else {
                        completed.push(job);
                    }
                }
                JobState::Failed => {
                    if age_secs > FAILED_JOB_RETENTION_SECS {
                        self.jobs.remove(job.id.as_bytes())?;
                        removed += 1;
                    }
                }
                _ => {}
            }
        }

        // keep only the most recent completed jobs
        if completed.len() > COMPLETED_JOB_RETENTION_COUNT {
            completed.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            for job in completed.drain(COMPLETED_JOB_RETENTION_COUNT..) {
                self.jobs.remove(job.id.as_bytes())?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
