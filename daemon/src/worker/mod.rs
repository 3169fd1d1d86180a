mod queue;

pub use queue::{Job, JobQueue, JobState};

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use flow_common::{
    flow::Flow,
    time::get_current_time_in_millis,
    tokio::{select, spawn_task, sync::Semaphore, time::sleep},
};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{
        QUEUE_IDLE_POLL_MS, RESUME_JOB_DELAY_MS, RETENTION_SWEEP_INTERVAL_SECS,
        WORKER_CONCURRENCY, WORKER_JOBS_PER_SECOND,
    },
    core::storage::{FlowStore, StorageError},
    tracker::{SharedFlowTracker, TrackerError},
};

pub type SharedFlowWorker<S> = Arc<FlowWorker<S>>;

// Token bucket pacing job dispatch; owned by the single dispatch loop
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        Self {
            tokens: rate as f64,
            capacity: rate as f64,
            rate: rate as f64,
            last_refill: Instant::now(),
        }
    }

    async fn acquire(&mut self) {
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
            self.last_refill = now;
            if self.tokens >= 1.0 {
                self.tokens -= 1.0;
                return;
            }
            sleep(Duration::from_secs_f64((1.0 - self.tokens) / self.rate)).await;
        }
    }
}

/// Queue-backed worker: dispatches jobs to the tracker engine under a
/// concurrency cap and a dispatch rate limit, retries worker-level
/// failures, and re-enqueues unfinished flows on startup.
///
/// Stage-incomplete engine failures DO feed the queue retry policy; every
/// re-run short-circuits once the flow reached a terminal status.
pub struct FlowWorker<S: FlowStore> {
    tracker: SharedFlowTracker<S>,
    queue: Arc<JobQueue>,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl<S: FlowStore> FlowWorker<S> {
    pub fn new(tracker: SharedFlowTracker<S>, queue: Arc<JobQueue>) -> SharedFlowWorker<S> {
        Arc::new(Self {
            tracker,
            queue,
            semaphore: Arc::new(Semaphore::new(WORKER_CONCURRENCY)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the dispatch and retention loops
    pub fn start(self: &Arc<Self>) {
        {
            let worker = Arc::clone(self);
            spawn_task("flow-worker", async move {
                worker.dispatch_loop().await;
            });
        }
        {
            let worker = Arc::clone(self);
            spawn_task("job-retention", async move {
                loop {
                    select! {
                        _ = worker.shutdown.cancelled() => break,
                        _ = sleep(Duration::from_secs(RETENTION_SWEEP_INTERVAL_SECS)) => {}
                    }
                    match worker.queue.apply_retention() {
                        Ok(0) => {}
                        Ok(removed) => debug!("retention removed {} jobs", removed),
                        Err(e) => warn!("retention sweep failed: {}", e),
                    }
                }
            });
        }
    }

    pub async fn stop(&self) {
        info!("Stopping flow worker...");
        self.shutdown.cancel();
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Enqueue the polling job for a freshly registered flow.
    /// Keyed by flow id, so re-registrations do not enqueue twice.
    pub fn enqueue_flow(&self, flow: &Flow) -> Result<bool, StorageError> {
        let params = serde_json::to_value(&flow.metadata).unwrap_or(serde_json::Value::Null);
        let job = Job::new(
            format!("flow-{}", flow.id),
            flow.id.clone(),
            flow.flow_type,
            params,
        );
        self.queue.enqueue(job)
    }

    /// Resume on startup: requeue jobs stranded active by a crash and
    /// enqueue one delayed job per non-terminal flow
    pub async fn resume_unfinished(&self) -> Result<usize, TrackerError> {
        let stale = self.queue.requeue_stale_active()?;
        if stale > 0 {
            info!("Requeued {} stale active jobs", stale);
        }

        let flows = self.tracker.store().list_unfinished_flows().await?;
        let mut enqueued = 0;
        for flow in flows {
            let job = Job::new(
                format!("resume-{}-{}", flow.id, get_current_time_in_millis()),
                flow.id.clone(),
                flow.flow_type,
                serde_json::Value::Null,
            )
            .with_delay(RESUME_JOB_DELAY_MS);
            if self.queue.enqueue(job)? {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            info!("Resuming {} unfinished flows", enqueued);
        }
        Ok(enqueued)
    }

    async fn dispatch_loop(self: &Arc<Self>) {
        let mut bucket = TokenBucket::new(WORKER_JOBS_PER_SECOND);
        info!(
            "Flow worker started ({} concurrent jobs, {}/s)",
            WORKER_CONCURRENCY, WORKER_JOBS_PER_SECOND
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let permit = select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    // the semaphore is never closed
                    Err(_) => break,
                }
            };
            bucket.acquire().await;

            let job = match self.queue.next_ready() {
                Ok(Some(job)) => job,
                Ok(None) => {
                    drop(permit);
                    select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work() => {},
                        _ = sleep(Duration::from_millis(QUEUE_IDLE_POLL_MS)) => {},
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    error!("failed to read job queue: {}", e);
                    sleep(Duration::from_millis(QUEUE_IDLE_POLL_MS)).await;
                    continue;
                }
            };

            let worker = Arc::clone(self);
            spawn_task("flow-job", async move {
                worker.run_job(job).await;
                drop(permit);
            });
        }
        info!("Flow worker stopped");
    }

    async fn run_job(&self, job: Job) {
        debug!("running job {} (attempt {})", job.id, job.attempts);
        let result = self.tracker.track_flow(&job.flow_id).await;
        let outcome = match result {
            Ok(()) => self.queue.complete(&job.id),
            // a duplicate of an in-flight run; the per-process lock already
            // guarantees single execution
            Err(TrackerError::FlowAlreadyActive(_)) => {
                debug!(
                    "job {} found flow {} already tracked, completing",
                    job.id, job.flow_id
                );
                self.queue.complete(&job.id)
            }
            Err(e) => {
                warn!("job {} failed: {}", job.id, e);
                self.queue.fail(&job.id, &e.to_string())
            }
        };
        if let Err(e) = outcome {
            error!("failed to persist state of job {}: {}", job.id, e);
        }
    }
}
