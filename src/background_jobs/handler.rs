use super::info::JobInfo;
use super::job::{BackgroundJob, CancelReason, Job, JobId, JobSpec, JobStatus, UserId};
use crate::config::JobHandlerSettings;
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors returned by [`JobHandler`] operations.
#[derive(Debug, Error)]
pub enum JobHandlerError {
    #[error("Job handler is shutting down")]
    ShuttingDown,

    #[error("Job not found: {0}")]
    NotFound(JobId),
}

/// Tracked jobs, keyed (and therefore ordered) by admission.
#[derive(Default)]
struct Registry {
    jobs: BTreeMap<JobId, Arc<Job>>,
    closed: bool,
}

impl Registry {
    /// First non-terminal job that blocks a new candidate.
    fn find_blocker(&self, candidate: &JobSpec) -> Option<JobId> {
        self.jobs
            .values()
            .find(|job| !job.is_terminal() && job.is_blocking(candidate))
            .map(|job| job.id())
    }

    /// Whether a queued job still has to wait: it waits for running jobs and
    /// for jobs queued before it.
    fn is_queued_job_blocked(&self, queued: &Job) -> bool {
        self.jobs.values().any(|other| {
            if other.id() == queued.id() {
                return false;
            }
            let status = other.status();
            let ahead = status == JobStatus::Running
                || (status == JobStatus::Created && other.id() < queued.id());
            ahead && other.is_blocking(queued.spec())
        })
    }
}

struct HandlerInner {
    settings: JobHandlerSettings,
    registry: AsyncMutex<Registry>,
    next_id: AtomicU64,
    shutdown_token: CancellationToken,
}

/// Owns all live jobs: admission control, cancellation, timeout supervision
/// and eviction of retired jobs.
///
/// Blocked admissions are queued: the job stays `Created` and is started
/// automatically, in admission order, once nothing blocks it anymore.
///
/// All registry mutations and admission decisions happen under one lock.
/// Hooks and workloads never run while it is held.
pub struct JobHandler {
    inner: Arc<HandlerInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl JobHandler {
    /// Create a handler and spawn its supervisor on the current tokio runtime.
    pub fn start(settings: JobHandlerSettings) -> Self {
        info!(
            "Starting job handler (supervisor every {:?}, keeping terminated jobs for {:?})",
            settings.supervisor_interval, settings.keep_terminated_jobs
        );
        let inner = Arc::new(HandlerInner {
            settings,
            registry: AsyncMutex::new(Registry::default()),
            next_id: AtomicU64::new(1),
            shutdown_token: CancellationToken::new(),
        });
        let supervisor = tokio::spawn(run_supervisor(Arc::clone(&inner)));

        Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        }
    }

    pub fn settings(&self) -> &JobHandlerSettings {
        &self.inner.settings
    }

    /// Register a job and start it unless a tracked job blocks it.
    ///
    /// Returns the job handle in both cases; a blocked job stays `Created`
    /// until it can run.
    pub async fn add_job(
        &self,
        spec: JobSpec,
        work: Arc<dyn BackgroundJob>,
    ) -> Result<Arc<Job>, JobHandlerError> {
        let mut registry = self.inner.registry.lock().await;
        if registry.closed {
            return Err(JobHandlerError::ShuttingDown);
        }

        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let job = Arc::new(Job::new(id, spec, work));
        let blocker = registry.find_blocker(job.spec());
        registry.jobs.insert(id, Arc::clone(&job));

        match blocker {
            Some(blocker) => {
                info!(
                    "Job {} ({}) queued behind job {}",
                    id,
                    job.title(),
                    blocker
                );
                metrics::record_job_admitted("queued");
            }
            None => {
                launch(&self.inner, &job);
                metrics::record_job_admitted("started");
            }
        }

        Ok(job)
    }

    /// Cancel a job. Returns `true` if this call cancelled it, `false` if the
    /// job was already terminal, already being cancelled, or is not tracked
    /// by this handler.
    ///
    /// For a running job this waits until the workload has yielded. A
    /// workload that completes before yielding keeps its own outcome; then
    /// this returns `false` although `on_before_cancel` has already run.
    pub async fn cancel_job(&self, job: &Job) -> bool {
        self.inner
            .cancel(job.id(), CancelReason::Requested)
            .await
            .unwrap_or(false)
    }

    pub async fn cancel_job_by_id(&self, id: JobId) -> Result<bool, JobHandlerError> {
        self.inner
            .cancel(id, CancelReason::Requested)
            .await
            .ok_or(JobHandlerError::NotFound(id))
    }

    pub async fn get_job_by_id(&self, id: JobId) -> Option<Arc<Job>> {
        self.inner.registry.lock().await.jobs.get(&id).cloned()
    }

    /// Tracked jobs `user` may view or cancel.
    pub async fn jobs_for_user(&self, user: Option<UserId>) -> Vec<Arc<Job>> {
        let jobs: Vec<Arc<Job>> = {
            let registry = self.inner.registry.lock().await;
            registry.jobs.values().cloned().collect()
        };
        jobs.into_iter()
            .filter(|job| job.write_access(user))
            .collect()
    }

    /// Snapshots of all tracked jobs, ordered by id.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        let registry = self.inner.registry.lock().await;
        registry
            .jobs
            .values()
            .map(|job| JobInfo::from_job(job, now))
            .collect()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.registry.lock().await.jobs.len()
    }

    /// Evict jobs that have been terminal for longer than the retention
    /// window. Returns the number of evicted jobs.
    pub async fn tidy_up(&self) -> usize {
        self.inner.tidy_up_at(Utc::now()).await
    }

    /// [`JobHandler::tidy_up`] evaluated at `now`.
    pub async fn tidy_up_at(&self, now: DateTime<Utc>) -> usize {
        self.inner.tidy_up_at(now).await
    }

    /// Cancel every non-terminal job and stop the supervisor. Further
    /// `add_job` calls fail with [`JobHandlerError::ShuttingDown`].
    /// Calling it again is a no-op.
    pub async fn shutdown_job_handler(&self) {
        let pending: Vec<(Arc<Job>, JobStatus)> = {
            let mut registry = self.inner.registry.lock().await;
            if registry.closed {
                return;
            }
            registry.closed = true;
            registry
                .jobs
                .values()
                .filter_map(|job| {
                    job.request_cancel(CancelReason::Shutdown)
                        .map(|observed| (Arc::clone(job), observed))
                })
                .collect()
        };

        info!("Shutting down job handler, cancelling {} jobs", pending.len());
        self.inner.shutdown_token.cancel();

        let cancellations = futures::future::join_all(
            pending
                .into_iter()
                .map(|(job, observed)| Arc::clone(&self.inner).finish_cancellation(job, observed)),
        );
        let grace = self.inner.settings.shutdown_grace_period;
        if tokio::time::timeout(grace, cancellations).await.is_err() {
            warn!("Some jobs did not yield within {:?} of shutdown", grace);
        }

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }

        info!("Job handler shutdown complete");
    }
}

impl Drop for JobHandler {
    fn drop(&mut self) {
        self.inner.shutdown_token.cancel();
    }
}

impl HandlerInner {
    /// `None` if the job is not tracked, otherwise whether this call
    /// cancelled it.
    async fn cancel(self: &Arc<Self>, id: JobId, reason: CancelReason) -> Option<bool> {
        let (job, observed) = {
            let registry = self.registry.lock().await;
            let job = Arc::clone(registry.jobs.get(&id)?);
            let observed = job.request_cancel(reason);
            (job, observed)
        };

        match observed {
            Some(observed) => {
                debug!("Cancelling job {} ({}) while {}", id, job.title(), observed);
                Arc::clone(self)
                    .finish_cancellation(Arc::clone(&job), observed)
                    .await;
                Some(job.status() == JobStatus::Cancelled)
            }
            None => {
                debug!("Job {} is already {} or being cancelled", id, job.status());
                Some(false)
            }
        }
    }

    async fn finish_cancellation(self: Arc<Self>, job: Arc<Job>, observed: JobStatus) {
        job.perform_cancel(observed).await;
        // Running jobs report through their own task; queued ones never had one.
        if observed == JobStatus::Created {
            self.job_terminated(&job).await;
        }
    }

    async fn job_terminated(self: &Arc<Self>, job: &Job) {
        let run_time = match (job.start_time(), job.terminated_time()) {
            (Some(start), Some(end)) => Some((end - start).to_std().unwrap_or(Duration::ZERO)),
            _ => None,
        };
        metrics::record_job_terminated(job.status().as_str(), run_time);

        let registry = self.registry.lock().await;
        if !registry.closed {
            promote_queued(self, &registry);
        }
    }

    async fn tidy_up_at(&self, now: DateTime<Utc>) -> usize {
        let keep = chrono::Duration::from_std(self.settings.keep_terminated_jobs)
            .unwrap_or(chrono::Duration::MAX);
        let mut registry = self.registry.lock().await;
        let before = registry.jobs.len();
        registry.jobs.retain(|_, job| match job.terminated_time() {
            Some(terminated) => now - terminated <= keep,
            None => true,
        });
        let evicted = before - registry.jobs.len();
        if evicted > 0 {
            debug!("Evicted {} terminated jobs", evicted);
            metrics::record_jobs_evicted(evicted);
        }
        evicted
    }

    async fn cancel_timed_out_jobs(self: &Arc<Self>, now: DateTime<Utc>) {
        let timed_out: Vec<(Arc<Job>, JobStatus)> = {
            let registry = self.registry.lock().await;
            registry
                .jobs
                .values()
                .filter(|job| job.timeout_reached_at(now))
                .filter_map(|job| {
                    job.request_cancel(CancelReason::Timeout)
                        .map(|observed| (Arc::clone(job), observed))
                })
                .collect()
        };

        for (job, observed) in timed_out {
            warn!(
                "Job {} ({}) exceeded its timeout of {:?}, cancelling",
                job.id(),
                job.title(),
                job.timeout().unwrap_or_default()
            );
            metrics::record_job_timed_out();
            // Waiting for the workload to yield must not stall the supervisor.
            tokio::spawn(Arc::clone(self).finish_cancellation(job, observed));
        }
    }
}

/// Start `job` and spawn its task. Called with the registry lock held.
fn launch(inner: &Arc<HandlerInner>, job: &Arc<Job>) -> bool {
    if !job.start() {
        return false;
    }
    info!("Job {} ({}) started", job.id(), job.title());
    metrics::record_job_started();

    let task_job = Arc::clone(job);
    let task_inner = Arc::clone(inner);
    tokio::spawn(async move {
        Arc::clone(&task_job).run().await;
        task_inner.job_terminated(&task_job).await;
    });
    true
}

/// Start every queued job that is no longer blocked, oldest first.
fn promote_queued(inner: &Arc<HandlerInner>, registry: &Registry) -> usize {
    let queued: Vec<Arc<Job>> = registry
        .jobs
        .values()
        .filter(|job| job.status() == JobStatus::Created)
        .cloned()
        .collect();

    let mut started = 0;
    for job in queued {
        if registry.is_queued_job_blocked(&job) {
            continue;
        }
        if launch(inner, &job) {
            debug!("Job {} ({}) left the queue", job.id(), job.title());
            started += 1;
        }
    }
    started
}

async fn run_supervisor(inner: Arc<HandlerInner>) {
    let period = inner.settings.supervisor_interval;
    // First run one full period after start
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                inner.cancel_timed_out_jobs(now).await;
                inner.tidy_up_at(now).await;
                let registry = inner.registry.lock().await;
                if registry.closed {
                    continue;
                }
                let started = promote_queued(&inner, &registry);
                if started > 0 {
                    debug!("Supervisor started {} queued jobs", started);
                }
            }
            _ = inner.shutdown_token.cancelled() => {
                debug!("Job supervisor received shutdown signal");
                break;
            }
        }
    }
}
