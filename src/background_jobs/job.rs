use super::context::JobContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Identifier of the user a job was started for.
pub type UserId = i64;

/// Unique job identifier, assigned by the handler and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Whether a newly admitted job must wait for jobs sharing its queue key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// Never blocked
    #[default]
    None,
    /// Blocked by any job with the same title and area
    PerQueue,
    /// Blocked only by the same user's job with the same title and area
    PerQueueAndUser,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered but not started (waiting for admission)
    Created,
    /// Workload is executing
    Running,
    /// Workload completed normally
    Finished,
    /// Cancelled on request, on timeout or at shutdown
    Cancelled,
    /// Workload returned an error or panicked
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Why a job was cancelled. Every reason ends in [`JobStatus::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Requested,
    Timeout,
    Shutdown,
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::Requested => "requested",
            CancelReason::Timeout => "timeout",
            CancelReason::Shutdown => "shutdown",
        }
    }
}

/// Errors a workload can report.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Admission metadata of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub title: String,
    pub area: Option<String>,
    pub user_id: Option<UserId>,
    pub queue_strategy: QueueStrategy,
    pub timeout: Option<Duration>,
}

impl JobSpec {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            area: None,
            user_id: None,
            queue_strategy: QueueStrategy::None,
            timeout: None,
        }
    }

    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }

    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_queue_strategy(mut self, strategy: QueueStrategy) -> Self {
        self.queue_strategy = strategy;
        self
    }

    pub fn with_timeout_secs(self, secs: u64) -> Self {
        self.with_timeout(Duration::from_secs(secs))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether both specs share the (title, area) queue key.
    pub fn same_queue(&self, other: &JobSpec) -> bool {
        self.title == other.title && self.area == other.area
    }
}

/// Workload and lifecycle hooks of a job.
///
/// `execute` receives a [`JobContext`] carrying the job's cancellation token.
/// Cancellation is cooperative: the running future is dropped at its next
/// `.await` once cancellation is requested, and CPU-bound loops should check
/// `ctx.is_cancelled()` themselves.
///
/// Hooks run on the job's own task, outside every lock, and must not block.
#[async_trait]
pub trait BackgroundJob: Send + Sync {
    /// Run the workload.
    async fn execute(&self, ctx: JobContext) -> Result<(), JobError>;

    /// Called while the job is still `Running` (or `Created` if it was queued),
    /// before the cancellation signal is raised.
    fn on_before_cancel(&self, _job: &Job) {}

    /// Called once the job is `Cancelled`.
    fn on_after_cancel(&self, _job: &Job) {}

    /// Called once the job is `Failed`, with the captured error.
    fn on_after_exception(&self, _job: &Job, _error: &JobError) {}

    /// Called once the job is `Finished`.
    fn on_after_finish(&self, _job: &Job) {}

    /// Whether `user` may view or cancel this job instance.
    fn write_access(&self, job: &Job, user: Option<UserId>) -> bool {
        default_write_access(job, user)
    }
}

/// Jobs without a user are open to everyone, otherwise only to their owner.
pub fn default_write_access(job: &Job, user: Option<UserId>) -> bool {
    job.user_id().is_none() || job.user_id() == user
}

#[derive(Debug)]
struct JobState {
    status: JobStatus,
    start_time: Option<DateTime<Utc>>,
    terminated_time: Option<DateTime<Utc>>,
    captured_error: Option<Arc<JobError>>,
    cancel_reason: Option<CancelReason>,
}

/// A tracked unit of background work.
///
/// Status only moves forward: `Created -> Running -> {Finished, Cancelled,
/// Failed}` (a queued job may also go `Created -> Cancelled`). The first
/// terminal transition wins, later ones are ignored.
pub struct Job {
    id: JobId,
    spec: JobSpec,
    work: Arc<dyn BackgroundJob>,
    state: Mutex<JobState>,
    cancel_token: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("state", &*self.state())
            .finish()
    }
}

impl Job {
    pub(crate) fn new(id: JobId, spec: JobSpec, work: Arc<dyn BackgroundJob>) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Created);
        Self {
            id,
            spec,
            work,
            state: Mutex::new(JobState {
                status: JobStatus::Created,
                start_time: None,
                terminated_time: None,
                captured_error: None,
                cancel_reason: None,
            }),
            cancel_token: CancellationToken::new(),
            status_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn title(&self) -> &str {
        &self.spec.title
    }

    pub fn area(&self) -> Option<&str> {
        self.spec.area.as_deref()
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.spec.user_id
    }

    pub fn queue_strategy(&self) -> QueueStrategy {
        self.spec.queue_strategy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.spec.timeout
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn status(&self) -> JobStatus {
        self.state().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.state().start_time
    }

    pub fn terminated_time(&self) -> Option<DateTime<Utc>> {
        self.state().terminated_time
    }

    /// The error the workload failed with, if it failed.
    pub fn captured_error(&self) -> Option<Arc<JobError>> {
        self.state().captured_error.clone()
    }

    /// Set once cancellation has been requested, even if the job then
    /// finished before it could yield.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.state().cancel_reason
    }

    pub fn write_access(&self, user: Option<UserId>) -> bool {
        self.work.write_access(self, user)
    }

    /// Whether this (existing) job blocks the admission of `candidate`.
    pub fn is_blocking(&self, candidate: &JobSpec) -> bool {
        if candidate.queue_strategy == QueueStrategy::None {
            return false;
        }
        if !self.spec.same_queue(candidate) {
            return false;
        }
        match candidate.queue_strategy {
            QueueStrategy::None => false,
            QueueStrategy::PerQueue => true,
            QueueStrategy::PerQueueAndUser => self.spec.user_id == candidate.user_id,
        }
    }

    pub fn timeout_reached(&self) -> bool {
        self.timeout_reached_at(Utc::now())
    }

    pub fn timeout_reached_at(&self, now: DateTime<Utc>) -> bool {
        let Some(timeout) = self.spec.timeout else {
            return false;
        };
        let state = self.state();
        match (state.status, state.start_time) {
            (JobStatus::Running, Some(started)) => {
                let limit = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
                (now - started).num_milliseconds() > limit
            }
            _ => false,
        }
    }

    /// Resolves once the job is terminal (immediately if it already is).
    pub async fn wait_for_termination(&self) -> JobStatus {
        let mut rx = self.status_tx.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// `Created -> Running`. Refused once cancellation was requested.
    pub(crate) fn start(&self) -> bool {
        {
            let mut state = self.state();
            if state.status != JobStatus::Created || state.cancel_reason.is_some() {
                return false;
            }
            state.status = JobStatus::Running;
            state.start_time = Some(Utc::now());
        }
        self.status_tx.send_replace(JobStatus::Running);
        true
    }

    /// `Running -> Finished`, then `on_after_finish`.
    pub(crate) fn finish(&self) -> bool {
        if !self.terminate(JobStatus::Finished, None) {
            return false;
        }
        info!("Job {} ({}) finished", self.id, self.spec.title);
        self.guarded_hook("on_after_finish", || self.work.on_after_finish(self));
        self.status_tx.send_replace(JobStatus::Finished);
        true
    }

    /// `Running -> Failed`, capturing `error`, then `on_after_exception`.
    pub(crate) fn fail(&self, error: JobError) -> bool {
        let error = Arc::new(error);
        if !self.terminate(JobStatus::Failed, Some(Arc::clone(&error))) {
            return false;
        }
        error!("Job {} ({}) failed: {}", self.id, self.spec.title, error);
        self.guarded_hook("on_after_exception", || {
            self.work.on_after_exception(self, &error)
        });
        self.status_tx.send_replace(JobStatus::Failed);
        true
    }

    /// `Created|Running -> Cancelled`, then `on_after_cancel`.
    pub(crate) fn mark_cancelled(&self) -> bool {
        if !self.terminate(JobStatus::Cancelled, None) {
            return false;
        }
        info!(
            "Job {} ({}) cancelled ({})",
            self.id,
            self.spec.title,
            self.cancel_reason()
                .map(|r| r.as_str())
                .unwrap_or("workload")
        );
        self.guarded_hook("on_after_cancel", || self.work.on_after_cancel(self));
        self.status_tx.send_replace(JobStatus::Cancelled);
        true
    }

    fn terminate(&self, target: JobStatus, error: Option<Arc<JobError>>) -> bool {
        let mut state = self.state();
        let allowed = match target {
            JobStatus::Cancelled => {
                matches!(state.status, JobStatus::Created | JobStatus::Running)
            }
            _ => state.status == JobStatus::Running,
        };
        if !allowed {
            return false;
        }
        state.status = target;
        state.terminated_time = Some(Utc::now());
        state.captured_error = error;
        true
    }

    /// Records a cancellation request. Returns the status observed at that
    /// moment, or `None` if the job is terminal or already being cancelled.
    pub(crate) fn request_cancel(&self, reason: CancelReason) -> Option<JobStatus> {
        let mut state = self.state();
        if state.status.is_terminal() || state.cancel_reason.is_some() {
            return None;
        }
        state.cancel_reason = Some(reason);
        Some(state.status)
    }

    /// Second half of a cancellation accepted by [`Job::request_cancel`].
    ///
    /// A queued job is cancelled directly. A running job is signalled and
    /// this waits until its task has yielded and recorded the outcome.
    pub(crate) async fn perform_cancel(&self, observed: JobStatus) {
        self.guarded_hook("on_before_cancel", || self.work.on_before_cancel(self));
        self.cancel_token.cancel();
        if observed == JobStatus::Created && self.mark_cancelled() {
            return;
        }
        self.wait_for_termination().await;
    }

    #[cfg(test)]
    pub(crate) async fn cancel(&self, reason: CancelReason) -> bool {
        match self.request_cancel(reason) {
            Some(observed) => {
                self.perform_cancel(observed).await;
                true
            }
            None => false,
        }
    }

    /// Executes the workload on the current task and records its outcome.
    pub(crate) async fn run(self: Arc<Self>) -> JobStatus {
        let ctx = JobContext::new(self.id, self.spec.title.clone(), self.cancel_token.clone());
        let work = Arc::clone(&self.work);
        let execution = AssertUnwindSafe(async move { work.execute(ctx).await }).catch_unwind();

        debug!("Job {} ({}) executing", self.id, self.spec.title);
        let outcome = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => None,
            result = execution => Some(result),
        };

        match outcome {
            None => {
                self.mark_cancelled();
            }
            Some(Ok(Ok(()))) => {
                self.finish();
            }
            Some(Ok(Err(JobError::Cancelled))) if self.cancel_token.is_cancelled() => {
                self.mark_cancelled();
            }
            Some(Ok(Err(e))) => {
                self.fail(e);
            }
            Some(Err(panic)) => {
                self.fail(JobError::Panicked(panic_message(panic.as_ref())));
            }
        }
        self.status()
    }

    fn guarded_hook(&self, name: &str, hook: impl FnOnce()) {
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
            error!(
                "Job {} hook {} panicked: {}",
                self.id,
                name,
                panic_message(panic.as_ref())
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
