#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use timetrack_jobs::{BackgroundJob, Job, JobContext, JobError, JobHandlerSettings, JobStatus};
use tokio::sync::Notify;

pub fn test_settings() -> JobHandlerSettings {
    JobHandlerSettings {
        supervisor_interval: Duration::from_secs(3600),
        keep_terminated_jobs: Duration::from_secs(60),
        shutdown_grace_period: Duration::from_secs(2),
    }
}

/// What a [`ProbeJob`] does once started.
pub enum Behavior {
    /// Finish once the gate is notified
    WaitFor(Arc<Notify>),
    /// Run until cancelled
    UntilCancelled,
    /// Fail right away with the given message
    Fail(String),
}

/// Counts hook invocations and records the status each hook observed.
#[derive(Default)]
pub struct HookLog {
    pub before_cancel: AtomicUsize,
    pub after_cancel: AtomicUsize,
    pub after_exception: AtomicUsize,
    pub after_finish: AtomicUsize,
    pub observed: Mutex<Vec<(&'static str, JobStatus)>>,
}

impl HookLog {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn observed(&self) -> Vec<(&'static str, JobStatus)> {
        self.observed.lock().unwrap().clone()
    }

    fn record(&self, counter: &AtomicUsize, hook: &'static str, job: &Job) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.observed.lock().unwrap().push((hook, job.status()));
    }
}

pub struct ProbeJob {
    behavior: Behavior,
    log: Arc<HookLog>,
}

impl ProbeJob {
    pub fn new(behavior: Behavior) -> (Arc<Self>, Arc<HookLog>) {
        let log = Arc::new(HookLog::default());
        let job = Arc::new(Self {
            behavior,
            log: Arc::clone(&log),
        });
        (job, log)
    }
}

#[async_trait]
impl BackgroundJob for ProbeJob {
    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        match &self.behavior {
            Behavior::WaitFor(gate) => {
                gate.notified().await;
                Ok(())
            }
            Behavior::UntilCancelled => {
                ctx.cancelled().await;
                Err(JobError::Cancelled)
            }
            Behavior::Fail(message) => Err(JobError::ExecutionFailed(message.clone())),
        }
    }

    fn on_before_cancel(&self, job: &Job) {
        self.log.record(&self.log.before_cancel, "before_cancel", job);
    }

    fn on_after_cancel(&self, job: &Job) {
        self.log.record(&self.log.after_cancel, "after_cancel", job);
    }

    fn on_after_exception(&self, job: &Job, _error: &JobError) {
        self.log
            .record(&self.log.after_exception, "after_exception", job);
    }

    fn on_after_finish(&self, job: &Job) {
        self.log.record(&self.log.after_finish, "after_finish", job);
    }
}
