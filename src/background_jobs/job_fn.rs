//! Closure-based [`BackgroundJob`] with optional hook callbacks.

use super::context::JobContext;
use super::job::{default_write_access, BackgroundJob, Job, JobError, UserId};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

type Hook = Box<dyn Fn(&Job) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&Job, &JobError) + Send + Sync>;
type AccessCheck = Box<dyn Fn(&Job, Option<UserId>) -> bool + Send + Sync>;

/// Wraps an async closure as a job workload.
///
/// ```ignore
/// let work = JobFn::new(|ctx| async move {
///     ctx.check_cancelled()?;
///     Ok(())
/// })
/// .on_after_finish(|job| tracing::info!("Export {} done", job.id()))
/// .into_arc();
/// ```
pub struct JobFn<F> {
    run: F,
    before_cancel: Option<Hook>,
    after_cancel: Option<Hook>,
    after_exception: Option<ErrorHook>,
    after_finish: Option<Hook>,
    write_access: Option<AccessCheck>,
}

impl<F, Fut> JobFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    pub fn new(run: F) -> Self {
        Self {
            run,
            before_cancel: None,
            after_cancel: None,
            after_exception: None,
            after_finish: None,
            write_access: None,
        }
    }

    pub fn on_before_cancel(mut self, hook: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.before_cancel = Some(Box::new(hook));
        self
    }

    pub fn on_after_cancel(mut self, hook: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.after_cancel = Some(Box::new(hook));
        self
    }

    pub fn on_after_exception(
        mut self,
        hook: impl Fn(&Job, &JobError) + Send + Sync + 'static,
    ) -> Self {
        self.after_exception = Some(Box::new(hook));
        self
    }

    pub fn on_after_finish(mut self, hook: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.after_finish = Some(Box::new(hook));
        self
    }

    pub fn with_write_access(
        mut self,
        check: impl Fn(&Job, Option<UserId>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.write_access = Some(Box::new(check));
        self
    }

    pub fn into_arc(self) -> Arc<dyn BackgroundJob> {
        Arc::new(self)
    }
}

#[async_trait]
impl<F, Fut> BackgroundJob for JobFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        (self.run)(ctx).await
    }

    fn on_before_cancel(&self, job: &Job) {
        if let Some(hook) = &self.before_cancel {
            hook(job);
        }
    }

    fn on_after_cancel(&self, job: &Job) {
        if let Some(hook) = &self.after_cancel {
            hook(job);
        }
    }

    fn on_after_exception(&self, job: &Job, error: &JobError) {
        if let Some(hook) = &self.after_exception {
            hook(job, error);
        }
    }

    fn on_after_finish(&self, job: &Job) {
        if let Some(hook) = &self.after_finish {
            hook(job);
        }
    }

    fn write_access(&self, job: &Job, user: Option<UserId>) -> bool {
        match &self.write_access {
            Some(check) => check(job, user),
            None => default_write_access(job, user),
        }
    }
}
