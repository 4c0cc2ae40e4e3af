//! Stepwise workload that only sleeps.
//!
//! Used by the `job-runner` binary to exercise admission, timeouts and
//! cancellation without touching any real data.

use crate::background_jobs::{BackgroundJob, Job, JobContext, JobError};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SimulatedJob {
    steps: u32,
    step_duration: Duration,
    fail_at_step: Option<u32>,
}

impl SimulatedJob {
    pub fn new(steps: u32, step_duration: Duration) -> Self {
        Self {
            steps,
            step_duration,
            fail_at_step: None,
        }
    }

    /// One step per second of `total`.
    pub fn lasting(total: Duration) -> Self {
        let steps = u32::try_from(total.as_secs().max(1)).unwrap_or(u32::MAX);
        Self::new(steps, Duration::from_secs(1))
    }

    /// Make the workload fail once it reaches `step` (0-based).
    pub fn failing_at(mut self, step: u32) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn total_duration(&self) -> Duration {
        self.step_duration * self.steps
    }
}

#[async_trait]
impl BackgroundJob for SimulatedJob {
    async fn execute(&self, ctx: JobContext) -> Result<(), JobError> {
        for step in 0..self.steps {
            ctx.check_cancelled()?;
            if self.fail_at_step == Some(step) {
                return Err(JobError::ExecutionFailed(format!(
                    "simulated failure at step {}",
                    step
                )));
            }
            debug!(
                "Job {} ({}) step {}/{}",
                ctx.job_id,
                ctx.title,
                step + 1,
                self.steps
            );
            tokio::time::sleep(self.step_duration).await;
        }
        Ok(())
    }

    fn on_before_cancel(&self, job: &Job) {
        debug!("Job {} about to be cancelled while {}", job.id(), job.status());
    }

    fn on_after_cancel(&self, job: &Job) {
        info!("Simulated job {} stopped early", job.id());
    }

    fn on_after_exception(&self, job: &Job, error: &JobError) {
        warn!("Simulated job {} gave up: {}", job.id(), error);
    }

    fn on_after_finish(&self, job: &Job) {
        info!(
            "Simulated job {} completed {} steps",
            job.id(),
            self.steps
        );
    }
}
