pub mod background_jobs;
pub mod config;
pub mod duration;
pub mod metrics;

pub use background_jobs::{
    BackgroundJob, Job, JobContext, JobError, JobFn, JobHandler, JobHandlerError, JobId, JobInfo,
    JobSpec, JobStatus, QueueStrategy,
};
pub use config::JobHandlerSettings;
