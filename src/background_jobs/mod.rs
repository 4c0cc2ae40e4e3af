//! Background job handling.
//!
//! A [`JobHandler`] owns every live [`Job`]: it decides whether a newly added
//! job may start (per its [`QueueStrategy`]), runs each job on its own tokio
//! task, cancels jobs on request, on timeout or at shutdown, and evicts
//! terminated jobs once their retention window has passed.

mod context;
mod handler;
mod info;
mod job;
mod job_fn;
pub mod jobs;

pub use context::JobContext;
pub use handler::{JobHandler, JobHandlerError};
pub use info::JobInfo;
pub use job::{
    default_write_access, BackgroundJob, CancelReason, Job, JobError, JobId, JobSpec, JobStatus,
    QueueStrategy, UserId,
};
pub use job_fn::JobFn;
