use super::job::{JobError, JobId};
use tokio_util::sync::CancellationToken;

/// Context provided to a workload during execution.
///
/// Carries the job's identity and the token that is cancelled when the job
/// is cancelled explicitly, times out, or the handler shuts down.
#[derive(Clone, Debug)]
pub struct JobContext {
    /// Id of the job being executed.
    pub job_id: JobId,

    /// Title of the job being executed.
    pub title: String,

    /// Token to check for cancellation requests.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, title: String, cancellation_token: CancellationToken) -> Self {
        Self {
            job_id,
            title,
            cancellation_token,
        }
    }

    /// Check if cancellation has been requested.
    ///
    /// Workloads doing long synchronous stretches should check this
    /// periodically and return early with `JobError::Cancelled` if true.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// `Err(JobError::Cancelled)` once cancellation has been requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancellation_token.cancelled().await
    }
}
