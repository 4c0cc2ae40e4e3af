use super::job::{CancelReason, Job, JobId, JobStatus, QueueStrategy, UserId};
use crate::duration::display_duration_at;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Read-only snapshot of a job, for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: JobId,
    pub title: String,
    pub area: Option<String>,
    pub user_id: Option<UserId>,
    pub queue_strategy: QueueStrategy,
    pub status: JobStatus,
    pub started_at: Option<String>,
    pub terminated_at: Option<String>,
    /// Elapsed run time, up to termination for terminal jobs.
    pub running_for: Option<String>,
    pub timeout_ms: Option<u64>,
    pub error_message: Option<String>,
    pub cancel_reason: Option<CancelReason>,
}

impl JobInfo {
    pub fn from_job(job: &Job, now: DateTime<Utc>) -> Self {
        let start_time = job.start_time();
        let terminated_time = job.terminated_time();

        Self {
            id: job.id(),
            title: job.title().to_string(),
            area: job.area().map(str::to_string),
            user_id: job.user_id(),
            queue_strategy: job.queue_strategy(),
            status: job.status(),
            started_at: start_time.map(|t| t.to_rfc3339()),
            terminated_at: terminated_time.map(|t| t.to_rfc3339()),
            running_for: start_time
                .map(|started| display_duration_at(started, terminated_time.unwrap_or(now))),
            timeout_ms: job
                .timeout()
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            error_message: job.captured_error().map(|e| e.to_string()),
            cancel_reason: job.cancel_reason(),
        }
    }
}

impl From<&Job> for JobInfo {
    fn from(job: &Job) -> Self {
        Self::from_job(job, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::job::{JobError, JobSpec};
    use crate::background_jobs::JobFn;

    fn job(spec: JobSpec) -> Job {
        Job::new(
            JobId(4),
            spec,
            JobFn::new(|_ctx| async { Ok(()) }).into_arc(),
        )
    }

    #[test]
    fn test_info_of_queued_job() {
        let job = job(
            JobSpec::new("export")
                .with_area("timesheets")
                .with_user(9)
                .with_queue_strategy(QueueStrategy::PerQueueAndUser)
                .with_timeout_secs(120),
        );

        let info = JobInfo::from(&job);

        assert_eq!(info.id, JobId(4));
        assert_eq!(info.area.as_deref(), Some("timesheets"));
        assert_eq!(info.status, JobStatus::Created);
        assert!(info.started_at.is_none());
        assert!(info.running_for.is_none());
        assert_eq!(info.timeout_ms, Some(120_000));
    }

    #[test]
    fn test_sub_second_timeout_is_kept() {
        let job = job(JobSpec::new("export").with_timeout(std::time::Duration::from_millis(250)));

        let info = JobInfo::from(&job);

        assert_eq!(info.timeout_ms, Some(250));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["timeout_ms"], 250);
    }

    #[test]
    fn test_running_for_stops_at_termination() {
        let job = job(JobSpec::new("import"));
        job.start();
        job.fail(JobError::ExecutionFailed("bad row".to_string()));

        let later = job.terminated_time().unwrap() + chrono::Duration::hours(2);
        let info = JobInfo::from_job(&job, later);

        assert_eq!(info.running_for.as_deref(), Some("00:00s"));
        assert_eq!(info.error_message.as_deref(), Some("Execution failed: bad row"));
    }

    #[test]
    fn test_running_for_uses_now_while_running() {
        let job = job(JobSpec::new("import"));
        job.start();

        let now = job.start_time().unwrap() + chrono::Duration::seconds(75);
        let info = JobInfo::from_job(&job, now);

        assert_eq!(info.running_for.as_deref(), Some("01:15s"));
        assert!(info.terminated_at.is_none());
    }

    #[test]
    fn test_info_serializes_lower_case_names() {
        let job = job(JobSpec::new("export").with_queue_strategy(QueueStrategy::PerQueue));

        let json = serde_json::to_value(JobInfo::from(&job)).unwrap();

        assert_eq!(json["id"], 4);
        assert_eq!(json["status"], "created");
        assert_eq!(json["queue_strategy"], "per_queue");
        assert!(json["cancel_reason"].is_null());
    }
}
