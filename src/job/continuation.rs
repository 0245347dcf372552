/// Continuation jobs: re-enter a WAITING activity instance

use crate::job::{JobController, JobError, JobOutcome, JobType};
use async_trait::async_trait;

/// Fires when a timer activity's delay has elapsed
pub const TIMER: &str = "timer";

/// Re-executes an activity instance whose execution failed
pub const ACTIVITY_RETRY: &str = "activity-retry";

#[derive(Debug, Default)]
pub struct TimerJob;

#[async_trait]
impl JobType for TimerJob {
    fn type_name(&self) -> &'static str {
        TIMER
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError> {
        controller.continue_activity()?;
        Ok(JobOutcome::Done)
    }
}

/// A failure of the re-executed activity fails this job, so the job's own
/// retry count and backoff apply
#[derive(Debug, Default)]
pub struct ActivityRetryJob;

#[async_trait]
impl JobType for ActivityRetryJob {
    fn type_name(&self) -> &'static str {
        ACTIVITY_RETRY
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError> {
        controller.retry_activity()?;
        Ok(JobOutcome::Done)
    }
}
