/// task-sync: re-apply task service calls that failed after their commit
///
/// The job carries the effects in order and re-applies all of them; create and
/// complete are idempotent on the service side, so effects that did succeed
/// earlier are harmless to repeat.

use crate::error::ServiceError;
use crate::job::{Job, JobController, JobError, JobOutcome, JobType};
use crate::runtime::effects::TaskEffect;
use crate::workflow::ids::InstanceId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const TASK_SYNC: &str = "task-sync";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSyncData {
    pub effects: Vec<TaskEffect>,
}

/// Job re-applying `effects` for an instance, due immediately
pub fn job_for(
    instance_id: &InstanceId,
    effects: Vec<TaskEffect>,
    now: DateTime<Utc>,
) -> Result<Job, serde_json::Error> {
    let data = serde_json::to_value(TaskSyncData { effects })?;
    Ok(Job::new(TASK_SYNC, data, now).for_instance(instance_id))
}

#[derive(Debug, Default)]
pub struct TaskSyncJob;

#[async_trait]
impl JobType for TaskSyncJob {
    fn type_name(&self) -> &'static str {
        TASK_SYNC
    }

    /// The final task completion of an instance is synced after the instance ended
    fn needs_live_target(&self) -> bool {
        false
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError> {
        let data: TaskSyncData = controller.job().data_as()?;
        let tasks = controller.services().tasks.clone();

        for effect in &data.effects {
            effect.apply(tasks.as_ref()).await.map_err(|e| match e {
                // an earlier create may still be pending in another sync job
                ServiceError::TaskNotFound(_) => JobError::retryable(e.to_string()),
                other => JobError::from(other),
            })?;
        }
        tracing::debug!("🔄 Synced {} task effect(s) for job {}", data.effects.len(), controller.job().id);
        Ok(JobOutcome::Done)
    }
}
