/// task-reminder: notify the assignee of a task that is still open
///
/// With `repeat_secs` the reminder reschedules itself until the task is
/// completed; without it the job is done after one notification.

use crate::job::{due_in, JobController, JobError, JobOutcome, JobType};
use crate::services::TaskQuery;
use crate::workflow::ids::TaskId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const TASK_REMINDER: &str = "task-reminder";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderData {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_secs: Option<u64>,
}

#[derive(Debug, Default)]
pub struct TaskReminderJob;

#[async_trait]
impl JobType for TaskReminderJob {
    fn type_name(&self) -> &'static str {
        TASK_REMINDER
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError> {
        let data: ReminderData = controller.job().data_as()?;
        let services = controller.services().clone();

        let task = services
            .tasks
            .find_tasks(&TaskQuery::by_id(&data.task_id))
            .await?
            .into_iter()
            .next();

        let task = match task {
            Some(task) if task.is_open() => task,
            Some(_) => {
                tracing::debug!("📭 Task {} already completed, reminder dropped", data.task_id);
                return Ok(JobOutcome::Done);
            }
            None => {
                tracing::warn!("⚠️ Task {} not found, reminder dropped", data.task_id);
                return Ok(JobOutcome::Done);
            }
        };

        services.notifications.task_reminder(&task).await;

        match data.repeat_secs {
            Some(secs) => {
                let next = due_in(controller.now(), secs)
                    .ok_or_else(|| JobError::fatal(format!("reminder repeat of {} seconds is out of range", secs)))?;
                Ok(JobOutcome::Reschedule(next))
            }
            None => Ok(JobOutcome::Done),
        }
    }
}
