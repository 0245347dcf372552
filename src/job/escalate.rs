/// task-escalate: reassign an open task to the escalation target
///
/// The target binding is resolved against the owning activity instance's scope
/// chain and the task is reassigned by the system actor, exactly once.

use crate::actor::Actor;
use crate::job::{JobController, JobError, JobOutcome, JobType};
use crate::services::TaskQuery;
use crate::workflow::binding::Binding;
use crate::workflow::ids::{TaskId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TASK_ESCALATE: &str = "task-escalate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationData {
    pub task_id: TaskId,
    pub to: Binding<String>,
}

#[derive(Debug, Default)]
pub struct TaskEscalateJob;

#[async_trait]
impl JobType for TaskEscalateJob {
    fn type_name(&self) -> &'static str {
        TASK_ESCALATE
    }

    async fn execute(&self, controller: &mut JobController<'_>) -> Result<JobOutcome, JobError> {
        let data: EscalationData = controller.job().data_as()?;
        let services = controller.services().clone();

        let open = services
            .tasks
            .find_tasks(&TaskQuery::by_id(&data.task_id))
            .await?
            .into_iter()
            .any(|task| task.is_open());
        if !open {
            tracing::debug!("📭 Task {} is not open, escalation dropped", data.task_id);
            return Ok(JobOutcome::Done);
        }

        let target = match controller.resolve(&data.to)? {
            Value::String(user) => UserId::new(user),
            other => {
                return Err(JobError::fatal(format!(
                    "escalation target must be a user id string, got {}",
                    other
                )))
            }
        };

        services
            .tasks
            .assign_task(&data.task_id, &target, &Actor::System)
            .await?;
        controller.update_task_assignee(&target)?;

        tracing::info!("⬆️ Task {} escalated to {}", data.task_id, target);
        Ok(JobOutcome::Done)
    }
}
