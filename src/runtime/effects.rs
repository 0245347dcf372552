/// Side effects collected while an instance is being executed
///
/// Jobs are committed atomically with the instance. Task effects are applied to
/// the task service after the commit; a failed application is retried through a
/// `task-sync` job.

use crate::actor::Actor;
use crate::error::ServiceError;
use crate::job::Job;
use crate::services::{Task, TaskService};
use crate::workflow::ids::TaskId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TaskEffect {
    Create { task: Task },
    Complete { task_id: TaskId, actor: Actor },
}

impl TaskEffect {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskEffect::Create { task } => &task.id,
            TaskEffect::Complete { task_id, .. } => task_id,
        }
    }

    /// Apply the effect; both actions are idempotent on the service side
    pub async fn apply(&self, tasks: &dyn TaskService) -> Result<(), ServiceError> {
        match self {
            TaskEffect::Create { task } => tasks.create_task(task.clone()).await.map(|_| ()),
            TaskEffect::Complete { task_id, actor } => {
                tasks.complete_task(task_id, actor).await.map(|_| ())
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Effects {
    /// Jobs to insert with the instance commit
    pub jobs: Vec<Job>,
    /// Task service calls to run after the commit
    pub tasks: Vec<TaskEffect>,
}
