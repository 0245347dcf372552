/// Human task collaborator
///
/// The engine creates, completes and reassigns tasks through `TaskService`.
/// `InMemoryTaskService` is the reference implementation used for embedding and
/// tests.

use crate::actor::Actor;
use crate::error::ServiceError;
use crate::workflow::ids::{ActivityInstanceId, InstanceId, TaskId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub instance_id: Option<InstanceId>,
    pub activity_instance_id: Option<ActivityInstanceId>,
    pub assignee: Option<UserId>,
    #[serde(default)]
    pub candidates: Vec<UserId>,
    #[serde(default)]
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_open(&self) -> bool {
        !self.completed
    }
}

/// Filter for `find_tasks`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub id: Option<TaskId>,
    pub instance_id: Option<InstanceId>,
    pub assignee: Option<UserId>,
    pub open_only: bool,
}

impl TaskQuery {
    pub fn by_id(id: &TaskId) -> Self {
        Self { id: Some(id.clone()), ..Self::default() }
    }

    pub fn for_instance(id: &InstanceId) -> Self {
        Self { instance_id: Some(id.clone()), ..Self::default() }
    }

    pub fn assigned_to(user: &UserId) -> Self {
        Self { assignee: Some(user.clone()), ..Self::default() }
    }

    pub fn open(mut self) -> Self {
        self.open_only = true;
        self
    }

    fn matches(&self, task: &Task) -> bool {
        self.id.as_ref().map_or(true, |id| &task.id == id)
            && self.instance_id.as_ref().map_or(true, |id| task.instance_id.as_ref() == Some(id))
            && self.assignee.as_ref().map_or(true, |u| task.assignee.as_ref() == Some(u))
            && (!self.open_only || task.is_open())
    }
}

#[async_trait]
pub trait TaskService: Send + Sync {
    /// Create a task; creating an existing id returns the stored task unchanged
    async fn create_task(&self, task: Task) -> Result<Task, ServiceError>;

    async fn find_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ServiceError>;

    async fn assign_task(
        &self,
        task_id: &TaskId,
        user: &UserId,
        actor: &Actor,
    ) -> Result<Task, ServiceError>;

    /// Complete a task; completing a completed task is a no-op
    async fn complete_task(&self, task_id: &TaskId, actor: &Actor) -> Result<Task, ServiceError>;
}

/// Task store kept in process memory
///
/// The system actor bypasses ownership checks; a user may only reassign tasks
/// assigned to them and only complete tasks assigned to them (or unassigned
/// tasks they are a candidate for).
#[derive(Debug, Default)]
pub struct InMemoryTaskService {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
}

impl InMemoryTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.lock().await.get(task_id).cloned()
    }
}

#[async_trait]
impl TaskService for InMemoryTaskService {
    async fn create_task(&self, task: Task) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let stored = tasks.entry(task.id.clone()).or_insert(task);
        tracing::debug!("📝 Task {} stored (assignee: {:?})", stored.id, stored.assignee);
        Ok(stored.clone())
    }

    async fn find_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ServiceError> {
        let tasks = self.tasks.lock().await;
        Ok(tasks.values().filter(|t| query.matches(t)).cloned().collect())
    }

    async fn assign_task(
        &self,
        task_id: &TaskId,
        user: &UserId,
        actor: &Actor,
    ) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))?;

        if task.completed {
            return Err(ServiceError::Conflict(format!(
                "task '{}' is already completed",
                task_id
            )));
        }
        if let Actor::User(caller) = actor {
            if task.assignee.as_ref() != Some(caller) {
                return Err(ServiceError::Unauthorized {
                    actor: actor.clone(),
                    action: format!("reassign task '{}'", task_id),
                });
            }
        }

        task.assignee = Some(user.clone());
        tracing::info!("👤 Task {} assigned to {} by {}", task_id, user, actor);
        Ok(task.clone())
    }

    async fn complete_task(&self, task_id: &TaskId, actor: &Actor) -> Result<Task, ServiceError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| ServiceError::TaskNotFound(task_id.to_string()))?;

        if task.completed {
            return Ok(task.clone());
        }
        if let Actor::User(caller) = actor {
            let allowed = match &task.assignee {
                Some(assignee) => assignee == caller,
                None => task.candidates.is_empty() || task.candidates.contains(caller),
            };
            if !allowed {
                return Err(ServiceError::Unauthorized {
                    actor: actor.clone(),
                    action: format!("complete task '{}'", task_id),
                });
            }
        }

        task.completed = true;
        task.completed_at = Some(Utc::now());
        tracing::info!("✅ Task {} completed by {}", task_id, actor);
        Ok(task.clone())
    }
}
