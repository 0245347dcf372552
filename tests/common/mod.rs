#![allow(dead_code)]

use async_trait::async_trait;
use mechaflow::actor::Actor;
use mechaflow::config::SchedulerConfig;
use mechaflow::error::ServiceError;
use mechaflow::job::RetryPolicy;
use mechaflow::runtime::{ActivityInstance, EngineContext, ExecutionEngine, JobSchedulerService, WorkflowInstance};
use mechaflow::services::{InMemoryTaskService, NotificationService, Services, Task, TaskQuery, TaskService};
use mechaflow::store::{MemoryStore, PersistenceStore};
use mechaflow::workflow::ids::{ActivityId, ActivityInstanceId, TaskId, UserId, VariableId, WorkflowId};
use mechaflow::workflow::{Capabilities, Variables, WorkflowRegistry};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Task service recording reassignments and optionally failing the first creates
#[derive(Default)]
pub struct RecordingTaskService {
    pub inner: InMemoryTaskService,
    pub assignments: Mutex<Vec<(TaskId, UserId, Actor)>>,
    pub failing_creates: AtomicUsize,
}

#[async_trait]
impl TaskService for RecordingTaskService {
    async fn create_task(&self, task: Task) -> Result<Task, ServiceError> {
        let remaining = self.failing_creates.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_creates.store(remaining - 1, Ordering::SeqCst);
            return Err(ServiceError::Unavailable("task backend offline".into()));
        }
        self.inner.create_task(task).await
    }

    async fn find_tasks(&self, query: &TaskQuery) -> Result<Vec<Task>, ServiceError> {
        self.inner.find_tasks(query).await
    }

    async fn assign_task(&self, task_id: &TaskId, user: &UserId, actor: &Actor) -> Result<Task, ServiceError> {
        self.assignments
            .lock()
            .unwrap()
            .push((task_id.clone(), user.clone(), actor.clone()));
        self.inner.assign_task(task_id, user, actor).await
    }

    async fn complete_task(&self, task_id: &TaskId, actor: &Actor) -> Result<Task, ServiceError> {
        self.inner.complete_task(task_id, actor).await
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    pub reminders: Mutex<Vec<TaskId>>,
}

#[async_trait]
impl NotificationService for RecordingNotifications {
    async fn task_reminder(&self, task: &Task) {
        self.reminders.lock().unwrap().push(task.id.clone());
    }
}

pub struct Harness {
    pub engine: ExecutionEngine,
    pub scheduler: JobSchedulerService,
    pub store: Arc<dyn PersistenceStore>,
    pub tasks: Arc<RecordingTaskService>,
    pub notifications: Arc<RecordingNotifications>,
}

impl Harness {
    pub async fn deploy(&self, definition: Value) {
        self.engine
            .deploy(&serde_json::from_value(definition).unwrap())
            .await
            .unwrap();
    }

    pub async fn start(&self, workflow: &str, input: Value) -> WorkflowInstance {
        self.engine
            .start(&WorkflowId::new(workflow), vars(input), &Actor::System)
            .await
            .unwrap()
    }

    pub async fn task_of(&self, instance: &WorkflowInstance) -> Task {
        let ai = instance
            .activity_instances
            .values()
            .find(|ai| ai.task.is_some())
            .unwrap();
        let task_id = &ai.task.as_ref().unwrap().id;
        self.tasks.inner.get(task_id).await.unwrap()
    }
}

pub fn make_harness() -> Harness {
    make_harness_with(Capabilities::builtin(), RetryPolicy::default())
}

pub fn make_harness_with(capabilities: Capabilities, retry: RetryPolicy) -> Harness {
    make_harness_on(Arc::new(MemoryStore::new()), capabilities, retry)
}

pub fn make_harness_on(store: Arc<dyn PersistenceStore>, capabilities: Capabilities, retry: RetryPolicy) -> Harness {
    let registry = Arc::new(WorkflowRegistry::new(capabilities));
    let tasks = Arc::new(RecordingTaskService::default());
    let notifications = Arc::new(RecordingNotifications::default());
    let context = EngineContext::new(store.clone(), registry)
        .with_services(Services::new(tasks.clone(), notifications.clone()))
        .with_retry_policy(retry);

    let scheduler = JobSchedulerService::new(
        context.clone(),
        SchedulerConfig {
            poll_interval_ms: 10,
            workers: 4,
            batch_size: 16,
            lease_secs: 60,
        },
    );

    Harness {
        engine: ExecutionEngine::new(context),
        scheduler,
        store,
        tasks,
        notifications,
    }
}

pub fn var(id: &str) -> VariableId {
    VariableId::new(id)
}

/// Variables from a JSON object
pub fn vars(input: Value) -> Variables {
    match input {
        Value::Object(map) => map.into_iter().map(|(k, v)| (VariableId::new(k), v)).collect(),
        _ => Variables::new(),
    }
}

/// The single non-join WAITING activity instance of an activity
pub fn waiting(instance: &WorkflowInstance, activity: &str) -> ActivityInstanceId {
    let matching: Vec<&ActivityInstance> = instance
        .waiting_activity_instances()
        .into_iter()
        .filter(|ai| ai.activity_id == ActivityId::new(activity))
        .collect();
    assert_eq!(matching.len(), 1, "expected one waiting '{}'", activity);
    matching[0].id.clone()
}

pub fn count_of(instance: &WorkflowInstance, activity: &str) -> usize {
    instance
        .activity_instances
        .values()
        .filter(|ai| ai.activity_id == ActivityId::new(activity))
        .count()
}
