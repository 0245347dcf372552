/// Execution engine: the public entry point for deploying and driving workflows
///
/// Every operation on an existing instance follows the same cycle:
/// 1. lock the instance with a fresh claim (contention → ConcurrentModification)
/// 2. run the instance executor synchronously on the locked copy
/// 3. commit the instance, new jobs and job deletions atomically
/// 4. apply task effects to the task service
///
/// A failing step releases the claim and leaves the stored instance untouched.

use crate::actor::Actor;
use crate::error::EngineError;
use crate::job::Job;
use crate::runtime::context::EngineContext;
use crate::runtime::effects::Effects;
use crate::runtime::executor::InstanceExecutor;
use crate::runtime::instance::WorkflowInstance;
use crate::store::{ClaimToken, Commit};
use crate::workflow::ids::{ActivityInstanceId, InstanceId, WorkflowId};
use crate::workflow::model::{Variables, Workflow};
use crate::workflow::parser;
use crate::workflow::types::WorkflowSource;
use chrono::Utc;
use std::sync::Arc;

#[derive(Clone)]
pub struct ExecutionEngine {
    context: EngineContext,
}

impl ExecutionEngine {
    pub fn new(context: EngineContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Parse, persist and publish a workflow source
    pub async fn deploy(&self, source: &WorkflowSource) -> Result<Arc<Workflow>, EngineError> {
        // validate before persisting so an invalid source never reaches the store
        parser::parse(source, self.context.workflows.capabilities())?;
        self.context.store.save_workflow_source(source).await?;
        Ok(self.context.workflows.deploy(source)?)
    }

    pub async fn deploy_json(&self, json: &str) -> Result<Arc<Workflow>, EngineError> {
        let source = parser::parse_source(json)?;
        self.deploy(&source).await
    }

    /// Create and run a new instance. The returned instance may already be ENDED.
    pub async fn start(
        &self,
        workflow_id: &WorkflowId,
        input: Variables,
        actor: &Actor,
    ) -> Result<WorkflowInstance, EngineError> {
        let workflow = self.workflow(workflow_id)?;
        let now = Utc::now();

        let mut instance = WorkflowInstance::new(workflow.id.clone(), actor.clone(), now);
        let effects = InstanceExecutor::new(&workflow, &mut instance, actor, now).start(input)?;

        let Effects { jobs, tasks } = effects;
        self.context
            .store
            .commit(Commit::insert(instance.clone()).with_jobs(jobs))
            .await?;

        if !tasks.is_empty() {
            self.context.apply_task_effects(&instance.id, tasks, now).await?;
        }
        tracing::info!(
            "📋 Instance {} of {} is {}",
            instance.id, workflow.id, instance.state.as_str()
        );
        Ok(instance)
    }

    /// Deliver an external signal to a WAITING activity instance
    pub async fn signal(
        &self,
        instance_id: &InstanceId,
        activity_instance_id: &ActivityInstanceId,
        input: Variables,
        actor: &Actor,
    ) -> Result<WorkflowInstance, EngineError> {
        self.locked(instance_id, actor, false, |executor| {
            executor.signal(activity_instance_id, input)
        })
        .await
    }

    /// Abort every live activity instance, end the instance as cancelled and
    /// delete its pending jobs
    pub async fn cancel(&self, instance_id: &InstanceId, actor: &Actor) -> Result<WorkflowInstance, EngineError> {
        self.locked(instance_id, actor, true, |executor| executor.cancel())
            .await
    }

    pub async fn load_instance(&self, instance_id: &InstanceId) -> Result<WorkflowInstance, EngineError> {
        Ok(self.context.store.load_instance(instance_id).await?)
    }

    /// Stored jobs of an instance, dead ones included
    pub async fn jobs_for_instance(&self, instance_id: &InstanceId) -> Result<Vec<Job>, EngineError> {
        Ok(self.context.store.jobs_for_instance(instance_id).await?)
    }

    fn workflow(&self, workflow_id: &WorkflowId) -> Result<Arc<Workflow>, EngineError> {
        self.context
            .workflows
            .get(workflow_id)
            .ok_or_else(|| EngineError::UnknownWorkflow(workflow_id.clone()))
    }

    async fn locked<F>(
        &self,
        instance_id: &InstanceId,
        actor: &Actor,
        cancel_jobs: bool,
        run: F,
    ) -> Result<WorkflowInstance, EngineError>
    where
        F: FnOnce(InstanceExecutor<'_>) -> Result<Effects, EngineError>,
    {
        let store = &self.context.store;
        let now = Utc::now();
        let token = ClaimToken::new();

        let mut instance = store
            .lock_instance(instance_id, &token, now, now + self.context.lease)
            .await
            .map_err(|e| {
                let e = EngineError::from(e);
                if e.is_concurrent_modification() {
                    tracing::debug!("🔒 {}", e);
                }
                e
            })?;

        let result = self
            .workflow(&instance.workflow_id)
            .and_then(|workflow| run(InstanceExecutor::new(&workflow, &mut instance, actor, now)));
        let Effects { jobs, tasks } = match result {
            Ok(effects) => effects,
            Err(e) => {
                store.unlock_instance(instance_id, &token).await?;
                return Err(e);
            }
        };

        let mut commit = Commit::update(instance.clone(), token.clone()).with_jobs(jobs);
        if cancel_jobs {
            commit = commit.cancelling_jobs_of(instance.id.clone());
        }
        if let Err(e) = store.commit(commit).await {
            store.unlock_instance(instance_id, &token).await?;
            return Err(e.into());
        }
        instance.version += 1;

        if !tasks.is_empty() {
            self.context.apply_task_effects(&instance.id, tasks, now).await?;
        }
        Ok(instance)
    }
}
