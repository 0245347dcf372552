/// Handle passed to `JobType::execute`
///
/// Gives a job access to its record, the injected services, the claimed
/// instance it belongs to and re-entry into the instance executor. Changes to
/// the claimed instance are collected here and committed by the runner together
/// with the job result.

use crate::actor::Actor;
use crate::error::EngineError;
use crate::job::{Job, JobError};
use crate::runtime::context::EngineContext;
use crate::runtime::effects::Effects;
use crate::runtime::executor::InstanceExecutor;
use crate::runtime::instance::{ActivityInstance, WorkflowInstance};
use crate::runtime::resolver;
use crate::services::Services;
use crate::workflow::binding::Binding;
use crate::workflow::ids::{ActivityInstanceId, InstanceId, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub struct JobController<'a> {
    job: &'a Job,
    context: &'a EngineContext,
    instance: Option<WorkflowInstance>,
    now: DateTime<Utc>,
    effects: Effects,
    modified: bool,
}

impl<'a> JobController<'a> {
    pub(crate) fn new(
        job: &'a Job,
        context: &'a EngineContext,
        instance: Option<WorkflowInstance>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job,
            context,
            instance,
            now,
            effects: Effects::default(),
            modified: false,
        }
    }

    pub fn job(&self) -> &Job {
        self.job
    }

    pub fn services(&self) -> &Services {
        &self.context.services
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// The claimed instance the job belongs to
    pub fn instance(&self) -> Result<&WorkflowInstance, JobError> {
        self.instance
            .as_ref()
            .ok_or_else(|| JobError::fatal(format!("job '{}' is not bound to an instance", self.job.id)))
    }

    /// The activity instance the job targets
    pub fn activity_instance(&self) -> Result<&ActivityInstance, JobError> {
        let id = self.target()?;
        self.instance()?
            .activity_instance(id)
            .ok_or_else(|| JobError::fatal(format!("activity instance '{}' not found", id)))
    }

    /// Read-only snapshot of any instance
    pub async fn load_instance(&self, id: &InstanceId) -> Result<WorkflowInstance, JobError> {
        self.context
            .store
            .load_instance(id)
            .await
            .map_err(|e| JobError::from(EngineError::from(e)))
    }

    /// Resolve a binding against the target activity instance's scope chain
    pub fn resolve<T: Serialize>(&self, binding: &Binding<T>) -> Result<Value, JobError> {
        let id = self.target()?;
        let chain = self.instance()?.scope_chain(id);
        Ok(resolver::resolve(binding, &chain)?)
    }

    /// Resume the WAITING target activity instance through `ActivityType::on_job`
    pub fn continue_activity(&mut self) -> Result<(), JobError> {
        self.reenter(|executor, id| executor.continue_waiting(id))
    }

    /// Re-execute the failed target activity instance
    pub fn retry_activity(&mut self) -> Result<(), JobError> {
        self.reenter(|executor, id| executor.retry(id))
    }

    /// Record a task reassignment on the target activity instance
    pub fn update_task_assignee(&mut self, user: &UserId) -> Result<(), JobError> {
        let id = self.target()?.clone();
        let ai = self
            .instance
            .as_mut()
            .and_then(|instance| instance.activity_instance_mut(&id))
            .ok_or_else(|| JobError::fatal(format!("activity instance '{}' not found", id)))?;
        if let Some(task) = ai.task.as_mut() {
            task.assignee = Some(user.clone());
            self.modified = true;
        }
        Ok(())
    }

    fn reenter<F>(&mut self, run: F) -> Result<(), JobError>
    where
        F: FnOnce(InstanceExecutor<'_>, &ActivityInstanceId) -> Result<Effects, EngineError>,
    {
        let id = self.target()?.clone();
        let instance = self
            .instance
            .as_mut()
            .ok_or_else(|| JobError::fatal(format!("job '{}' is not bound to an instance", self.job.id)))?;
        let workflow = self
            .context
            .workflows
            .get(&instance.workflow_id)
            .ok_or_else(|| JobError::from(EngineError::UnknownWorkflow(instance.workflow_id.clone())))?;

        let actor = Actor::System;
        let executor = InstanceExecutor::new(&workflow, instance, &actor, self.now);
        let effects = run(executor, &id)?;

        self.effects.jobs.extend(effects.jobs);
        self.effects.tasks.extend(effects.tasks);
        self.modified = true;
        Ok(())
    }

    fn target(&self) -> Result<&ActivityInstanceId, JobError> {
        self.job
            .activity_instance_id
            .as_ref()
            .ok_or_else(|| JobError::fatal(format!("job '{}' has no target activity instance", self.job.id)))
    }

    /// Instance (if changed) and effects to commit with the job result
    pub(crate) fn into_parts(self) -> (Option<WorkflowInstance>, bool, Effects) {
        (self.instance, self.modified, self.effects)
    }
}
