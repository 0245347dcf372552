/// Handle given to activity behavior
///
/// Exposes binding resolution, transition control, variable writes, job
/// scheduling and task creation for one activity instance. Side effects are
/// collected and applied by the engine when the surrounding operation commits.

use crate::actor::Actor;
use crate::job::Job;
use crate::runtime::effects::{Effects, TaskEffect};
use crate::runtime::instance::{TaskRef, WorkflowInstance};
use crate::runtime::resolver::{self, BindingError};
use crate::services::Task;
use crate::workflow::binding::Binding;
use crate::workflow::ids::{ActivityInstanceId, InstanceId, JobId, TaskId, UserId, VariableId};
use crate::workflow::model::{Activity, Scope, Transition, Variables};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub struct ActivityContext<'a> {
    pub(crate) activity: &'a Activity,
    /// Scope the activity is declared in
    pub(crate) scope: &'a Scope,
    pub(crate) instance: &'a mut WorkflowInstance,
    pub(crate) activity_instance_id: &'a ActivityInstanceId,
    pub(crate) effects: &'a mut Effects,
    pub(crate) actor: &'a Actor,
    pub(crate) now: DateTime<Utc>,
}

impl<'a> ActivityContext<'a> {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance.id
    }

    pub fn activity_instance_id(&self) -> &ActivityInstanceId {
        self.activity_instance_id
    }

    pub fn activity(&self) -> &'a Activity {
        self.activity
    }

    /// Actor performing the current operation
    pub fn actor(&self) -> &Actor {
        self.actor
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn resolve<T: Serialize>(&self, binding: &Binding<T>) -> Result<Value, BindingError> {
        resolver::resolve(binding, &self.instance.scope_chain(self.activity_instance_id))
    }

    pub fn resolve_one<T>(&self, binding: &Binding<T>) -> Result<T, BindingError>
    where
        T: Serialize + DeserializeOwned,
    {
        resolver::resolve_one(binding, &self.instance.scope_chain(self.activity_instance_id))
    }

    pub fn resolve_all<T>(&self, binding: &Binding<T>) -> Result<Vec<T>, BindingError>
    where
        T: Serialize + DeserializeOwned,
    {
        resolver::resolve_all(binding, &self.instance.scope_chain(self.activity_instance_id))
    }

    pub fn variable(&self, id: &VariableId) -> Option<&Value> {
        self.instance.variable(self.activity_instance_id, id)
    }

    pub fn set_variable(&mut self, id: VariableId, value: Value) {
        self.instance.set_variable(self.activity_instance_id, id, value);
    }

    pub fn set_variables(&mut self, variables: &Variables) {
        for (id, value) in variables {
            self.set_variable(id.clone(), value.clone());
        }
    }

    /// Outgoing transitions in declaration order
    pub fn outgoing(&self) -> Vec<&'a Transition> {
        let scope = self.scope;
        self.activity
            .outgoing
            .iter()
            .filter_map(|id| scope.transition(id))
            .collect()
    }

    /// Whether a transition's condition holds; unconditional transitions always do
    pub fn condition_holds(&self, transition: &Transition) -> Result<bool, BindingError> {
        match &transition.condition {
            Some(condition) => {
                resolver::evaluate(condition, &self.instance.scope_chain(self.activity_instance_id))
            }
            None => Ok(true),
        }
    }

    /// Schedule a job bound to this activity instance
    pub fn schedule_job(&mut self, job_type: &str, data: Value, due_at: DateTime<Utc>) -> JobId {
        let job = Job::new(job_type, data, due_at)
            .for_activity(&self.instance.id, self.activity_instance_id);
        let id = job.id.clone();
        tracing::debug!(
            "⏳ Scheduling {} job {} for activity instance {} due {}",
            job_type, id, self.activity_instance_id, due_at
        );
        self.effects.jobs.push(job);
        id
    }

    /// Create a task linked to this activity instance
    pub fn create_task(&mut self, name: String, assignee: Option<UserId>, candidates: Vec<UserId>) -> TaskId {
        let task = Task {
            id: TaskId::generate(),
            name,
            instance_id: Some(self.instance.id.clone()),
            activity_instance_id: Some(self.activity_instance_id.clone()),
            assignee: assignee.clone(),
            candidates,
            completed: false,
            created_at: self.now,
            completed_at: None,
        };
        let id = task.id.clone();

        if let Some(ai) = self.instance.activity_instance_mut(self.activity_instance_id) {
            ai.task = Some(TaskRef { id: id.clone(), assignee });
        }
        self.effects.tasks.push(TaskEffect::Create { task });
        id
    }

    /// Task linked to this activity instance
    pub fn task(&self) -> Option<&TaskRef> {
        self.instance
            .activity_instance(self.activity_instance_id)
            .and_then(|ai| ai.task.as_ref())
    }

    /// Complete the linked task as the current actor
    pub fn complete_task(&mut self, task_id: &TaskId) {
        self.effects.tasks.push(TaskEffect::Complete {
            task_id: task_id.clone(),
            actor: self.actor.clone(),
        });
    }
}
