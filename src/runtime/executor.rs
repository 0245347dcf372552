/// Instance executor: the activity/scope state machine
///
/// Walks the definition model against one claimed `WorkflowInstance`. Work is
/// processed through a FIFO queue so a run is deterministic: start activities
/// in declaration order, then every spawned activity instance in the order its
/// transition was taken. The executor never touches the store; it returns the
/// collected `Effects` for the engine to commit atomically with the instance.

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};
use crate::actor::Actor;
use crate::error::{
    ActivityExecutionError, ClaimTarget, ConcurrentModificationError, EngineError,
    UnresolvedVariableError,
};
use crate::job::continuation::ACTIVITY_RETRY;
use crate::job::Job;
use crate::runtime::effects::Effects;
use crate::runtime::instance::{
    ActivityInstance, ActivityState, EndReason, EventKind, InstanceState, JoinState,
    WorkflowInstance,
};
use crate::runtime::resolver::{self, BindingError};
use crate::workflow::ids::{ActivityInstanceId, TransitionId};
use crate::workflow::model::{Activity, Scope, Variables, Workflow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;

pub struct InstanceExecutor<'w> {
    workflow: &'w Workflow,
    instance: &'w mut WorkflowInstance,
    actor: &'w Actor,
    now: DateTime<Utc>,
    effects: Effects,
    queue: VecDeque<ActivityInstanceId>,
    /// Re-entered activity instance whose failure goes back to the caller
    propagate_failure_of: Option<ActivityInstanceId>,
}

impl<'w> InstanceExecutor<'w> {
    pub fn new(
        workflow: &'w Workflow,
        instance: &'w mut WorkflowInstance,
        actor: &'w Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            workflow,
            instance,
            actor,
            now,
            effects: Effects::default(),
            queue: VecDeque::new(),
            propagate_failure_of: None,
        }
    }

    /// Start a CREATED instance: initialise variables, bind trigger input and
    /// run the start activities of the root scope
    pub fn start(mut self, trigger_input: Variables) -> Result<Effects, EngineError> {
        if self.instance.state != InstanceState::Created {
            return Err(self.invalid_state("instance was already started"));
        }

        let input = match &self.workflow.trigger {
            Some(trigger) => trigger
                .trigger_type
                .apply(trigger_input)
                .map_err(|message| EngineError::InvalidInput {
                    instance_id: self.instance.id.clone(),
                    message,
                })?,
            None => trigger_input,
        };

        self.instance.variables = self.workflow.scope.initial_variables();
        self.instance.variables.extend(input);
        self.instance.state = InstanceState::Active;
        self.instance.started_at = Some(self.now);
        self.instance.record(EventKind::InstanceStarted, None, Some(self.actor), None, self.now);
        tracing::info!(
            "🚀 Starting instance {} of workflow {} as {}",
            self.instance.id, self.workflow.id, self.actor
        );

        self.start_scope(None)?;
        self.run()?;
        Ok(self.effects)
    }

    /// Resume a WAITING activity instance from an external signal
    pub fn signal(mut self, id: &ActivityInstanceId, input: Variables) -> Result<Effects, EngineError> {
        let ai = self.activity_instance(id)?;
        if ai.is_joining() {
            return Err(self.invalid_state(format!("activity instance '{}' is a join and cannot be signalled", id)));
        }
        if ai.state != ActivityState::Waiting {
            return Err(ConcurrentModificationError {
                target: ClaimTarget::Instance(self.instance.id.clone()),
                reason: format!("activity instance '{}' is no longer waiting", id),
            }
            .into());
        }
        if ai.last_error.is_some() {
            return Err(self.invalid_state(format!("activity instance '{}' is awaiting retry", id)));
        }
        self.ensure_active()?;

        let (activity, scope) = self.definition(id)?;
        self.mark_started(id)?;
        self.instance.record(EventKind::Signalled, Some(id), Some(self.actor), None, self.now);
        tracing::debug!("📨 Signal for {} ({}) in instance {}", id, activity.id, self.instance.id);

        self.propagate_failure_of = Some(id.clone());
        let result = self.invoke(id, activity, scope, |behavior, ctx| behavior.on_signal(ctx, &input));
        self.apply(id, activity, scope, result)?;
        self.propagate_failure_of = None;

        self.run()?;
        Ok(self.effects)
    }

    /// Resume a WAITING activity instance from a continuation job
    pub fn continue_waiting(mut self, id: &ActivityInstanceId) -> Result<Effects, EngineError> {
        self.ensure_active()?;
        let ai = self.activity_instance(id)?;
        if ai.state != ActivityState::Waiting || ai.is_joining() {
            return Err(self.invalid_state(format!("activity instance '{}' is not waiting", id)));
        }

        let (activity, scope) = self.definition(id)?;
        self.mark_started(id)?;

        self.propagate_failure_of = Some(id.clone());
        let result = self.invoke(id, activity, scope, |behavior, ctx| behavior.on_job(ctx));
        self.apply(id, activity, scope, result)?;
        self.propagate_failure_of = None;

        self.run()?;
        Ok(self.effects)
    }

    /// Re-execute an activity instance whose execution failed.
    /// A new failure is returned to the caller instead of scheduling another retry.
    pub fn retry(mut self, id: &ActivityInstanceId) -> Result<Effects, EngineError> {
        self.ensure_active()?;
        let ai = self.activity_instance(id)?;
        if ai.state != ActivityState::Waiting || ai.last_error.is_none() {
            return Err(self.invalid_state(format!("activity instance '{}' is not awaiting retry", id)));
        }

        self.propagate_failure_of = Some(id.clone());
        self.execute(id)?;
        self.propagate_failure_of = None;

        self.run()?;
        Ok(self.effects)
    }

    /// Abort every live activity instance and end the instance as cancelled
    pub fn cancel(mut self) -> Result<Effects, EngineError> {
        if self.instance.is_ended() {
            return Err(self.invalid_state("instance has already ended"));
        }

        let live: Vec<ActivityInstanceId> = self
            .instance
            .live_activity_instances()
            .map(|ai| ai.id.clone())
            .collect();
        let now = self.now;
        for id in &live {
            let ai = self.activity_instance_mut(id)?;
            ai.state = ActivityState::Ended;
            ai.aborted = true;
            ai.ended_at = Some(now);
            self.instance.record(EventKind::ActivityAborted, Some(id), Some(self.actor), None, now);
        }

        self.instance.state = InstanceState::Ended;
        self.instance.end_reason = Some(EndReason::Cancelled);
        self.instance.ended_at = Some(now);
        self.instance.record(EventKind::InstanceCancelled, None, Some(self.actor), None, now);
        tracing::info!(
            "🛑 Cancelled instance {} ({} activity instance(s) aborted) by {}",
            self.instance.id,
            live.len(),
            self.actor
        );
        Ok(self.effects)
    }

    /// End an activity instance, taking every outgoing transition whose
    /// condition holds, and keep executing. Ending an ENDED instance is a no-op.
    pub fn end(&mut self, id: &ActivityInstanceId) -> Result<(), EngineError> {
        if !self.activity_instance(id)?.is_live() {
            return Ok(());
        }
        let (activity, scope) = self.definition(id)?;
        let take = self
            .matching_transitions(id, activity, scope)
            .map_err(|e| self.execution_error(id, activity, &ActivityError::from(e)))?;
        self.end_with(id, take)?;
        self.run()
    }

    /// Effects collected so far
    pub fn into_effects(self) -> Effects {
        self.effects
    }

    fn run(&mut self) -> Result<(), EngineError> {
        while let Some(id) = self.queue.pop_front() {
            if self.instance.state != InstanceState::Active {
                tracing::debug!("⏸️ Instance {} is {}, leaving {} queued", self.instance.id, self.instance.state.as_str(), id);
                break;
            }
            self.execute(&id)?;
        }
        Ok(())
    }

    fn execute(&mut self, id: &ActivityInstanceId) -> Result<(), EngineError> {
        if !self.activity_instance(id)?.is_live() {
            return Ok(());
        }
        let (activity, scope) = self.definition(id)?;
        self.mark_started(id)?;
        tracing::debug!(
            "⚡ Executing {} ({}: {}) in instance {}",
            id, activity.id, activity.type_name, self.instance.id
        );

        let result = self.invoke(id, activity, scope, |behavior, ctx| behavior.execute(ctx));
        self.apply(id, activity, scope, result)
    }

    fn mark_started(&mut self, id: &ActivityInstanceId) -> Result<(), EngineError> {
        let now = self.now;
        let ai = self.activity_instance_mut(id)?;
        ai.state = ActivityState::Started;
        ai.started_at.get_or_insert(now);
        self.instance.record(EventKind::ActivityStarted, Some(id), None, None, now);
        Ok(())
    }

    /// Run activity behavior through a context handle. Effects requested by a
    /// failing invocation are discarded.
    fn invoke<F>(
        &mut self,
        id: &ActivityInstanceId,
        activity: &'w Activity,
        scope: &'w Scope,
        behavior: F,
    ) -> Result<Outcome, ActivityError>
    where
        F: FnOnce(&dyn ActivityType, &mut ActivityContext<'_>) -> Result<Outcome, ActivityError>,
    {
        let jobs_before = self.effects.jobs.len();
        let tasks_before = self.effects.tasks.len();

        let mut ctx = ActivityContext {
            activity,
            scope,
            instance: &mut *self.instance,
            activity_instance_id: id,
            effects: &mut self.effects,
            actor: self.actor,
            now: self.now,
        };
        let result = behavior(activity.activity_type.as_ref(), &mut ctx);

        if result.is_err() {
            self.effects.jobs.truncate(jobs_before);
            self.effects.tasks.truncate(tasks_before);
        }
        result
    }

    fn apply(
        &mut self,
        id: &ActivityInstanceId,
        activity: &'w Activity,
        scope: &'w Scope,
        result: Result<Outcome, ActivityError>,
    ) -> Result<(), EngineError> {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => return self.fail(id, activity, error),
        };
        self.activity_instance_mut(id)?.last_error = None;

        match outcome {
            Outcome::Onwards => match self.matching_transitions(id, activity, scope) {
                Ok(take) => self.end_with(id, take),
                Err(error) => self.fail(id, activity, error.into()),
            },
            Outcome::Take(chosen) => {
                if let Some(unknown) = chosen.iter().find(|t| !activity.outgoing.contains(t)) {
                    return self.fail(id, activity, ActivityError::InvalidTransition(unknown.clone()));
                }
                let take = activity
                    .outgoing
                    .iter()
                    .filter(|t| chosen.contains(t))
                    .cloned()
                    .collect();
                self.end_with(id, take)
            }
            Outcome::Wait => {
                self.activity_instance_mut(id)?.state = ActivityState::Waiting;
                self.instance.record(EventKind::ActivityWaiting, Some(id), None, None, self.now);
                tracing::debug!("⏳ {} ({}) is waiting in instance {}", id, activity.id, self.instance.id);
                Ok(())
            }
            Outcome::EnterScope => {
                if activity.scope.is_none() {
                    return self.fail(
                        id,
                        activity,
                        ActivityError::failed(format!("activity '{}' has no nested scope", activity.id)),
                    );
                }
                self.start_scope(Some(id))
            }
        }
    }

    /// Outgoing transitions whose condition holds, in declaration order
    fn matching_transitions(
        &self,
        id: &ActivityInstanceId,
        activity: &Activity,
        scope: &Scope,
    ) -> Result<Vec<TransitionId>, BindingError> {
        let chain = self.instance.scope_chain(id);
        let mut take = Vec::new();
        for transition_id in &activity.outgoing {
            let Some(transition) = scope.transition(transition_id) else {
                continue;
            };
            let holds = match &transition.condition {
                Some(condition) => resolver::evaluate(condition, &chain)?,
                None => true,
            };
            if holds {
                take.push(transition_id.clone());
            }
        }
        Ok(take)
    }

    fn end_with(&mut self, id: &ActivityInstanceId, take: Vec<TransitionId>) -> Result<(), EngineError> {
        let now = self.now;
        let parent = {
            let ai = self.activity_instance_mut(id)?;
            if !ai.is_live() {
                return Ok(());
            }
            ai.state = ActivityState::Ended;
            ai.ended_at = Some(now);
            ai.parent.clone()
        };
        let detail = (!take.is_empty()).then(|| {
            take.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(",")
        });
        self.instance.record(EventKind::ActivityEnded, Some(id), None, detail, now);

        for transition_id in &take {
            self.take_transition(parent.as_ref(), transition_id)?;
        }
        self.complete_scope(parent)
    }

    fn take_transition(
        &mut self,
        parent: Option<&ActivityInstanceId>,
        transition_id: &TransitionId,
    ) -> Result<(), EngineError> {
        let path = self.instance.scope_path(parent);
        let workflow: &'w Workflow = self.workflow;
        let target = workflow
            .scope_at(&path)
            .and_then(|scope| {
                let transition = scope.transition(transition_id)?;
                scope.activity(&transition.to)
            })
            .ok_or_else(|| self.invalid_state(format!("transition '{}' no longer exists in the definition", transition_id)))?;

        match target.join_threshold() {
            Some(threshold) => self.arrive(parent, target, transition_id, threshold),
            None => {
                let id = self
                    .instance
                    .create_activity_instance(target.id.clone(), parent, self.now);
                self.queue.push_back(id);
                Ok(())
            }
        }
    }

    /// Record a branch arriving at a joining activity
    fn arrive(
        &mut self,
        parent: Option<&ActivityInstanceId>,
        target: &Activity,
        transition_id: &TransitionId,
        threshold: usize,
    ) -> Result<(), EngineError> {
        let now = self.now;

        if let Some(absorbing) = self.instance.absorbing_join(parent, &target.id, target.incoming) {
            if self.instance.live_join(parent, &target.id).is_none() {
                if let Some(join) = self.activity_instance_mut(&absorbing)?.join.as_mut() {
                    join.arrived.push(transition_id.clone());
                }
                self.instance.record(
                    EventKind::JoinArrived,
                    Some(&absorbing),
                    None,
                    Some(transition_id.to_string()),
                    now,
                );
                return Ok(());
            }
        }

        let join_id = match self.instance.live_join(parent, &target.id) {
            Some(id) => id,
            None => {
                let id = self.instance.create_activity_instance(target.id.clone(), parent, now);
                let ai = self.activity_instance_mut(&id)?;
                ai.state = ActivityState::Waiting;
                ai.join = Some(JoinState {
                    threshold,
                    arrived: Vec::new(),
                });
                self.instance.record(EventKind::ActivityWaiting, Some(&id), None, None, now);
                id
            }
        };

        let arrived = {
            let ai = self.activity_instance_mut(&join_id)?;
            let join = ai.join.get_or_insert(JoinState {
                threshold,
                arrived: Vec::new(),
            });
            join.arrived.push(transition_id.clone());
            join.arrived.len()
        };
        self.instance.record(
            EventKind::JoinArrived,
            Some(&join_id),
            None,
            Some(transition_id.to_string()),
            now,
        );
        tracing::debug!(
            "🔀 Join {} ({}) has {}/{} arrival(s)",
            join_id, target.id, arrived, threshold
        );

        // arrivals come from ended branches, and a scope branch only ends once
        // nothing below it is live, so no WAITING descendant can remain here
        if arrived == threshold {
            self.queue.push_back(join_id);
        }
        Ok(())
    }

    /// Start the start activities of a scope (`None` = root scope)
    fn start_scope(&mut self, owner: Option<&ActivityInstanceId>) -> Result<(), EngineError> {
        let path = self.instance.scope_path(owner);
        let workflow: &'w Workflow = self.workflow;
        let scope = match owner {
            Some(_) => workflow.scope_at(&path),
            None => Some(&workflow.scope),
        }
        .ok_or_else(|| self.invalid_state("scope no longer exists in the definition"))?;

        if let Some(owner_id) = owner {
            let variables = scope.initial_variables();
            self.activity_instance_mut(owner_id)?.variables.extend(variables);
        }

        let mut started = 0;
        for activity in scope.start_activities() {
            let id = self
                .instance
                .create_activity_instance(activity.id.clone(), owner, self.now);
            self.queue.push_back(id);
            started += 1;
        }

        if started == 0 {
            return self.complete_scope(owner.cloned());
        }
        Ok(())
    }

    /// End a scope instance once no child is live, continuing outwards
    fn complete_scope(&mut self, owner: Option<ActivityInstanceId>) -> Result<(), EngineError> {
        if self.instance.has_live_children(owner.as_ref()) {
            return Ok(());
        }
        let now = self.now;

        match owner {
            None => {
                if self.instance.is_ended() {
                    return Ok(());
                }
                self.instance.record(EventKind::ScopeEnded, None, None, None, now);
                self.instance.state = InstanceState::Ended;
                self.instance.end_reason = Some(EndReason::Completed);
                self.instance.ended_at = Some(now);
                self.instance.record(EventKind::InstanceEnded, None, None, None, now);
                tracing::info!("✅ Instance {} of workflow {} completed", self.instance.id, self.workflow.id);
                Ok(())
            }
            Some(owner_id) => {
                if !self.activity_instance(&owner_id)?.is_live() {
                    return Ok(());
                }
                self.instance.record(EventKind::ScopeEnded, Some(&owner_id), None, None, now);
                let (activity, scope) = self.definition(&owner_id)?;
                match self.matching_transitions(&owner_id, activity, scope) {
                    Ok(take) => self.end_with(&owner_id, take),
                    Err(error) => self.fail(&owner_id, activity, error.into()),
                }
            }
        }
    }

    /// Record an activity failure: schedule a retry, or suspend on fatal errors
    fn fail(&mut self, id: &ActivityInstanceId, activity: &Activity, error: ActivityError) -> Result<(), EngineError> {
        if let ActivityError::Unauthorized(message) = &error {
            return Err(EngineError::Unauthorized {
                instance_id: self.instance.id.clone(),
                actor: self.actor.clone(),
                message: message.clone(),
            });
        }
        if self.propagate_failure_of.as_ref() == Some(id) {
            return Err(self.execution_error(id, activity, &error));
        }

        let now = self.now;
        let message = error.to_string();
        let ai = self.activity_instance_mut(id)?;
        ai.state = ActivityState::Waiting;
        ai.last_error = Some(message.clone());
        self.instance
            .record(EventKind::ActivityFailed, Some(id), None, Some(message.clone()), now);

        if error.is_fatal() {
            self.instance.state = InstanceState::Suspended;
            self.instance
                .record(EventKind::InstanceSuspended, Some(id), None, Some(message.clone()), now);
            tracing::error!(
                "❌ Instance {} suspended: activity {} ({}) failed fatally: {}",
                self.instance.id, activity.id, id, message
            );
        } else {
            let job = Job::new(ACTIVITY_RETRY, Value::Null, now).for_activity(&self.instance.id, id);
            tracing::warn!(
                "⚠️ Activity {} ({}) failed in instance {}, retry job {} scheduled: {}",
                activity.id, id, self.instance.id, job.id, message
            );
            self.effects.jobs.push(job);
        }
        Ok(())
    }

    fn execution_error(&self, id: &ActivityInstanceId, activity: &Activity, error: &ActivityError) -> EngineError {
        match error {
            ActivityError::Binding(BindingError::Unresolved(variable)) => UnresolvedVariableError {
                variable_id: variable.clone(),
                instance_id: self.instance.id.clone(),
                activity_instance_id: id.clone(),
            }
            .into(),
            ActivityError::Unauthorized(message) => EngineError::Unauthorized {
                instance_id: self.instance.id.clone(),
                actor: self.actor.clone(),
                message: message.clone(),
            },
            other => ActivityExecutionError {
                instance_id: self.instance.id.clone(),
                activity_instance_id: id.clone(),
                activity_id: activity.id.clone(),
                message: other.to_string(),
                fatal: other.is_fatal(),
            }
            .into(),
        }
    }

    /// Definition of an activity instance and the scope it is declared in
    fn definition(&self, id: &ActivityInstanceId) -> Result<(&'w Activity, &'w Scope), EngineError> {
        let workflow: &'w Workflow = self.workflow;
        let path = self.instance.activity_path(id);
        path.split_last()
            .and_then(|(last, parents)| {
                let scope = workflow.scope_at(parents)?;
                Some((scope.activity(last)?, scope))
            })
            .ok_or_else(|| {
                self.invalid_state(format!(
                    "activity instance '{}' has no activity in workflow '{}'",
                    id, workflow.id
                ))
            })
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        match self.instance.state {
            InstanceState::Active => Ok(()),
            other => Err(self.invalid_state(format!("instance is {}", other.as_str()))),
        }
    }

    fn activity_instance(&self, id: &ActivityInstanceId) -> Result<&ActivityInstance, EngineError> {
        self.instance
            .activity_instance(id)
            .ok_or_else(|| EngineError::ActivityInstanceNotFound {
                instance_id: self.instance.id.clone(),
                activity_instance_id: id.clone(),
            })
    }

    fn activity_instance_mut(&mut self, id: &ActivityInstanceId) -> Result<&mut ActivityInstance, EngineError> {
        let instance_id = self.instance.id.clone();
        self.instance
            .activity_instance_mut(id)
            .ok_or_else(|| EngineError::ActivityInstanceNotFound {
                instance_id,
                activity_instance_id: id.clone(),
            })
    }

    fn invalid_state(&self, message: impl Into<String>) -> EngineError {
        EngineError::InvalidState {
            instance_id: self.instance.id.clone(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::capabilities::Capabilities;
    use crate::workflow::ids::{ActivityId, VariableId};
    use crate::workflow::parser::parse;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Failing {
        fatal: bool,
    }

    impl ActivityType for Failing {
        fn type_name(&self) -> &'static str {
            "failing"
        }

        fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
            ctx.schedule_job("never", Value::Null, ctx.now());
            if self.fatal {
                Err(BindingError::Unresolved(VariableId::new("missing")).into())
            } else {
                Err(ActivityError::failed("downstream unavailable"))
            }
        }
    }

    fn make_workflow(definition: serde_json::Value) -> Workflow {
        let mut caps = Capabilities::builtin();
        caps.register_activity("failing", |c| {
            Ok(Arc::new(Failing {
                fatal: c.get("fatal").and_then(|f| f.as_bool()).unwrap_or(false),
            }))
        });
        parse(&serde_json::from_value(definition).unwrap(), &caps).unwrap()
    }

    fn make_instance(workflow: &Workflow) -> WorkflowInstance {
        WorkflowInstance::new(workflow.id.clone(), Actor::System, Utc::now())
    }

    fn var(id: &str) -> VariableId {
        VariableId::new(id)
    }

    fn waiting_on(instance: &WorkflowInstance, activity: &str) -> ActivityInstanceId {
        instance
            .waiting_activity_instances()
            .into_iter()
            .find(|ai| ai.activity_id == ActivityId::new(activity))
            .map(|ai| ai.id.clone())
            .unwrap()
    }

    #[test]
    fn test_synchronous_definition_ends_on_start() {
        let workflow = make_workflow(json!({
            "id": "wf-sync",
            "variables": [{"id": "greeting"}, {"id": "untouched", "default": 3}],
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "set", "type": "setVariable", "config": {"variable": "greeting", "value": {"literal": "hi"}}},
                {"id": "end", "type": "endEvent"}
            ],
            "transitions": [{"from": "start", "to": "set"}, {"from": "set", "to": "end"}]
        }));
        let mut instance = make_instance(&workflow);

        let effects = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
            .start(Variables::new())
            .unwrap();

        assert!(effects.jobs.is_empty());
        assert_eq!(instance.state, InstanceState::Ended);
        assert_eq!(instance.end_reason, Some(EndReason::Completed));
        assert_eq!(instance.variables[&var("greeting")], json!("hi"));
        assert_eq!(instance.variables[&var("untouched")], json!(3));
        assert_eq!(instance.events_of(EventKind::InstanceEnded).count(), 1);
        let order: Vec<_> = instance.activity_instances.values().map(|ai| ai.activity_id.as_str()).collect();
        assert_eq!(order, vec!["start", "set", "end"]);
    }

    #[test]
    fn test_end_is_idempotent() {
        let workflow = make_workflow(json!({
            "id": "wf-wait",
            "activities": [
                {"id": "wait", "type": "receiveTask"},
                {"id": "after", "type": "receiveTask"}
            ],
            "transitions": [{"from": "wait", "to": "after"}]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();
        let wait = waiting_on(&instance, "wait");

        let mut executor = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now);
        executor.end(&wait).unwrap();
        executor.end(&wait).unwrap();
        drop(executor);

        assert_eq!(instance.activity_instance(&wait).unwrap().state, ActivityState::Ended);
        let after: Vec<_> = instance
            .activity_instances
            .values()
            .filter(|ai| ai.activity_id == ActivityId::new("after"))
            .collect();
        assert_eq!(after.len(), 1);
        assert_eq!(instance.events_of(EventKind::ActivityEnded).count(), 1);
        assert_eq!(instance.state, InstanceState::Active);
    }

    #[test]
    fn test_exclusive_gateway_first_match_then_default() {
        let definition = json!({
            "id": "wf-choice",
            "variables": [{"id": "amount"}, {"id": "route"}],
            "activities": [
                {"id": "choose", "type": "exclusiveGateway", "config": {"default": "to-normal"}},
                {"id": "big", "type": "setVariable", "config": {"variable": "route", "value": {"literal": "big"}}},
                {"id": "also-big", "type": "setVariable", "config": {"variable": "route", "value": {"literal": "also"}}},
                {"id": "normal", "type": "setVariable", "config": {"variable": "route", "value": {"literal": "normal"}}}
            ],
            "transitions": [
                {"id": "to-big", "from": "choose", "to": "big", "condition": {"equals": [{"variable": "amount"}, {"literal": 1000}]}},
                {"id": "to-also", "from": "choose", "to": "also-big", "condition": {"truthy": {"variable": "amount"}}},
                {"id": "to-normal", "from": "choose", "to": "normal"}
            ]
        });
        let workflow = make_workflow(definition);

        let run = |amount: serde_json::Value| {
            let mut instance = make_instance(&workflow);
            let input = Variables::from([(var("amount"), amount)]);
            InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
                .start(input)
                .unwrap();
            assert!(instance.is_ended());
            instance.variables[&var("route")].clone()
        };

        assert_eq!(run(json!(1000)), json!("big"));
        assert_eq!(run(json!(5)), json!("also"));
        assert_eq!(run(json!(0)), json!("normal"));
    }

    #[test]
    fn test_sub_process_scope_completes_parent() {
        let workflow = make_workflow(json!({
            "id": "wf-sub",
            "variables": [{"id": "result"}],
            "activities": [
                {"id": "sub", "type": "subProcess", "scope": {
                    "variables": [{"id": "local", "default": "inner"}],
                    "activities": [
                        {"id": "copy", "type": "setVariable", "config": {"variable": "result", "value": {"variable": "local"}}},
                        {"id": "wait", "type": "receiveTask"}
                    ],
                    "transitions": [{"from": "copy", "to": "wait"}]
                }},
                {"id": "done", "type": "endEvent"}
            ],
            "transitions": [{"from": "sub", "to": "done"}]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();

        assert_eq!(instance.variables[&var("result")], json!("inner"));
        assert!(!instance.variables.contains_key(&var("local")));
        let wait = waiting_on(&instance, "wait");
        assert_eq!(instance.activity_path(&wait), vec![ActivityId::new("sub"), ActivityId::new("wait")]);

        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .signal(&wait, Variables::from([(var("local"), json!("changed"))]))
            .unwrap();

        assert!(instance.is_ended());
        assert_eq!(instance.events_of(EventKind::ScopeEnded).count(), 2);
        assert!(!instance.variables.contains_key(&var("local")));
    }

    #[test]
    fn test_retryable_failure_schedules_retry_and_discards_effects() {
        let workflow = make_workflow(json!({
            "id": "wf-fail",
            "activities": [{"id": "flaky", "type": "failing"}]
        }));
        let mut instance = make_instance(&workflow);
        let effects = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
            .start(Variables::new())
            .unwrap();

        assert_eq!(instance.state, InstanceState::Active);
        assert_eq!(effects.jobs.len(), 1);
        assert_eq!(effects.jobs[0].job_type, ACTIVITY_RETRY);
        let ai = instance.activity_instances.values().next().unwrap();
        assert_eq!(ai.state, ActivityState::Waiting);
        assert_eq!(ai.last_error.as_deref(), Some("downstream unavailable"));
        assert_eq!(effects.jobs[0].activity_instance_id.as_ref(), Some(&ai.id));
    }

    #[test]
    fn test_retry_failure_propagates_to_caller() {
        let workflow = make_workflow(json!({
            "id": "wf-fail",
            "activities": [{"id": "flaky", "type": "failing"}]
        }));
        let mut instance = make_instance(&workflow);
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
            .start(Variables::new())
            .unwrap();
        let id = instance.activity_instances.keys().next().unwrap().clone();

        let err = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
            .retry(&id)
            .unwrap_err();
        assert!(matches!(err, EngineError::ActivityExecution(ref e) if !e.fatal && e.activity_instance_id == id));
    }

    #[test]
    fn test_fatal_binding_error_suspends_instance() {
        let workflow = make_workflow(json!({
            "id": "wf-fatal",
            "activities": [{"id": "broken", "type": "failing", "config": {"fatal": true}}]
        }));
        let mut instance = make_instance(&workflow);
        let effects = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, Utc::now())
            .start(Variables::new())
            .unwrap();

        assert!(effects.jobs.is_empty());
        assert_eq!(instance.state, InstanceState::Suspended);
        assert_eq!(instance.events_of(EventKind::InstanceSuspended).count(), 1);
    }

    #[test]
    fn test_signal_on_ended_activity_is_concurrent_modification() {
        let workflow = make_workflow(json!({
            "id": "wf-once",
            "activities": [{"id": "wait", "type": "receiveTask"}]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();
        let wait = waiting_on(&instance, "wait");

        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .signal(&wait, Variables::new())
            .unwrap();
        let err = InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .signal(&wait, Variables::new())
            .unwrap_err();
        assert!(err.is_concurrent_modification());
    }

    #[test]
    fn test_cancel_aborts_live_activity_instances() {
        let workflow = make_workflow(json!({
            "id": "wf-cancel",
            "activities": [
                {"id": "fork", "type": "parallelGateway"},
                {"id": "a", "type": "receiveTask"},
                {"id": "b", "type": "receiveTask"}
            ],
            "transitions": [{"from": "fork", "to": "a"}, {"from": "fork", "to": "b"}]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();
        assert_eq!(instance.waiting_activity_instances().len(), 2);

        let operator = Actor::user("ops");
        InstanceExecutor::new(&workflow, &mut instance, &operator, now)
            .cancel()
            .unwrap();

        assert_eq!(instance.end_reason, Some(EndReason::Cancelled));
        assert_eq!(instance.live_activity_instances().count(), 0);
        assert_eq!(instance.activity_instances.values().filter(|ai| ai.aborted).count(), 2);
        assert_eq!(instance.events_of(EventKind::ActivityAborted).count(), 2);
    }

    #[test]
    fn test_partial_join_absorbs_late_arrival() {
        let workflow = make_workflow(json!({
            "id": "wf-partial",
            "activities": [
                {"id": "fork", "type": "parallelGateway"},
                {"id": "a", "type": "noneTask"},
                {"id": "b", "type": "noneTask"},
                {"id": "c", "type": "receiveTask"},
                {"id": "join", "type": "parallelGateway", "config": {"threshold": 2}},
                {"id": "after", "type": "noneTask"}
            ],
            "transitions": [
                {"from": "fork", "to": "a"}, {"from": "fork", "to": "b"}, {"from": "fork", "to": "c"},
                {"from": "a", "to": "join"}, {"from": "b", "to": "join"}, {"from": "c", "to": "join"},
                {"from": "join", "to": "after"}
            ]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();
        let afters = |i: &WorkflowInstance| {
            i.activity_instances.values().filter(|ai| ai.activity_id == ActivityId::new("after")).count()
        };
        assert_eq!(afters(&instance), 1);
        assert!(!instance.is_ended());

        let c = waiting_on(&instance, "c");
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .signal(&c, Variables::new())
            .unwrap();
        assert_eq!(afters(&instance), 1);
        assert!(instance.is_ended());
    }

    #[test]
    fn test_join_waits_for_sub_process_branch_to_complete() {
        let workflow = make_workflow(json!({
            "id": "wf-nested-join",
            "activities": [
                {"id": "fork", "type": "parallelGateway"},
                {"id": "quick", "type": "noneTask"},
                {"id": "sub", "type": "subProcess", "scope": {
                    "activities": [{"id": "inner", "type": "receiveTask"}]
                }},
                {"id": "join", "type": "parallelGateway"},
                {"id": "after", "type": "noneTask"}
            ],
            "transitions": [
                {"from": "fork", "to": "quick"}, {"from": "fork", "to": "sub"},
                {"from": "quick", "to": "join"}, {"from": "sub", "to": "join"},
                {"from": "join", "to": "after"}
            ]
        }));
        let mut instance = make_instance(&workflow);
        let now = Utc::now();
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .start(Variables::new())
            .unwrap();

        let join = instance
            .activity_instances
            .values()
            .find(|ai| ai.activity_id == ActivityId::new("join"))
            .unwrap();
        assert_eq!(join.state, ActivityState::Waiting);
        assert_eq!(join.join.as_ref().unwrap().arrived.len(), 1);
        let count = |i: &WorkflowInstance, activity: &str| {
            i.activity_instances.values().filter(|ai| ai.activity_id == ActivityId::new(activity)).count()
        };
        assert_eq!(count(&instance, "after"), 0);

        let inner = waiting_on(&instance, "inner");
        InstanceExecutor::new(&workflow, &mut instance, &Actor::System, now)
            .signal(&inner, Variables::new())
            .unwrap();

        assert!(instance.is_ended());
        assert_eq!(count(&instance, "join"), 1);
        assert_eq!(count(&instance, "after"), 1);
    }
}
