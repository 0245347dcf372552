/// Runtime tree
///
/// A `WorkflowInstance` owns the activity instance arena, the root variable
/// store and an ordered execution event log. It is mutated only by the executor
/// while the instance is claimed, and persisted as a whole.

use crate::actor::Actor;
use crate::runtime::resolver::ScopeChain;
use crate::workflow::ids::{
    ActivityId, ActivityInstanceId, InstanceId, TaskId, TransitionId, UserId, VariableId,
    WorkflowId,
};
use crate::workflow::model::Variables;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Active,
    /// Halted on a fatal error, awaiting operator action
    Suspended,
    Ended,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::Active => "active",
            InstanceState::Suspended => "suspended",
            InstanceState::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    Created,
    Started,
    Waiting,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    InstanceStarted,
    ActivityStarted,
    ActivityWaiting,
    JoinArrived,
    ActivityEnded,
    ActivityAborted,
    ActivityFailed,
    ScopeEnded,
    Signalled,
    InstanceSuspended,
    InstanceEnded,
    InstanceCancelled,
}

/// One entry of the execution event log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub sequence: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_instance_id: Option<ActivityInstanceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Task linked to a user-task activity instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: TaskId,
    pub assignee: Option<UserId>,
}

/// Arrivals recorded on a joining activity instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinState {
    pub threshold: usize,
    pub arrived: Vec<TransitionId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub id: ActivityInstanceId,
    pub activity_id: ActivityId,
    /// Enclosing composite activity instance; `None` for the root scope
    pub parent: Option<ActivityInstanceId>,
    pub state: ActivityState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub children: Vec<ActivityInstanceId>,
    /// Own variable store when the activity is a scope instance
    #[serde(default)]
    pub variables: Variables,
    #[serde(default)]
    pub join: Option<JoinState>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub task: Option<TaskRef>,
    #[serde(default)]
    pub aborted: bool,
}

impl ActivityInstance {
    /// CREATED, STARTED and WAITING instances are live
    pub fn is_live(&self) -> bool {
        self.state != ActivityState::Ended
    }

    pub fn is_waiting(&self) -> bool {
        self.state == ActivityState::Waiting
    }

    pub fn is_joining(&self) -> bool {
        self.join.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub workflow_id: WorkflowId,
    pub state: InstanceState,
    pub end_reason: Option<EndReason>,
    pub started_by: Actor,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency version, bumped by every committed change
    pub version: u64,
    /// Root variable store
    pub variables: Variables,
    /// Root scope children in creation order
    pub children: Vec<ActivityInstanceId>,
    pub activity_instances: BTreeMap<ActivityInstanceId, ActivityInstance>,
    pub events: Vec<ExecutionEvent>,
    next_activity_instance: u64,
}

impl WorkflowInstance {
    pub fn new(workflow_id: WorkflowId, started_by: Actor, now: DateTime<Utc>) -> Self {
        Self {
            id: InstanceId::generate(),
            workflow_id,
            state: InstanceState::Created,
            end_reason: None,
            started_by,
            created_at: now,
            started_at: None,
            ended_at: None,
            version: 0,
            variables: Variables::new(),
            children: Vec::new(),
            activity_instances: BTreeMap::new(),
            events: Vec::new(),
            next_activity_instance: 0,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.state == InstanceState::Ended
    }

    pub fn activity_instance(&self, id: &ActivityInstanceId) -> Option<&ActivityInstance> {
        self.activity_instances.get(id)
    }

    pub fn activity_instance_mut(&mut self, id: &ActivityInstanceId) -> Option<&mut ActivityInstance> {
        self.activity_instances.get_mut(id)
    }

    /// Allocate a CREATED activity instance under the given scope instance
    pub fn create_activity_instance(
        &mut self,
        activity_id: ActivityId,
        parent: Option<&ActivityInstanceId>,
        now: DateTime<Utc>,
    ) -> ActivityInstanceId {
        self.next_activity_instance += 1;
        let id = ActivityInstanceId::sequential(self.next_activity_instance);

        let instance = ActivityInstance {
            id: id.clone(),
            activity_id,
            parent: parent.cloned(),
            state: ActivityState::Created,
            created_at: now,
            started_at: None,
            ended_at: None,
            children: Vec::new(),
            variables: Variables::new(),
            join: None,
            last_error: None,
            task: None,
            aborted: false,
        };
        self.activity_instances.insert(id.clone(), instance);

        match parent.and_then(|p| self.activity_instances.get_mut(p)) {
            Some(parent) => parent.children.push(id.clone()),
            None => self.children.push(id.clone()),
        }
        id
    }

    /// Children of a scope instance (`None` = root), in creation order
    pub fn children_of(&self, parent: Option<&ActivityInstanceId>) -> &[ActivityInstanceId] {
        match parent {
            Some(id) => self
                .activity_instances
                .get(id)
                .map(|ai| ai.children.as_slice())
                .unwrap_or(&[]),
            None => &self.children,
        }
    }

    pub fn has_live_children(&self, parent: Option<&ActivityInstanceId>) -> bool {
        self.children_of(parent)
            .iter()
            .filter_map(|id| self.activity_instances.get(id))
            .any(ActivityInstance::is_live)
    }

    /// Live joining instance of an activity within a scope instance
    pub fn live_join(
        &self,
        parent: Option<&ActivityInstanceId>,
        activity_id: &ActivityId,
    ) -> Option<ActivityInstanceId> {
        self.children_of(parent)
            .iter()
            .filter_map(|id| self.activity_instances.get(id))
            .find(|ai| ai.is_live() && ai.is_joining() && &ai.activity_id == activity_id)
            .map(|ai| ai.id.clone())
    }

    /// Ended join that fired below its incoming count and still absorbs late arrivals
    pub fn absorbing_join(
        &self,
        parent: Option<&ActivityInstanceId>,
        activity_id: &ActivityId,
        incoming: usize,
    ) -> Option<ActivityInstanceId> {
        self.children_of(parent)
            .iter()
            .rev()
            .filter_map(|id| self.activity_instances.get(id))
            .find(|ai| &ai.activity_id == activity_id && !ai.is_live())
            .filter(|ai| ai.join.as_ref().is_some_and(|j| j.arrived.len() < incoming))
            .map(|ai| ai.id.clone())
    }

    pub fn live_activity_instances(&self) -> impl Iterator<Item = &ActivityInstance> {
        self.activity_instances.values().filter(|ai| ai.is_live())
    }

    /// WAITING activity instances that accept signals (joins excluded)
    pub fn waiting_activity_instances(&self) -> Vec<&ActivityInstance> {
        self.activity_instances
            .values()
            .filter(|ai| ai.is_waiting() && !ai.is_joining())
            .collect()
    }

    /// Activity ids from the root scope down to the given activity instance
    pub fn activity_path(&self, id: &ActivityInstanceId) -> Vec<ActivityId> {
        let mut path = Vec::new();
        let mut current = self.activity_instances.get(id);
        while let Some(ai) = current {
            path.push(ai.activity_id.clone());
            current = ai.parent.as_ref().and_then(|p| self.activity_instances.get(p));
        }
        path.reverse();
        path
    }

    /// Path of the scope an activity instance lives in (its parents only)
    pub fn scope_path(&self, parent: Option<&ActivityInstanceId>) -> Vec<ActivityId> {
        parent.map(|p| self.activity_path(p)).unwrap_or_default()
    }

    /// Visible variable stores from an activity instance outwards, ending at the root
    pub fn scope_chain(&self, id: &ActivityInstanceId) -> ScopeChain<'_> {
        let mut stores = Vec::new();
        let mut current = self.activity_instances.get(id);
        while let Some(ai) = current {
            stores.push(&ai.variables);
            current = ai.parent.as_ref().and_then(|p| self.activity_instances.get(p));
        }
        stores.push(&self.variables);
        ScopeChain::new(stores)
    }

    /// Write a variable to the innermost scope instance that holds it, else the root
    pub fn set_variable(&mut self, from: &ActivityInstanceId, variable: VariableId, value: Value) {
        let mut current = Some(from.clone());
        while let Some(id) = current {
            let Some(ai) = self.activity_instances.get_mut(&id) else {
                break;
            };
            if ai.variables.contains_key(&variable) {
                ai.variables.insert(variable, value);
                return;
            }
            current = ai.parent.clone();
        }
        self.variables.insert(variable, value);
    }

    /// Value of a variable as seen from an activity instance
    pub fn variable(&self, from: &ActivityInstanceId, variable: &VariableId) -> Option<&Value> {
        self.scope_chain(from).lookup(variable)
    }

    /// Append an execution event
    pub fn record(
        &mut self,
        kind: EventKind,
        activity_instance_id: Option<&ActivityInstanceId>,
        actor: Option<&Actor>,
        detail: Option<String>,
        at: DateTime<Utc>,
    ) {
        let sequence = self.events.len() as u64 + 1;
        self.events.push(ExecutionEvent {
            sequence,
            kind,
            activity_instance_id: activity_instance_id.cloned(),
            actor: actor.cloned(),
            detail,
            at,
        });
    }

    pub fn events_of(&self, kind: EventKind) -> impl Iterator<Item = &ExecutionEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_instance() -> WorkflowInstance {
        WorkflowInstance::new(WorkflowId::new("wf"), Actor::System, Utc::now())
    }

    #[test]
    fn test_sequential_ids_and_children() {
        let mut instance = make_instance();
        let now = Utc::now();
        let sub = instance.create_activity_instance(ActivityId::new("sub"), None, now);
        let inner = instance.create_activity_instance(ActivityId::new("inner"), Some(&sub), now);

        assert_eq!(sub.as_str(), "ai-1");
        assert_eq!(inner.as_str(), "ai-2");
        assert_eq!(instance.children, vec![sub.clone()]);
        assert_eq!(instance.children_of(Some(&sub)), &[inner.clone()]);
        assert_eq!(
            instance.activity_path(&inner),
            vec![ActivityId::new("sub"), ActivityId::new("inner")]
        );
        assert!(instance.has_live_children(None));
    }

    #[test]
    fn test_variable_write_targets_declaring_scope() {
        let mut instance = make_instance();
        let now = Utc::now();
        instance.variables.insert(VariableId::new("total"), json!(0));
        let sub = instance.create_activity_instance(ActivityId::new("sub"), None, now);
        instance
            .activity_instance_mut(&sub)
            .unwrap()
            .variables
            .insert(VariableId::new("item"), Value::Null);
        let inner = instance.create_activity_instance(ActivityId::new("inner"), Some(&sub), now);

        instance.set_variable(&inner, VariableId::new("item"), json!("x"));
        instance.set_variable(&inner, VariableId::new("total"), json!(5));
        instance.set_variable(&inner, VariableId::new("fresh"), json!(true));

        assert_eq!(instance.activity_instance(&sub).unwrap().variables[&VariableId::new("item")], json!("x"));
        assert_eq!(instance.variables[&VariableId::new("total")], json!(5));
        assert_eq!(instance.variables[&VariableId::new("fresh")], json!(true));
        assert_eq!(instance.variable(&inner, &VariableId::new("item")), Some(&json!("x")));
    }

    #[test]
    fn test_event_sequence_is_monotonic() {
        let mut instance = make_instance();
        let now = Utc::now();
        instance.record(EventKind::InstanceStarted, None, Some(&Actor::System), None, now);
        instance.record(EventKind::InstanceEnded, None, None, None, now);
        let sequences: Vec<u64> = instance.events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(instance.events_of(EventKind::InstanceEnded).count(), 1);
    }
}
