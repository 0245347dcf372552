/// Parsed definition model
///
/// Immutable tree of scopes, activities and transitions built once per workflow
/// id by the parser and shared behind `Arc` by every instance of that workflow.

use crate::activity::ActivityType;
use crate::workflow::binding::Condition;
use crate::workflow::ids::{ActivityId, TransitionId, VariableId, WorkflowId};
use crate::workflow::trigger::TriggerType;
use crate::workflow::types::WorkflowSource;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Variable store of one scope instance
pub type Variables = BTreeMap<VariableId, Value>;

/// A deployed, validated workflow
#[derive(Debug)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub trigger: Option<Trigger>,
    /// Root scope
    pub scope: Scope,
    /// Source the definition was parsed from (persisted on deploy)
    pub source: WorkflowSource,
}

#[derive(Debug)]
pub struct Trigger {
    pub type_name: String,
    pub trigger_type: Arc<dyn TriggerType>,
}

/// Ordered activities, declared variables and transitions of one scope
#[derive(Debug, Default)]
pub struct Scope {
    pub variables: Vec<VariableDecl>,
    pub activities: Vec<Activity>,
    pub transitions: Vec<Transition>,
    activity_index: HashMap<ActivityId, usize>,
    transition_index: HashMap<TransitionId, usize>,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub id: VariableId,
    pub default: Option<Value>,
}

#[derive(Debug)]
pub struct Activity {
    pub id: ActivityId,
    pub type_name: String,
    pub activity_type: Arc<dyn ActivityType>,
    /// Nested scope for composite activities
    pub scope: Option<Scope>,
    /// Outgoing transitions in declaration order
    pub outgoing: Vec<TransitionId>,
    pub incoming: usize,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub from: ActivityId,
    pub to: ActivityId,
    pub condition: Option<Condition>,
}

impl Workflow {
    /// Scope reached by descending through the given composite activities.
    /// An empty path is the root scope.
    pub fn scope_at(&self, path: &[ActivityId]) -> Option<&Scope> {
        let mut scope = &self.scope;
        for id in path {
            scope = scope.activity(id)?.scope.as_ref()?;
        }
        Some(scope)
    }

    /// Activity at the end of a path from the root scope
    pub fn activity_at(&self, path: &[ActivityId]) -> Option<&Activity> {
        let (last, parents) = path.split_last()?;
        self.scope_at(parents)?.activity(last)
    }
}

impl Scope {
    pub fn new(
        variables: Vec<VariableDecl>,
        activities: Vec<Activity>,
        transitions: Vec<Transition>,
    ) -> Self {
        let activity_index = activities
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();
        let transition_index = transitions
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        Self {
            variables,
            activities,
            transitions,
            activity_index,
            transition_index,
        }
    }

    pub fn activity(&self, id: &ActivityId) -> Option<&Activity> {
        self.activity_index.get(id).map(|&i| &self.activities[i])
    }

    pub fn transition(&self, id: &TransitionId) -> Option<&Transition> {
        self.transition_index.get(id).map(|&i| &self.transitions[i])
    }

    /// Activities without incoming transitions, in declaration order
    pub fn start_activities(&self) -> impl Iterator<Item = &Activity> {
        self.activities.iter().filter(|a| a.incoming == 0)
    }

    pub fn declares(&self, variable: &VariableId) -> bool {
        self.variables.iter().any(|v| &v.id == variable)
    }

    /// Initial variable store: each declared variable with its default, else null
    pub fn initial_variables(&self) -> Variables {
        self.variables
            .iter()
            .map(|v| (v.id.clone(), v.default.clone().unwrap_or(Value::Null)))
            .collect()
    }
}

impl Activity {
    /// Join threshold, only for activities with more than one incoming transition
    pub fn join_threshold(&self) -> Option<usize> {
        if self.incoming > 1 {
            self.activity_type.join_threshold(self.incoming)
        } else {
            None
        }
    }
}
