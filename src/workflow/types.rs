/// Workflow source schema
///
/// The external description of a workflow as it is deployed and persisted.
/// Sources are plain serde structs; the parser turns them into the immutable
/// definition model (`workflow::model`) once per workflow id.

use crate::workflow::binding::Condition;
use crate::workflow::ids::{ActivityId, TransitionId, VariableId, WorkflowId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A complete workflow description
///
/// JSON shape:
/// ```json
/// { "id": "wf-approval", "name": "Approval",
///   "trigger": { "type": "manual" },
///   "variables": [{ "id": "manager" }],
///   "activities": [{ "id": "review", "type": "userTask", "config": {...} }],
///   "transitions": [{ "from": "start", "to": "review" }] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSource {
    /// Unique workflow identifier (e.g., "wf-approval")
    pub id: WorkflowId,
    /// Human-readable workflow name
    #[serde(default)]
    pub name: String,
    /// Optional trigger binding external input onto root variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerSource>,
    /// Root scope content
    #[serde(flatten)]
    pub scope: ScopeSource,
}

/// Trigger reference resolved through the capability registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSource {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
}

/// Variables, activities and transitions of one scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeSource {
    #[serde(default)]
    pub variables: Vec<VariableSource>,
    #[serde(default)]
    pub activities: Vec<ActivitySource>,
    #[serde(default)]
    pub transitions: Vec<TransitionSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSource {
    pub id: VariableId,
    /// Initial value; declared variables without a default start as null
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// A single activity
///
/// `type` selects the behavior from the capability registry and `config` is
/// handed to that type's factory. Composite types (e.g. `subProcess`) carry a
/// nested `scope`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivitySource {
    pub id: ActivityId,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSource>,
}

/// Directed connection between two activities of the same scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSource {
    /// Defaults to `"{from}->{to}"` when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TransitionId>,
    pub from: ActivityId,
    pub to: ActivityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl TransitionSource {
    /// Effective transition id
    pub fn effective_id(&self) -> TransitionId {
        self.id
            .clone()
            .unwrap_or_else(|| TransitionId::new(format!("{}->{}", self.from, self.to)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_from_json() {
        let source: WorkflowSource = serde_json::from_value(json!({
            "id": "wf-1",
            "variables": [{"id": "amount", "default": 10}],
            "activities": [
                {"id": "start", "type": "startEvent"},
                {"id": "sub", "type": "subProcess", "scope": {
                    "activities": [{"id": "inner", "type": "noneTask"}]
                }}
            ],
            "transitions": [{"from": "start", "to": "sub"}]
        }))
        .unwrap();

        assert_eq!(source.name, "");
        assert!(source.trigger.is_none());
        assert_eq!(source.scope.variables[0].default, Some(json!(10)));
        assert_eq!(source.scope.activities[0].config, Value::Null);
        let nested = source.scope.activities[1].scope.as_ref().unwrap();
        assert_eq!(nested.activities[0].id, ActivityId::new("inner"));
        assert_eq!(source.scope.transitions[0].effective_id(), TransitionId::new("start->sub"));
    }

    #[test]
    fn test_explicit_transition_id_wins() {
        let transition: TransitionSource =
            serde_json::from_value(json!({"id": "t1", "from": "a", "to": "b"})).unwrap();
        assert_eq!(transition.effective_id(), TransitionId::new("t1"));
    }
}
