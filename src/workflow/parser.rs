/// Definition parser
///
/// Turns a `WorkflowSource` into the immutable definition model. Parsing is pure
/// and never stops at the first problem: every structural violation found in
/// every scope is reported together in one `ParseError`.

use crate::error::ParseError;
use crate::workflow::capabilities::Capabilities;
use crate::workflow::ids::{ActivityId, TransitionId, VariableId};
use crate::workflow::model::{Activity, Scope, Transition, Trigger, VariableDecl, Workflow};
use crate::workflow::types::{ActivitySource, ScopeSource, TriggerSource, WorkflowSource};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use std::collections::{HashMap, HashSet};

/// One structural problem, located by scope path (`/` is the root scope)
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Violation {
    #[error("malformed workflow source: {message}")]
    Malformed { message: String },
    #[error("{scope}: transition '{transition}' starts at unknown activity '{activity}'")]
    UnresolvedTransitionSource {
        scope: String,
        transition: TransitionId,
        activity: ActivityId,
    },
    #[error("{scope}: transition '{transition}' leads to unknown activity '{activity}'")]
    UnresolvedTransitionTarget {
        scope: String,
        transition: TransitionId,
        activity: ActivityId,
    },
    #[error("{scope}: duplicate activity id '{activity}'")]
    DuplicateActivityId { scope: String, activity: ActivityId },
    #[error("{scope}: duplicate transition id '{transition}'")]
    DuplicateTransitionId { scope: String, transition: TransitionId },
    #[error("{scope}: variable '{variable}' is declared twice")]
    DuplicateVariable { scope: String, variable: VariableId },
    #[error("{scope}: {location} references undeclared variable '{variable}'")]
    UndeclaredVariable {
        scope: String,
        location: String,
        variable: VariableId,
    },
    #[error("{scope}: activity '{activity}' has unsupported type '{type_name}'")]
    UnsupportedActivityType {
        scope: String,
        activity: ActivityId,
        type_name: String,
    },
    #[error("unsupported trigger type '{type_name}'")]
    UnsupportedTriggerType { type_name: String },
    #[error("trigger '{type_name}' has invalid configuration: {message}")]
    InvalidTrigger { type_name: String, message: String },
    #[error("{scope}: activity '{activity}' has invalid configuration: {message}")]
    InvalidConfiguration {
        scope: String,
        activity: ActivityId,
        message: String,
    },
    #[error("{scope}: activity '{activity}' of type '{type_name}' cannot contain a nested scope")]
    UnexpectedScope {
        scope: String,
        activity: ActivityId,
        type_name: String,
    },
    #[error("{scope}: activity '{activity}' is unreachable from any start activity")]
    UnreachableActivity { scope: String, activity: ActivityId },
}

/// Parse a workflow source against the given capabilities
pub fn parse(source: &WorkflowSource, capabilities: &Capabilities) -> Result<Workflow, ParseError> {
    let mut parser = Parser {
        capabilities,
        violations: Vec::new(),
    };

    let trigger = source.trigger.as_ref().and_then(|t| parser.trigger(t));
    let scope = parser.scope(&source.scope, &HashSet::new(), &[]);

    if let Some(trigger) = &trigger {
        for variable in trigger.trigger_type.referenced_variables() {
            if !scope.declares(variable) {
                parser.violations.push(Violation::UndeclaredVariable {
                    scope: scope_label(&[]),
                    location: format!("trigger '{}'", trigger.type_name),
                    variable: variable.clone(),
                });
            }
        }
    }

    if !parser.violations.is_empty() {
        tracing::warn!(
            "❌ Workflow {} rejected with {} violation(s)",
            source.id,
            parser.violations.len()
        );
        return Err(ParseError {
            workflow_id: source.id.to_string(),
            violations: parser.violations,
        });
    }

    Ok(Workflow {
        id: source.id.clone(),
        name: source.name.clone(),
        trigger,
        scope,
        source: source.clone(),
    })
}

/// Decode a JSON workflow source without validating it
pub fn parse_source(json: &str) -> Result<WorkflowSource, ParseError> {
    serde_json::from_str(json).map_err(|e| ParseError {
        workflow_id: serde_json::from_str::<serde_json::Value>(json)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string))
            .unwrap_or_default(),
        violations: vec![Violation::Malformed { message: e.to_string() }],
    })
}

/// Parse a JSON workflow description
pub fn parse_json(json: &str, capabilities: &Capabilities) -> Result<Workflow, ParseError> {
    parse(&parse_source(json)?, capabilities)
}

fn scope_label(path: &[ActivityId]) -> String {
    let segments: Vec<&str> = path.iter().map(|id| id.as_str()).collect();
    format!("/{}", segments.join("/"))
}

struct Parser<'c> {
    capabilities: &'c Capabilities,
    violations: Vec<Violation>,
}

impl<'c> Parser<'c> {
    fn trigger(&mut self, source: &TriggerSource) -> Option<Trigger> {
        let Some(factory) = self.capabilities.trigger(&source.type_name) else {
            self.violations.push(Violation::UnsupportedTriggerType {
                type_name: source.type_name.clone(),
            });
            return None;
        };
        match factory(&source.config) {
            Ok(trigger_type) => Some(Trigger {
                type_name: source.type_name.clone(),
                trigger_type,
            }),
            Err(message) => {
                self.violations.push(Violation::InvalidTrigger {
                    type_name: source.type_name.clone(),
                    message,
                });
                None
            }
        }
    }

    fn scope(&mut self, source: &ScopeSource, outer: &HashSet<VariableId>, path: &[ActivityId]) -> Scope {
        let label = scope_label(path);

        let mut visible = outer.clone();
        let mut variables = Vec::new();
        let mut declared = HashSet::new();
        for variable in &source.variables {
            if !declared.insert(variable.id.clone()) {
                self.violations.push(Violation::DuplicateVariable {
                    scope: label.clone(),
                    variable: variable.id.clone(),
                });
                continue;
            }
            visible.insert(variable.id.clone());
            variables.push(VariableDecl {
                id: variable.id.clone(),
                default: variable.default.clone(),
            });
        }

        // Unique activities in declaration order
        let mut activity_ids = HashSet::new();
        let mut unique_activities: Vec<&ActivitySource> = Vec::new();
        for activity in &source.activities {
            if activity_ids.insert(activity.id.clone()) {
                unique_activities.push(activity);
            } else {
                self.violations.push(Violation::DuplicateActivityId {
                    scope: label.clone(),
                    activity: activity.id.clone(),
                });
            }
        }

        let transitions = self.transitions(source, &activity_ids, &visible, &label);

        let empty = ScopeSource::default();
        let mut activities = Vec::new();
        for source_activity in &unique_activities {
            let outgoing: Vec<TransitionId> = transitions
                .iter()
                .filter(|t| t.from == source_activity.id)
                .map(|t| t.id.clone())
                .collect();
            let incoming = transitions.iter().filter(|t| t.to == source_activity.id).count();

            let mut child_path = path.to_vec();
            child_path.push(source_activity.id.clone());

            let activity_type = match self.capabilities.activity(&source_activity.type_name) {
                None => {
                    self.violations.push(Violation::UnsupportedActivityType {
                        scope: label.clone(),
                        activity: source_activity.id.clone(),
                        type_name: source_activity.type_name.clone(),
                    });
                    None
                }
                Some(factory) => match factory(&source_activity.config) {
                    Ok(activity_type) => Some(activity_type),
                    Err(message) => {
                        self.violations.push(Violation::InvalidConfiguration {
                            scope: label.clone(),
                            activity: source_activity.id.clone(),
                            message,
                        });
                        None
                    }
                },
            };

            let nested = match (&activity_type, &source_activity.scope) {
                (Some(t), Some(_)) if !t.supports_scope() => {
                    self.violations.push(Violation::UnexpectedScope {
                        scope: label.clone(),
                        activity: source_activity.id.clone(),
                        type_name: source_activity.type_name.clone(),
                    });
                    None
                }
                (Some(t), nested) if t.supports_scope() => {
                    Some(self.scope(nested.as_ref().unwrap_or(&empty), &visible, &child_path))
                }
                (None, Some(nested)) => {
                    // Still report problems inside the nested scope
                    self.scope(nested, &visible, &child_path);
                    None
                }
                _ => None,
            };

            let Some(activity_type) = activity_type else {
                continue;
            };

            for variable in activity_type.referenced_variables() {
                if !visible.contains(variable) {
                    self.violations.push(Violation::UndeclaredVariable {
                        scope: label.clone(),
                        location: format!("activity '{}'", source_activity.id),
                        variable: variable.clone(),
                    });
                }
            }
            if let Err(message) = activity_type.validate(incoming, &outgoing) {
                self.violations.push(Violation::InvalidConfiguration {
                    scope: label.clone(),
                    activity: source_activity.id.clone(),
                    message,
                });
            }

            activities.push(Activity {
                id: source_activity.id.clone(),
                type_name: source_activity.type_name.clone(),
                activity_type,
                scope: nested,
                outgoing,
                incoming,
            });
        }

        let ordered_ids: Vec<&ActivityId> = unique_activities.iter().map(|a| &a.id).collect();
        self.check_reachability(&label, &ordered_ids, &transitions);

        Scope::new(variables, activities, transitions)
    }

    /// Resolved transitions of a scope; unresolved ones are reported and dropped
    fn transitions(
        &mut self,
        source: &ScopeSource,
        activity_ids: &HashSet<ActivityId>,
        visible: &HashSet<VariableId>,
        label: &str,
    ) -> Vec<Transition> {
        let mut transitions = Vec::new();
        let mut transition_ids = HashSet::new();

        for transition in &source.transitions {
            let id = transition.effective_id();
            if !transition_ids.insert(id.clone()) {
                self.violations.push(Violation::DuplicateTransitionId {
                    scope: label.to_string(),
                    transition: id,
                });
                continue;
            }

            let mut resolved = true;
            if !activity_ids.contains(&transition.from) {
                self.violations.push(Violation::UnresolvedTransitionSource {
                    scope: label.to_string(),
                    transition: id.clone(),
                    activity: transition.from.clone(),
                });
                resolved = false;
            }
            if !activity_ids.contains(&transition.to) {
                self.violations.push(Violation::UnresolvedTransitionTarget {
                    scope: label.to_string(),
                    transition: id.clone(),
                    activity: transition.to.clone(),
                });
                resolved = false;
            }
            if let Some(condition) = &transition.condition {
                for variable in condition.variables() {
                    if !visible.contains(variable) {
                        self.violations.push(Violation::UndeclaredVariable {
                            scope: label.to_string(),
                            location: format!("transition '{}'", id),
                            variable: variable.clone(),
                        });
                    }
                }
            }

            if resolved {
                transitions.push(Transition {
                    id,
                    from: transition.from.clone(),
                    to: transition.to.clone(),
                    condition: transition.condition.clone(),
                });
            }
        }
        transitions
    }

    /// Flag activities no start activity (no incoming transition) can reach
    fn check_reachability(&mut self, label: &str, activities: &[&ActivityId], transitions: &[Transition]) {
        let mut graph: DiGraph<&ActivityId, ()> = DiGraph::new();
        let mut index: HashMap<&ActivityId, NodeIndex> = HashMap::new();
        for id in activities {
            index.insert(*id, graph.add_node(*id));
        }
        for transition in transitions {
            if let (Some(&from), Some(&to)) = (index.get(&transition.from), index.get(&transition.to)) {
                graph.add_edge(from, to, ());
            }
        }

        let mut reached = HashSet::new();
        for node in graph.node_indices() {
            if graph.neighbors_directed(node, Direction::Incoming).next().is_some() {
                continue;
            }
            let mut dfs = Dfs::new(&graph, node);
            while let Some(visited) = dfs.next(&graph) {
                reached.insert(visited);
            }
        }

        for node in graph.node_indices() {
            if !reached.contains(&node) {
                self.violations.push(Violation::UnreachableActivity {
                    scope: label.to_string(),
                    activity: graph[node].clone(),
                });
            }
        }
    }
}
