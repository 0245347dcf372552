/// userTask: human task managed by the task service
///
/// Config:
/// ```json
/// { "name": "Review request",
///   "assignee": { "variable": "manager" },
///   "candidates": { "list": [{ "literal": "ann" }, { "variable": "deputy" }] },
///   "reminder": { "after_secs": 3600, "repeat_secs": 86400 },
///   "escalation": { "after_secs": 172800, "to": { "variable": "director" } } }
/// ```
///
/// On execute the task is created, reminder/escalation jobs are scheduled and
/// the activity waits. A signal from the assignee (or the system) completes the
/// task, writes the signal input and continues onwards.

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};
use crate::actor::Actor;
use crate::job::due_in;
use crate::job::escalate::{EscalationData, TASK_ESCALATE};
use crate::job::reminder::{ReminderData, TASK_REMINDER};
use crate::runtime::resolver::BindingError;
use crate::workflow::binding::Binding;
use crate::workflow::ids::{UserId, VariableId};
use crate::workflow::model::Variables;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct UserTask {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    assignee: Option<Binding<String>>,
    #[serde(default)]
    candidates: Option<Binding<String>>,
    #[serde(default)]
    reminder: Option<ReminderConfig>,
    #[serde(default)]
    escalation: Option<EscalationConfig>,
}

#[derive(Debug, Deserialize)]
struct ReminderConfig {
    after_secs: u64,
    #[serde(default)]
    repeat_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct EscalationConfig {
    after_secs: u64,
    to: Binding<String>,
}

fn job_data<T: serde::Serialize>(data: &T) -> Result<Value, ActivityError> {
    serde_json::to_value(data).map_err(|e| ActivityError::failed(e.to_string()))
}

fn due_after(ctx: &ActivityContext<'_>, secs: u64) -> Result<DateTime<Utc>, ActivityError> {
    due_in(ctx.now(), secs)
        .ok_or_else(|| BindingError::TypeMismatch(format!("delay of {} seconds is out of range", secs)).into())
}

fn in_range(secs: u64) -> bool {
    due_in(Utc::now(), secs).is_some()
}

impl UserTask {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        if config.is_null() {
            return serde_json::from_value(Value::Object(Default::default())).map_err(|e| e.to_string());
        }
        let task: UserTask = serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        if let Some(reminder) = &task.reminder {
            if reminder.repeat_secs == Some(0) {
                return Err("reminder repeat_secs must be positive".to_string());
            }
            let mut delays = std::iter::once(reminder.after_secs).chain(reminder.repeat_secs);
            if let Some(secs) = delays.find(|secs| !in_range(*secs)) {
                return Err(format!("reminder delay of {} seconds is out of range", secs));
            }
        }
        if let Some(escalation) = &task.escalation {
            if !in_range(escalation.after_secs) {
                return Err(format!("escalation delay of {} seconds is out of range", escalation.after_secs));
            }
        }
        Ok(task)
    }
}

impl ActivityType for UserTask {
    fn type_name(&self) -> &'static str {
        "userTask"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        // A declared but unset assignee variable leaves the task unassigned
        let assignee = match &self.assignee {
            Some(binding) => match ctx.resolve(binding)? {
                Value::Null => None,
                Value::String(user) => Some(UserId::new(user)),
                other => {
                    return Err(BindingError::TypeMismatch(format!(
                        "assignee must be a user id string, got {}",
                        other
                    ))
                    .into())
                }
            },
            None => None,
        };
        let candidates = match &self.candidates {
            Some(binding) => ctx.resolve_all(binding)?.into_iter().map(UserId::new).collect(),
            None => Vec::new(),
        };
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| ctx.activity().id.to_string());

        let task_id = ctx.create_task(name, assignee, candidates);

        if let Some(reminder) = &self.reminder {
            let data = ReminderData {
                task_id: task_id.clone(),
                repeat_secs: reminder.repeat_secs,
            };
            let due = due_after(ctx, reminder.after_secs)?;
            ctx.schedule_job(TASK_REMINDER, job_data(&data)?, due);
        }
        if let Some(escalation) = &self.escalation {
            let data = EscalationData {
                task_id: task_id.clone(),
                to: escalation.to.clone(),
            };
            let due = due_after(ctx, escalation.after_secs)?;
            ctx.schedule_job(TASK_ESCALATE, job_data(&data)?, due);
        }

        Ok(Outcome::Wait)
    }

    fn on_signal(&self, ctx: &mut ActivityContext<'_>, input: &Variables) -> Result<Outcome, ActivityError> {
        let task = ctx.task().cloned();

        if let (Actor::User(user), Some(assignee)) = (ctx.actor(), task.as_ref().and_then(|t| t.assignee.as_ref())) {
            if user != assignee {
                return Err(ActivityError::Unauthorized(format!(
                    "task is assigned to {}",
                    assignee
                )));
            }
        }

        ctx.set_variables(input);
        if let Some(task) = task {
            ctx.complete_task(&task.id);
        }
        Ok(Outcome::Onwards)
    }

    fn referenced_variables(&self) -> Vec<&VariableId> {
        let mut refs = Vec::new();
        if let Some(assignee) = &self.assignee {
            refs.extend(assignee.variables());
        }
        if let Some(candidates) = &self.candidates {
            refs.extend(candidates.variables());
        }
        if let Some(escalation) = &self.escalation {
            refs.extend(escalation.to.variables());
        }
        refs
    }
}
