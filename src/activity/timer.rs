/// timer: waits until a delay has elapsed, then continues through a `timer` job
///
/// Config: `{"delay_secs": {"literal": 3600}}` or `{"delay_secs": {"variable": "wait"}}`

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};
use crate::job::continuation::TIMER;
use crate::job::due_in;
use crate::runtime::resolver::BindingError;
use crate::workflow::binding::Binding;
use crate::workflow::ids::VariableId;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Timer {
    delay_secs: Binding<u64>,
}

impl Timer {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }
}

impl ActivityType for Timer {
    fn type_name(&self) -> &'static str {
        "timer"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        let delay = ctx.resolve_one(&self.delay_secs)?;
        let due = due_in(ctx.now(), delay).ok_or_else(|| {
            BindingError::TypeMismatch(format!("timer delay of {} seconds is out of range", delay))
        })?;
        ctx.schedule_job(TIMER, Value::Null, due);
        Ok(Outcome::Wait)
    }

    fn referenced_variables(&self) -> Vec<&VariableId> {
        self.delay_secs.variables()
    }
}
