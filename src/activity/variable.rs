/// setVariable: write a resolved binding into a variable
///
/// Config: `{"variable": "approved", "value": {"literal": true}}`

use crate::activity::{ActivityContext, ActivityError, ActivityType, Outcome};
use crate::workflow::binding::Binding;
use crate::workflow::ids::VariableId;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct SetVariable {
    variable: VariableId,
    value: Binding<Value>,
}

impl SetVariable {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }
}

impl ActivityType for SetVariable {
    fn type_name(&self) -> &'static str {
        "setVariable"
    }

    fn execute(&self, ctx: &mut ActivityContext<'_>) -> Result<Outcome, ActivityError> {
        let value = ctx.resolve(&self.value)?;
        ctx.set_variable(self.variable.clone(), value);
        Ok(Outcome::Onwards)
    }

    fn referenced_variables(&self) -> Vec<&VariableId> {
        let mut refs = vec![&self.variable];
        refs.extend(self.value.variables());
        refs
    }
}
