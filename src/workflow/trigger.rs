/// Trigger types
///
/// A trigger binds the external input given to `start()` onto root variables.
/// Workflows without a trigger behave like `manual`.

use crate::workflow::ids::VariableId;
use crate::workflow::model::Variables;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub trait TriggerType: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    /// Map trigger input onto root variables
    fn apply(&self, input: Variables) -> Result<Variables, String>;

    /// Root variables written by the trigger
    fn referenced_variables(&self) -> Vec<&VariableId> {
        Vec::new()
    }
}

/// Every input key becomes a root variable of the same name
#[derive(Debug, Default)]
pub struct ManualTrigger;

impl TriggerType for ManualTrigger {
    fn type_name(&self) -> &'static str {
        "manual"
    }

    fn apply(&self, input: Variables) -> Result<Variables, String> {
        Ok(input)
    }
}

/// Renames input keys onto declared variables
///
/// Config: `{"fields": {"input_key": "variable_id"}, "required": ["input_key"]}`.
/// Keys without a mapping are dropped.
#[derive(Debug, Deserialize)]
pub struct MappingTrigger {
    fields: BTreeMap<String, VariableId>,
    #[serde(default)]
    required: Vec<String>,
}

impl MappingTrigger {
    pub fn from_config(config: &Value) -> Result<Self, String> {
        let trigger: MappingTrigger =
            serde_json::from_value(config.clone()).map_err(|e| e.to_string())?;
        if let Some(key) = trigger.required.iter().find(|k| !trigger.fields.contains_key(*k)) {
            return Err(format!("required key '{}' has no field mapping", key));
        }
        Ok(trigger)
    }
}

impl TriggerType for MappingTrigger {
    fn type_name(&self) -> &'static str {
        "mapping"
    }

    fn apply(&self, input: Variables) -> Result<Variables, String> {
        if let Some(missing) = self
            .required
            .iter()
            .find(|key| !input.contains_key(&VariableId::new(key.as_str())))
        {
            return Err(format!("trigger input is missing required key '{}'", missing));
        }

        let mut variables = Variables::new();
        for (key, value) in input {
            if let Some(target) = self.fields.get(key.as_str()) {
                variables.insert(target.clone(), value);
            }
        }
        Ok(variables)
    }

    fn referenced_variables(&self) -> Vec<&VariableId> {
        self.fields.values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_input(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (VariableId::new(*k), v.clone()))
            .collect()
    }

    #[test]
    fn test_mapping_renames_and_drops() {
        let trigger = MappingTrigger::from_config(&json!({
            "fields": {"requester": "initiator"}
        }))
        .unwrap();

        let out = trigger
            .apply(make_input(&[("requester", json!("ann")), ("noise", json!(1))]))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[&VariableId::new("initiator")], json!("ann"));
    }

    #[test]
    fn test_mapping_required_keys() {
        let trigger = MappingTrigger::from_config(&json!({
            "fields": {"requester": "initiator"},
            "required": ["requester"]
        }))
        .unwrap();
        assert!(trigger.apply(Variables::new()).is_err());

        let invalid = MappingTrigger::from_config(&json!({
            "fields": {},
            "required": ["requester"]
        }));
        assert!(invalid.is_err());
    }
}
