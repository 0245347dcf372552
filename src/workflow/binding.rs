/// Bindings and transition conditions
///
/// A binding is a typed reference that resolves at runtime either to a literal
/// embedded in the definition or to a variable visible from the activity's scope.
/// Bindings are part of the immutable definition model; resolution lives in
/// `runtime::resolver`.

use crate::workflow::ids::VariableId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed value source
///
/// JSON shape: `{"literal": v}`, `{"variable": "id"}` or `{"list": [binding, ...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binding<T> {
    Literal(T),
    Variable(VariableId),
    List(Vec<Binding<T>>),
}

impl<T> Binding<T> {
    pub fn literal(value: T) -> Self {
        Binding::Literal(value)
    }

    pub fn variable(id: impl Into<String>) -> Self {
        Binding::Variable(VariableId::new(id))
    }

    /// All variables referenced by this binding, in declaration order
    pub fn variables(&self) -> Vec<&VariableId> {
        let mut refs = Vec::new();
        self.collect_variables(&mut refs);
        refs
    }

    fn collect_variables<'a>(&'a self, refs: &mut Vec<&'a VariableId>) {
        match self {
            Binding::Literal(_) => {}
            Binding::Variable(id) => refs.push(id),
            Binding::List(items) => {
                for item in items {
                    item.collect_variables(refs);
                }
            }
        }
    }
}

/// Guard on a transition
///
/// A transition without a condition is always taken by `Onwards`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals(Binding<Value>, Binding<Value>),
    NotEquals(Binding<Value>, Binding<Value>),
    /// Holds for any value other than null, false, 0, "" and empty collections
    Truthy(Binding<Value>),
}

impl Condition {
    pub fn variables(&self) -> Vec<&VariableId> {
        match self {
            Condition::Equals(left, right) | Condition::NotEquals(left, right) => {
                let mut refs = left.variables();
                refs.extend(right.variables());
                refs
            }
            Condition::Truthy(binding) => binding.variables(),
        }
    }
}

/// JavaScript-like truthiness used by `Condition::Truthy`
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binding_json_shapes() {
        let literal: Binding<String> = serde_json::from_value(json!({"literal": "boss"})).unwrap();
        assert_eq!(literal, Binding::literal("boss".to_string()));

        let variable: Binding<String> = serde_json::from_value(json!({"variable": "manager"})).unwrap();
        assert_eq!(variable, Binding::variable("manager"));

        let list: Binding<String> = serde_json::from_value(json!({
            "list": [{"literal": "a"}, {"variable": "b"}]
        }))
        .unwrap();
        assert_eq!(list.variables(), vec![&VariableId::new("b")]);
    }

    #[test]
    fn test_condition_variables() {
        let condition: Condition = serde_json::from_value(json!({
            "equals": [{"variable": "decision"}, {"literal": "approve"}]
        }))
        .unwrap();
        assert_eq!(condition.variables(), vec![&VariableId::new("decision")]);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(is_truthy(&json!("yes")));
        assert!(is_truthy(&json!([1])));
        assert!(!is_truthy(&json!({})));
    }
}
