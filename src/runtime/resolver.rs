/// Binding resolution against an instance's lexical variable scope
///
/// A scope chain lists the variable stores visible from an activity instance,
/// innermost first: the activity instance's own store (when it is a scope
/// instance), each enclosing composite activity instance, then the root.

use crate::workflow::binding::{is_truthy, Binding, Condition};
use crate::workflow::ids::VariableId;
use crate::workflow::model::Variables;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BindingError {
    #[error("variable '{0}' is not declared in any visible scope")]
    Unresolved(VariableId),
    #[error("binding value does not match the expected type: {0}")]
    TypeMismatch(String),
}

/// Visible variable stores, innermost first
#[derive(Debug, Default)]
pub struct ScopeChain<'a> {
    stores: Vec<&'a Variables>,
}

impl<'a> ScopeChain<'a> {
    pub fn new(stores: Vec<&'a Variables>) -> Self {
        Self { stores }
    }

    /// Innermost value of a variable
    pub fn lookup(&self, id: &VariableId) -> Option<&'a Value> {
        self.stores.iter().find_map(|store| store.get(id))
    }
}

/// Resolve a binding to a JSON value
///
/// Lists resolve element by element, preserving declaration order.
pub fn resolve<T: Serialize>(binding: &Binding<T>, chain: &ScopeChain<'_>) -> Result<Value, BindingError> {
    match binding {
        Binding::Literal(value) => {
            serde_json::to_value(value).map_err(|e| BindingError::TypeMismatch(e.to_string()))
        }
        Binding::Variable(id) => chain
            .lookup(id)
            .cloned()
            .ok_or_else(|| BindingError::Unresolved(id.clone())),
        Binding::List(items) => items
            .iter()
            .map(|item| resolve(item, chain))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
    }
}

/// Resolve a binding to a single typed value
pub fn resolve_one<T>(binding: &Binding<T>, chain: &ScopeChain<'_>) -> Result<T, BindingError>
where
    T: Serialize + DeserializeOwned,
{
    let value = resolve(binding, chain)?;
    serde_json::from_value(value).map_err(|e| BindingError::TypeMismatch(e.to_string()))
}

/// Resolve a binding to a flat list: single values become one element, arrays
/// (from variables or list bindings) are flattened one level, null yields nothing
pub fn resolve_all<T>(binding: &Binding<T>, chain: &ScopeChain<'_>) -> Result<Vec<T>, BindingError>
where
    T: Serialize + DeserializeOwned,
{
    let mut values = Vec::new();
    flatten_into(resolve(binding, chain)?, &mut values);
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(|e| BindingError::TypeMismatch(e.to_string())))
        .collect()
}

fn flatten_into(value: Value, out: &mut Vec<Value>) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for item in items {
                flatten_into(item, out);
            }
        }
        other => out.push(other),
    }
}

/// Evaluate a transition condition
pub fn evaluate(condition: &Condition, chain: &ScopeChain<'_>) -> Result<bool, BindingError> {
    match condition {
        Condition::Equals(left, right) => Ok(resolve(left, chain)? == resolve(right, chain)?),
        Condition::NotEquals(left, right) => Ok(resolve(left, chain)? != resolve(right, chain)?),
        Condition::Truthy(binding) => Ok(is_truthy(&resolve(binding, chain)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn make_store(pairs: &[(&str, Value)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (VariableId::new(*k), v.clone()))
            .collect()
    }

    #[test]
    fn test_innermost_scope_wins() {
        let inner = make_store(&[("who", json!("inner"))]);
        let root = make_store(&[("who", json!("root")), ("only_root", json!(1))]);
        let chain = ScopeChain::new(vec![&inner, &root]);

        assert_eq!(resolve(&Binding::<Value>::variable("who"), &chain).unwrap(), json!("inner"));
        assert_eq!(resolve(&Binding::<Value>::variable("only_root"), &chain).unwrap(), json!(1));
    }

    #[test]
    fn test_unresolved_variable() {
        let root = Variables::new();
        let chain = ScopeChain::new(vec![&root]);
        let err = resolve(&Binding::<Value>::variable("ghost"), &chain).unwrap_err();
        assert_eq!(err, BindingError::Unresolved(VariableId::new("ghost")));
    }

    #[test]
    fn test_list_preserves_order_and_flattens() {
        let root = make_store(&[("b", json!("bob")), ("team", json!(["cy", "di"]))]);
        let chain = ScopeChain::new(vec![&root]);
        let binding: Binding<String> = Binding::List(vec![
            Binding::literal("al".to_string()),
            Binding::variable("b"),
            Binding::variable("team"),
        ]);

        assert_eq!(
            resolve(&binding, &chain).unwrap(),
            json!(["al", "bob", ["cy", "di"]])
        );
        assert_eq!(resolve_all(&binding, &chain).unwrap(), vec!["al", "bob", "cy", "di"]);
    }

    #[test]
    fn test_type_mismatch() {
        let root = make_store(&[("count", json!("seven"))]);
        let chain = ScopeChain::new(vec![&root]);
        let err = resolve_one(&Binding::<u64>::variable("count"), &chain).unwrap_err();
        assert!(matches!(err, BindingError::TypeMismatch(_)));
    }

    #[test]
    fn test_conditions() {
        let root = make_store(&[("decision", json!("approve")), ("flag", json!(false))]);
        let chain = ScopeChain::new(vec![&root]);

        let approve = Condition::Equals(Binding::variable("decision"), Binding::literal(json!("approve")));
        let reject = Condition::NotEquals(Binding::variable("decision"), Binding::literal(json!("approve")));
        assert!(evaluate(&approve, &chain).unwrap());
        assert!(!evaluate(&reject, &chain).unwrap());
        assert!(!evaluate(&Condition::Truthy(Binding::variable("flag")), &chain).unwrap());
    }
}
