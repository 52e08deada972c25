use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::flow::contexts::VariableScope;

/// 变量作用域实例
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableScopeInstance {
    values: BTreeMap<String, Value>,
}

impl VariableScopeInstance {
    /// 以声明的默认值初始化
    pub fn from_scope(scope: Option<&VariableScope>) -> Self {
        let values = scope
            .into_iter()
            .flat_map(|scope| scope.variables.iter())
            .filter_map(|decl| decl.default.clone().map(|value| (decl.name.clone(), value)))
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(name.into(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::contexts::VariableDeclaration;

    #[test]
    fn defaults_are_applied_once() {
        let scope = VariableScope {
            variables: vec![
                VariableDeclaration {
                    name: "total".into(),
                    default: Some(Value::from(0)),
                },
                VariableDeclaration {
                    name: "note".into(),
                    default: None,
                },
            ],
        };
        let mut instance = VariableScopeInstance::from_scope(Some(&scope));
        assert_eq!(instance.get("total"), Some(&Value::from(0)));
        assert!(!instance.contains("note"));

        assert_eq!(instance.set("total", Value::from(5)), Some(Value::from(0)));
        assert_eq!(instance.len(), 1);
    }
}
