//! Typed environment for expression evaluation
//!
//! The environment resolves three namespaces: `schema` (the instance's spec
//! and metadata), node-id bindings (the live objects of already-resolved
//! nodes), and constants.

use std::collections::BTreeMap;

use super::value::Value;

/// Root-name bindings available to an expression
#[derive(Clone, Debug, Default)]
pub struct Environment {
    bindings: BTreeMap<String, Value>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the `schema` namespace (spec + metadata of the instance)
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.bindings.insert("schema".to_string(), schema);
        self
    }

    /// Bind a root name (a node id or a constant) to a value
    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.bindings.insert(name.into(), value);
    }

    /// Bind a root name, builder style
    pub fn with_binding(mut self, name: impl Into<String>, value: Value) -> Self {
        self.bind(name, value);
        self
    }

    /// Resolve a root name
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// True if a root name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
    }

    /// Names bound in this environment
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.bindings.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_namespace() {
        let env = Environment::new()
            .with_schema(Value::from(serde_json::json!({"spec": {"name": "web"}})));
        assert!(env.contains("schema"));
        assert!(!env.contains("db"));
    }

    #[test]
    fn test_node_bindings() {
        let mut env = Environment::new();
        env.bind("db", Value::from(serde_json::json!({"status": {"ready": true}})));
        assert!(env.resolve("db").is_some());
        assert_eq!(env.names().collect::<Vec<_>>(), vec!["db"]);
    }
}
