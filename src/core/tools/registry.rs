//! Tool registration table.
//!
//! The registry is assembled at startup through [`ToolRegistryBuilder`] and
//! immutable for the life of the process. Sessions only ever hold it behind
//! an `Arc`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::upstream::messages::ToolSchema;
use crate::errors::BridgeError;

/// An invokable tool.
///
/// Handlers receive arguments that already passed schema validation and
/// return the JSON payload to inject into the conversation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError>;
}

/// One registered tool.
#[derive(Clone)]
pub struct ToolRegistration {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: Value,
    pub handler: Arc<dyn ToolHandler>,
}

/// Immutable name -> registration table.
pub struct ToolRegistry {
    tools: HashMap<String, ToolRegistration>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder {
            tools: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolRegistration> {
        self.tools.get(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool names, for the state machine's known-tool check.
    pub fn names(&self) -> HashSet<String> {
        self.tools.keys().cloned().collect()
    }

    /// Schemas in the shape the upstream endpoint expects, sorted by name
    /// for a stable negotiation payload.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .map(|t| ToolSchema {
                kind: "function".to_string(),
                name: t.name.clone(),
                description: Some(t.description.clone()),
                parameters: Some(t.parameters.clone()),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

/// Builder consumed by `build()`; registration after startup is impossible
/// by construction.
pub struct ToolRegistryBuilder {
    tools: HashMap<String, ToolRegistration>,
}

impl ToolRegistryBuilder {
    pub fn register(
        mut self,
        name: &str,
        description: &str,
        parameters: Value,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        self.tools.insert(
            name.to_string(),
            ToolRegistration {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
                handler,
            },
        );
        self
    }

    pub fn build(self) -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry { tools: self.tools })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
            Ok(Value::Object(args))
        }
    }

    #[test]
    fn test_lookup_and_names() {
        let registry = ToolRegistry::builder()
            .register("echo", "Echo the arguments", json!({"type": "object"}), Arc::new(Echo))
            .build();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.names().contains("echo"));
    }

    #[test]
    fn test_schemas_are_sorted_and_flat() {
        let registry = ToolRegistry::builder()
            .register("zeta", "z", json!({"type": "object"}), Arc::new(Echo))
            .register("alpha", "a", json!({"type": "object"}), Arc::new(Echo))
            .build();
        let schemas = registry.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
        assert_eq!(schemas[0].kind, "function");
    }
}
