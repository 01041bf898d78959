//! Tool dispatch with validation, isolation and a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::tools::registry::ToolRegistry;
use crate::core::tools::schema::validate_arguments;
use crate::errors::BridgeError;

/// Executes tool calls against the registry.
///
/// Handler failures never escape as raw errors and nothing here retries:
/// tools are not assumed idempotent. Exactly one of success payload,
/// `InvalidArguments`, `ToolExecution` or `ToolTimeout` comes back per
/// invocation.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke `name` with the raw JSON argument string from the model.
    pub async fn invoke(&self, name: &str, raw_args: &str) -> Result<Value, BridgeError> {
        let registration = self
            .registry
            .get(name)
            .ok_or_else(|| BridgeError::UnknownTool(name.to_string()))?;

        // Models occasionally send an empty argument string for zero-arg
        // tools.
        let raw = if raw_args.trim().is_empty() {
            "{}"
        } else {
            raw_args
        };
        let parsed: Value = serde_json::from_str(raw)
            .map_err(|e| BridgeError::InvalidArguments(format!("arguments are not JSON: {e}")))?;
        let args = validate_arguments(&parsed, &registration.parameters)?;

        debug!(tool = %name, "invoking tool");
        match tokio::time::timeout(self.timeout, registration.handler.call(args)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ BridgeError::InvalidArguments(_))) => Err(e),
            Ok(Err(e)) => {
                warn!(tool = %name, error = %e, "tool handler failed");
                Err(BridgeError::ToolExecution {
                    tool: name.to_string(),
                    cause: e.to_string(),
                })
            }
            Err(_) => {
                warn!(tool = %name, timeout = ?self.timeout, "tool handler timed out");
                Err(BridgeError::ToolTimeout(name.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{Map, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::core::tools::registry::ToolHandler;

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolHandler for Counting {
        async fn call(&self, args: Map<String, Value>) -> Result<Value, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Object(args))
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _args: Map<String, Value>) -> Result<Value, BridgeError> {
            Err(BridgeError::TaskService("503 from service".into()))
        }
    }

    struct Stalling;

    #[async_trait]
    impl ToolHandler for Stalling {
        async fn call(&self, _args: Map<String, Value>) -> Result<Value, BridgeError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({}))
        }
    }

    fn dispatcher_with(
        handler: Arc<dyn ToolHandler>,
        schema: Value,
        timeout: Duration,
    ) -> Dispatcher {
        let registry = ToolRegistry::builder()
            .register("echo_title", "test tool", schema, handler)
            .build();
        Dispatcher::new(registry, timeout)
    }

    fn title_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"title": {"type": "string"}},
            "required": ["title"]
        })
    }

    #[tokio::test]
    async fn test_invoke_passes_validated_args() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(
            Arc::new(Counting { calls: calls.clone() }),
            title_schema(),
            Duration::from_secs(5),
        );
        let out = d.invoke("echo_title", r#"{"title": "Buy milk"}"#).await.unwrap();
        assert_eq!(out["title"], "Buy milk");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_args_never_reach_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(
            Arc::new(Counting { calls: calls.clone() }),
            title_schema(),
            Duration::from_secs(5),
        );
        let err = d.invoke("echo_title", r#"{"priority": 3}"#).await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArguments(_)));

        let err = d.invoke("echo_title", "not json at all").await.unwrap_err();
        assert!(matches!(err, BridgeError::InvalidArguments(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_args_treated_as_empty_object() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher_with(
            Arc::new(Counting { calls: calls.clone() }),
            json!({"type": "object"}),
            Duration::from_secs(5),
        );
        d.invoke("echo_title", "").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let d = dispatcher_with(Arc::new(Failing), title_schema(), Duration::from_secs(5));
        let err = d.invoke("absent", "{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::UnknownTool(_)));
    }

    #[tokio::test]
    async fn test_handler_errors_are_wrapped() {
        let d = dispatcher_with(
            Arc::new(Failing),
            json!({"type": "object"}),
            Duration::from_secs(5),
        );
        let err = d.invoke("echo_title", "{}").await.unwrap_err();
        match err {
            BridgeError::ToolExecution { tool, cause } => {
                assert_eq!(tool, "echo_title");
                assert!(cause.contains("503"));
            }
            other => panic!("expected ToolExecution, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_exactly_one_timeout() {
        let d = dispatcher_with(
            Arc::new(Stalling),
            json!({"type": "object"}),
            Duration::from_secs(15),
        );
        let err = d.invoke("echo_title", "{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::ToolTimeout(_)));
    }
}
