//! Name-keyed tool dispatch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::error::{ToolError, ToolResult};
use super::schema::ToolSchema;

/// A typed, side-effecting capability. Tools are stateless with respect to
/// run state: inputs arrive explicitly and results go back to the caller,
/// which is responsible for writing them into the run.
#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    async fn call(&self, args: Value) -> ToolResult<Value>;
}

/// Process-wide registry. Initialised at startup; additions are new entries.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<DashMap<String, Arc<dyn Tool>>>,
    call_timeout: Duration,

    invocations_counter: Counter<u64>,
    errors_counter: Counter<u64>,
    invoke_latency: Histogram<f64>,
}

impl ToolRegistry {
    pub fn new(call_timeout: Duration) -> Self {
        let meter = global::meter("chancery.tool_registry");

        let invocations_counter = meter
            .u64_counter("chancery.tool_registry.invocations_total")
            .with_description("Total number of tool invocations")
            .init();

        let errors_counter = meter
            .u64_counter("chancery.tool_registry.errors_total")
            .with_description("Total number of tool errors")
            .init();

        let invoke_latency = meter
            .f64_histogram("chancery.tool_registry.invoke_latency_ms")
            .with_description("Tool invocation latency in milliseconds")
            .init();

        Self {
            tools: Arc::new(DashMap::new()),
            call_timeout,
            invocations_counter,
            errors_counter,
            invoke_latency,
        }
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.schema().name;
        info!(target: "tool_registry", tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|t| Arc::clone(&t))
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.iter().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Invoke a tool by name: validate arguments against the declared
    /// schema, run with a timeout, record metrics.
    #[tracing::instrument(skip(self, args), fields(tool.name = %name))]
    pub async fn call(&self, name: &str, args: Value) -> ToolResult<Value> {
        let started = std::time::Instant::now();

        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tool.schema().validate(&args)?;

        debug!(target: "tool_registry", tool = %name, "Invoking tool");

        let result = match timeout(self.call_timeout, tool.call(args)).await {
            Ok(res) => res,
            Err(_) => {
                warn!(target: "tool_registry", tool = %name, "Tool execution timed out");
                Err(ToolError::Timeout(name.to_string()))
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.invoke_latency
            .record(elapsed_ms, &[KeyValue::new("tool", name.to_string())]);

        match &result {
            Ok(_) => {
                self.invocations_counter.add(
                    1,
                    &[
                        KeyValue::new("tool", name.to_string()),
                        KeyValue::new("status", "success"),
                    ],
                );
            }
            Err(e) => {
                warn!(target: "tool_registry", tool = %name, error = %e, "Tool execution failed");
                self.errors_counter.add(
                    1,
                    &[
                        KeyValue::new("tool", name.to_string()),
                        KeyValue::new("recoverable", e.recoverable().to_string()),
                    ],
                );
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::schema::{ParamKind, ParamSpec};
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "echo".into(),
                description: "returns its input".into(),
                params: vec![ParamSpec::required("text", ParamKind::String, "input")],
                returns: "the input text".into(),
            }
        }

        async fn call(&self, args: Value) -> ToolResult<Value> {
            Ok(json!({"text": args["text"]}))
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn schema(&self) -> ToolSchema {
            ToolSchema {
                name: "slow".into(),
                description: "never finishes in time".into(),
                params: vec![],
                returns: "nothing".into(),
            }
        }

        async fn call(&self, _args: Value) -> ToolResult<Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn dispatches_by_name() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(EchoTool));
        let out = registry.call("echo", json!({"text": "oi"})).await.unwrap();
        assert_eq!(out["text"], "oi");
    }

    #[tokio::test]
    async fn unknown_tool_is_not_recoverable() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        let err = registry.call("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::NotFound(_)));
        assert!(!err.recoverable());
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_dispatch() {
        let registry = ToolRegistry::new(Duration::from_secs(5));
        registry.register(Arc::new(EchoTool));
        let err = registry.call("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn timeouts_are_recoverable() {
        let registry = ToolRegistry::new(Duration::from_millis(20));
        registry.register(Arc::new(SlowTool));
        let err = registry.call("slow", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
        assert!(err.recoverable());
    }
}
