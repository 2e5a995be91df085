//! Tool registry.
//!
//! Tools are registered up front with a JSON Schema for their parameters
//! and an async executor. The registry resolves names case-insensitively,
//! validates inputs against the compiled schema before dispatch, and
//! enforces a per-invocation timeout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use jsonschema::Draft;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value;

use crate::core::errors::RuntimeError;
use crate::core::errors::RuntimeResult;

/// Declarative description of a tool, advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input object.
    pub parameters: Value,
}

/// Future returned by a tool executor.
pub type ToolFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Async tool executor. Receives the validated input object.
pub type ToolExecutor = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

/// A tool ready for registration: schema plus executor.
#[derive(Clone)]
pub struct ToolDescriptor {
    pub schema: ToolSchema,
    pub executor: ToolExecutor,
}

impl ToolDescriptor {
    /// Builds a descriptor from an async closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        executor: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            schema: ToolSchema {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            executor: Arc::new(move |input| -> ToolFuture { Box::pin(executor(input)) }),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
struct RegisteredTool {
    schema: ToolSchema,
    validator: Arc<JSONSchema>,
    executor: ToolExecutor,
}

/// Registry of available tools, keyed by lowercased name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    /// Registration order, for stable schema advertisement.
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool. Fails on duplicate names (case-insensitive) and on
    /// parameter schemas that do not compile.
    pub fn register(&mut self, descriptor: ToolDescriptor) -> RuntimeResult<()> {
        let key = descriptor.schema.name.to_lowercase();
        if self.tools.contains_key(&key) {
            return Err(RuntimeError::duplicate_tool(&descriptor.schema.name));
        }
        let validator = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&descriptor.schema.parameters)
            .map_err(|err| {
                RuntimeError::invalid_parameters(&descriptor.schema.name, err.to_string())
            })?;
        tracing::debug!(tool = %descriptor.schema.name, "registered tool");
        self.order.push(key.clone());
        self.tools.insert(
            key,
            RegisteredTool {
                schema: descriptor.schema,
                validator: Arc::new(validator),
                executor: descriptor.executor,
            },
        );
        Ok(())
    }

    /// Schemas in registration order, for the model request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|key| self.tools.get(key))
            .map(|tool| tool.schema.clone())
            .collect()
    }

    /// Resolves a tool by name (case-insensitive).
    pub fn resolve(&self, name: &str) -> RuntimeResult<&ToolSchema> {
        self.tools
            .get(&name.to_lowercase())
            .map(|tool| &tool.schema)
            .ok_or_else(|| RuntimeError::unknown_tool(name))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validates `input` against the tool's parameter schema.
    pub fn validate(&self, name: &str, input: &Value) -> RuntimeResult<()> {
        let tool = self
            .tools
            .get(&name.to_lowercase())
            .ok_or_else(|| RuntimeError::unknown_tool(name))?;
        if let Err(errors) = tool.validator.validate(input) {
            let details: Vec<String> = errors.map(|err| err.to_string()).collect();
            return Err(RuntimeError::invalid_parameters(name, details.join("; ")));
        }
        Ok(())
    }

    /// Resolves, validates, and runs a tool under `timeout`.
    ///
    /// Returns the executor's raw output value; envelope construction is
    /// the caller's concern.
    pub async fn invoke(
        &self,
        name: &str,
        input: &Value,
        timeout: Option<Duration>,
    ) -> RuntimeResult<Value> {
        let tool = self
            .tools
            .get(&name.to_lowercase())
            .ok_or_else(|| RuntimeError::unknown_tool(name))?;
        self.validate(name, input)?;

        let future = (tool.executor)(input.clone());
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => return Err(RuntimeError::tool_timeout(name, limit.as_secs())),
            },
            None => future.await,
        };
        result.map_err(|err| RuntimeError::tool_execution(name, &err))
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;
    use serde_json::json;

    fn adder() -> ToolDescriptor {
        ToolDescriptor::new(
            "adder",
            "Adds two integers",
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"}
                },
                "required": ["a", "b"]
            }),
            |input: Value| async move {
                let a = input["a"].as_i64().unwrap_or(0);
                let b = input["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            },
        )
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let err = registry.register(adder()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateTool);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_detection_is_case_insensitive() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let mut shadow = adder();
        shadow.schema.name = "Adder".to_string();
        let err = registry.register(shadow).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateTool);
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("missing", &json!({}), None).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownTool);
        assert_eq!(
            registry.resolve("missing").unwrap_err().kind,
            ErrorKind::UnknownTool
        );
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        assert_eq!(registry.resolve("ADDER").unwrap().name, "adder");
    }

    #[tokio::test]
    async fn test_invoke_validates_parameters() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let err = registry
            .invoke("adder", &json!({"a": "two"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidParameters);
        assert!(err.details.is_some());
    }

    #[tokio::test]
    async fn test_invoke_runs_executor() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let result = registry
            .invoke("adder", &json!({"a": 2, "b": 2}), None)
            .await
            .unwrap();
        assert_eq!(result, json!(4));
    }

    #[tokio::test]
    async fn test_invoke_times_out() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolDescriptor::new(
                "sleeper",
                "Never finishes",
                json!({"type": "object"}),
                |_input: Value| async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(json!(null))
                },
            ))
            .unwrap();
        let err = registry
            .invoke("sleeper", &json!({}), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ToolExecution);
        assert!(err.message.contains("timed out"));
    }

    #[test]
    fn test_schemas_keep_registration_order() {
        let mut registry = ToolRegistry::new();
        registry.register(adder()).unwrap();
        let mut second = adder();
        second.schema.name = "zeta".to_string();
        registry.register(second).unwrap();
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["adder", "zeta"]);
    }
}
