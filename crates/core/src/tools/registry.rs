//! Tool Invocation Registry
//!
//! Holds the catalog of callable tools. Tools are registered once at startup;
//! afterwards the registry is shared read-only behind an `Arc`, so invocations
//! from different calls never contend on it.

use super::schema::ParameterSchema;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{Instrument, info, info_span, warn};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(15);

/// Static description of a tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

/// The advertised form of a tool: name, description and JSON Schema parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Per-invocation information handed to a handler.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    /// The call the invocation belongs to, if it came from a live session.
    pub call_id: Option<String>,
    /// Correlation id of the invocation (the model's function-call id).
    pub invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' not found")]
    NotFound(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("{0}")]
    ExecutionFailed(String),
    #[error("tool did not finish within {0:?}")]
    Timeout(Duration),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "tool_not_found",
            ToolError::InvalidArguments(_) => "invalid_arguments",
            ToolError::ExecutionFailed(_) => "execution_failed",
            ToolError::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("a tool named '{0}' is already registered")]
    Duplicate(String),
}

/// The capability behind a tool. Arguments have already passed schema validation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, args: Value, ctx: &ToolContext) -> Result<Value, ToolError>;
}

/// Result of [`ToolRegistry::invoke`]. Failures are data, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(ToolError),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    /// The structured payload delivered to the model or an HTTP caller.
    pub fn into_payload(self) -> Value {
        match self {
            ToolOutcome::Success(value) => value,
            ToolOutcome::Failure(err) => json!({
                "success": false,
                "error": { "code": err.code(), "message": err.to_string() },
            }),
        }
    }
}

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
}

pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    order: Vec<String>,
    timeout: Duration,
}

impl ToolRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
            timeout,
        }
    }

    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&descriptor.name) {
            return Err(RegistryError::Duplicate(descriptor.name));
        }
        info!(tool = %descriptor.name, "Registered tool");
        self.order.push(descriptor.name.clone());
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// The full catalog in registration order.
    pub fn list_schemas(&self) -> Vec<ToolSchema> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolSchema {
                name: tool.descriptor.name.clone(),
                description: tool.descriptor.description.clone(),
                parameters: tool.descriptor.parameters.to_json_schema(),
            })
            .collect()
    }

    /// Validates `args`, runs the handler and returns its outcome.
    ///
    /// The handler runs on its own task so that a panic or a timeout is
    /// reported as a failure payload instead of unwinding into the caller.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> ToolOutcome {
        let span = info_span!("tool_call", tool = %name, invocation_id = %ctx.invocation_id, call_id = ?ctx.call_id);
        async {
            let Some(tool) = self.tools.get(name) else {
                warn!("Model requested an unknown tool");
                return ToolOutcome::Failure(ToolError::NotFound(name.to_string()));
            };

            let args = match tool.descriptor.parameters.validate(args) {
                Ok(object) => Value::Object(object),
                Err(reason) => {
                    warn!(%reason, "Rejected tool arguments");
                    return ToolOutcome::Failure(ToolError::InvalidArguments(reason));
                }
            };

            let handler = tool.handler.clone();
            let task_ctx = ctx.clone();
            let mut task =
                tokio::spawn(async move { handler.call(args, &task_ctx).await }.in_current_span());

            match tokio::time::timeout(self.timeout, &mut task).await {
                Ok(Ok(Ok(value))) => {
                    info!("Tool finished");
                    ToolOutcome::Success(value)
                }
                Ok(Ok(Err(err))) => {
                    warn!(error = %err, "Tool failed");
                    ToolOutcome::Failure(err)
                }
                Ok(Err(join_err)) => {
                    warn!(error = %join_err, "Tool task aborted");
                    ToolOutcome::Failure(ToolError::ExecutionFailed(
                        "the tool crashed while running".to_string(),
                    ))
                }
                Err(_) => {
                    task.abort();
                    warn!(timeout = ?self.timeout, "Tool timed out");
                    ToolOutcome::Failure(ToolError::Timeout(self.timeout))
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}
