//! In-process capabilities.
//!
//! A [`LocalTool`] is a plain Rust function with a JSON-schema signature.
//! [`LocalCapabilities`] exposes a set of them through the same
//! [`CapabilityProvider`] seam the RPC servers use, and answers in the same
//! `{"content": [...], "isError": false}` shape, so the dispatcher and the
//! agent cannot tell the difference.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use stepwise_core::capability::{CapabilityDescriptor, CapabilityProvider, integral_f64_to_i64};
use stepwise_core::error::DispatchError;
use thiserror::Error;
use tracing::debug;

/// Why a local tool refused or failed a call.
#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Execution(String),
}

/// A capability implemented in this process.
#[async_trait]
pub trait LocalTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. An array result is reported as one content item per
    /// element; anything else as a single item.
    async fn execute(&self, args: &Map<String, Value>) -> Result<Value, ToolFailure>;

    fn to_descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::from_json_schema(
            self.name(),
            self.description(),
            &self.parameters_schema(),
        )
    }
}

fn text_item(value: &Value) -> Value {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({ "type": "text", "text": text })
}

/// Wrap a tool result the way an MCP server would.
pub fn content_response(value: &Value) -> Value {
    let content: Vec<Value> = match value {
        Value::Array(items) => items.iter().map(text_item).collect(),
        other => vec![text_item(other)],
    };
    json!({ "content": content, "isError": false })
}

/// A named set of local tools, listed in registration order.
pub struct LocalCapabilities {
    name: String,
    tools: Vec<Box<dyn LocalTool>>,
    index: HashMap<String, usize>,
}

impl LocalCapabilities {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a tool. A later tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Box<dyn LocalTool>) {
        let name = tool.name().to_string();
        match self.index.get(&name) {
            Some(&i) => self.tools[i] = tool,
            None => {
                self.index.insert(name, self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn with(mut self, tool: Box<dyn LocalTool>) -> Self {
        self.register(tool);
        self
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl CapabilityProvider for LocalCapabilities {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, DispatchError> {
        Ok(self.tools.iter().map(|t| t.to_descriptor()).collect())
    }

    async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, DispatchError> {
        let tool = self
            .index
            .get(name)
            .map(|&i| &self.tools[i])
            .ok_or_else(|| DispatchError::NotFound(name.to_string()))?;

        debug!(tool = name, "Executing local tool");
        tool.execute(&args)
            .await
            .map(|value| content_response(&value))
            .map_err(|e| DispatchError::Remote {
                capability: name.to_string(),
                message: e.to_string(),
            })
    }
}

// ── Argument helpers shared by the built-in tools ─────────────────────────

pub(crate) fn arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a Value, ToolFailure> {
    args.get(key)
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("missing '{key}'")))
}

pub(crate) fn int_arg(args: &Map<String, Value>, key: &str) -> Result<i64, ToolFailure> {
    let value = arg(args, key)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().and_then(integral_f64_to_i64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("'{key}' must be an integer, got {value}")))
}

pub(crate) fn number_arg(args: &Map<String, Value>, key: &str) -> Result<f64, ToolFailure> {
    let value = arg(args, key)?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("'{key}' must be a number, got {value}")))
}

pub(crate) fn string_arg<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolFailure> {
    let value = arg(args, key)?;
    value
        .as_str()
        .ok_or_else(|| ToolFailure::InvalidArguments(format!("'{key}' must be a string, got {value}")))
}

/// Render a float without a trailing `.0` when it is integral.
pub(crate) fn number_value(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        json!(value as i64)
    } else {
        json!(value)
    }
}
