//! Executes validated actions and normalizes what comes back.
//!
//! Capability servers answer in several shapes. They are folded into
//! [`ToolOutput`] here, once, so nothing downstream inspects raw JSON:
//!
//! | raw response                               | output       |
//! |--------------------------------------------|--------------|
//! | `{"content": [...]}`                       | `List`       |
//! | `{"structuredContent": {...}}` w/o content | `Structured` |
//! | a JSON string                              | `Text`       |
//! | anything else                              | `Text` (JSON)|

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};
use stepwise_core::capability::{CapabilityProvider, ToolCallResult, ToolOutput};
use stepwise_core::error::DispatchError;
use tracing::{debug, warn};

pub struct Dispatcher {
    provider: Arc<dyn CapabilityProvider>,
}

impl Dispatcher {
    pub fn new(provider: Arc<dyn CapabilityProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn CapabilityProvider> {
        &self.provider
    }

    /// Invoke a capability. Failures are returned, never swallowed.
    pub async fn execute(
        &self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<ToolCallResult, DispatchError> {
        let started = Instant::now();
        let raw = self
            .provider
            .invoke(name, args.clone())
            .await
            .inspect_err(|e| warn!(tool = name, error = %e, "Capability invocation failed"))?;

        let result = normalize(&raw);
        debug!(
            tool = name,
            duration_ms = started.elapsed().as_millis() as u64,
            result = %result,
            "Capability returned"
        );

        Ok(ToolCallResult {
            tool_name: name.to_string(),
            arguments: args,
            result,
            raw_response: raw,
        })
    }
}

fn item_text(item: &Value) -> String {
    match item.get("text").and_then(Value::as_str) {
        Some(text) => text.to_string(),
        None => match item {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

/// Fold a raw capability response into a [`ToolOutput`].
pub fn normalize(raw: &Value) -> ToolOutput {
    if let Some(items) = raw.get("content").and_then(Value::as_array) {
        return ToolOutput::List(items.iter().map(item_text).collect());
    }
    if let Some(structured) = raw.get("structuredContent").and_then(Value::as_object) {
        return ToolOutput::Structured(structured.clone());
    }
    match raw {
        Value::String(text) => ToolOutput::Text(text.clone()),
        Value::Array(items) => ToolOutput::List(items.iter().map(item_text).collect()),
        other => ToolOutput::Text(other.to_string()),
    }
}
