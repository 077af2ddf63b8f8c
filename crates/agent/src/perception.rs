//! Perception: a structured reading of the user's request.
//!
//! The model is asked for a small JSON object; whatever comes back is
//! cleaned and parsed leniently. Any failure yields a bare result so the
//! loop always proceeds.

use std::sync::Arc;

use serde_json::Value;
use stepwise_core::capability::CapabilityRegistry;
use stepwise_core::plan::PerceptionResult;
use tracing::{debug, warn};

use crate::llm::TextGenerator;
use crate::protocol::normalize_quasi_json;

/// First line of every perception prompt.
pub const PERCEPTION_HEADER: &str = "You extract structured facts from a user request.";

pub struct Perceiver {
    generator: Arc<TextGenerator>,
}

impl Perceiver {
    pub fn new(generator: Arc<TextGenerator>) -> Self {
        Self { generator }
    }

    /// Interpret `user_text`. Never fails.
    pub async fn extract(&self, user_text: &str) -> PerceptionResult {
        self.extract_with(user_text, None).await
    }

    /// Interpret `user_text`, offering the registry's names as hint candidates.
    pub async fn extract_for(&self, user_text: &str, registry: &CapabilityRegistry) -> PerceptionResult {
        self.extract_with(user_text, Some(registry)).await
    }

    async fn extract_with(
        &self,
        user_text: &str,
        registry: Option<&CapabilityRegistry>,
    ) -> PerceptionResult {
        let prompt = build_prompt(user_text, registry);
        match self.generator.generate(&prompt).await {
            Ok(raw) => parse_perception(user_text, &raw).unwrap_or_else(|| {
                warn!(raw = %raw, "Could not parse perception, continuing without it");
                PerceptionResult::bare(user_text)
            }),
            Err(e) => {
                warn!(error = %e, "Perception failed, continuing without it");
                PerceptionResult::bare(user_text)
            }
        }
    }
}

pub fn build_prompt(user_text: &str, registry: Option<&CapabilityRegistry>) -> String {
    let hint_line = match registry {
        Some(registry) if !registry.is_empty() => format!(
            "- tool_hint: the capability most likely to help, one of [{}], or null\n",
            registry.names().join(", ")
        ),
        _ => "- tool_hint: the name of a capability that might help, or null\n".to_string(),
    };
    format!(
        "{PERCEPTION_HEADER}\n\n\
         Input: \"{user_text}\"\n\n\
         Return one JSON object on a single line with keys:\n\
         - intent: a short phrase describing what the user wants\n\
         - entities: a list of strings with the keywords or values involved (e.g. [\"INDIA\", \"ASCII\"])\n\
         {hint_line}\n\
         Output only the object. Do not wrap it in code fences. `entities` must be a list, not a mapping."
    )
}

/// Strip code fences and surrounding prose, keeping the outermost `{...}`.
fn extract_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (start < end).then(|| &raw[start..=end])
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Null => return None,
        other => other.to_string(),
    };
    match text.as_str() {
        "" | "None" | "null" | "none" => None,
        _ => Some(text),
    }
}

fn entity_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse a model response into a perception. `None` when unusable.
pub fn parse_perception(user_input: &str, raw: &str) -> Option<PerceptionResult> {
    let object = extract_object(raw)?;
    let parsed: Value = serde_json::from_str(&normalize_quasi_json(object)).ok()?;
    let fields = parsed.as_object()?;

    let entities = match fields.get("entities") {
        Some(Value::Array(items)) => items.iter().map(entity_text).collect(),
        Some(Value::Object(map)) => map.values().map(entity_text).collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    };

    let result = PerceptionResult {
        user_input: user_input.to_string(),
        intent: optional_text(fields.get("intent")),
        entities,
        tool_hint: optional_text(fields.get("tool_hint")),
    };
    debug!(intent = ?result.intent, hint = ?result.tool_hint, "Perception parsed");
    Some(result)
}
