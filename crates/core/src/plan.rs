//! What the perception and decision stages produce.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Prefix of a line that requests a capability invocation.
pub const FUNCTION_CALL_MARKER: &str = "FUNCTION_CALL:";

/// Prefix of a line that ends the session with an answer.
pub const FINAL_ANSWER_MARKER: &str = "FINAL_ANSWER:";

/// Structured reading of the user's request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionResult {
    pub user_input: String,

    #[serde(default)]
    pub intent: Option<String>,

    #[serde(default)]
    pub entities: Vec<String>,

    #[serde(default)]
    pub tool_hint: Option<String>,
}

impl PerceptionResult {
    /// The result used when extraction fails: input only.
    pub fn bare(user_input: impl Into<String>) -> Self {
        Self {
            user_input: user_input.into(),
            intent: None,
            entities: Vec::new(),
            tool_hint: None,
        }
    }
}

/// The single next action chosen for an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanDecision {
    FunctionCall { name: String, args: Map<String, Value> },
    FinalAnswer { text: String },
}
