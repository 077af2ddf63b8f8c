//! Decision stage: pick exactly one next action.

use std::sync::Arc;

use stepwise_core::capability::CapabilityRegistry;
use stepwise_core::error::ProviderError;
use stepwise_core::memory::Recalled;
use stepwise_core::plan::{FINAL_ANSWER_MARKER, FUNCTION_CALL_MARKER, PerceptionResult};
use tracing::debug;

use crate::llm::TextGenerator;

/// Returned when the response holds no marker line.
pub const UNKNOWN_ANSWER: &str = "FINAL_ANSWER: unknown";

/// Everything the planner sees for one step.
pub struct PlanContext<'a> {
    pub perception: &'a PerceptionResult,
    pub memories: &'a [Recalled],
    pub registry: &'a CapabilityRegistry,
    /// 1-based step about to run.
    pub step: usize,
    pub max_steps: usize,
    pub previous_result: Option<&'a str>,
    /// The session's ephemeral log so far.
    pub session_log: &'a str,
}

pub struct Planner {
    generator: Arc<TextGenerator>,
}

impl Planner {
    pub fn new(generator: Arc<TextGenerator>) -> Self {
        Self { generator }
    }

    /// Ask the model for the next action and return its action line.
    /// Backend failures are returned to the caller.
    pub async fn plan(&self, context: &PlanContext<'_>) -> Result<String, ProviderError> {
        let prompt = build_prompt(context);
        let raw = self.generator.generate(&prompt).await?;
        let line = select_action_line(&raw);
        debug!(step = context.step, plan = %line, "Plan selected");
        Ok(line)
    }
}

/// The first trimmed line that starts with a marker, else [`UNKNOWN_ANSWER`].
pub fn select_action_line(raw: &str) -> String {
    raw.lines()
        .map(str::trim)
        .find(|line| line.starts_with(FUNCTION_CALL_MARKER) || line.starts_with(FINAL_ANSWER_MARKER))
        .unwrap_or(UNKNOWN_ANSWER)
        .to_string()
}

pub fn build_prompt(context: &PlanContext<'_>) -> String {
    let perception = context.perception;
    let memories = if context.memories.is_empty() {
        "None".to_string()
    } else {
        context
            .memories
            .iter()
            .map(|m| format!("- {}", m.item.text))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut prompt = format!(
        "You are a reasoning agent that solves the user's request one step at a time.\n\
         Each step you either call one capability or give the final answer.\n\n\
         Available capabilities:\n{}\n\n\
         This is step {} of {}; a FINAL_ANSWER is mandatory by step {}.\n",
        context.registry.catalogue(),
        context.step,
        context.max_steps,
        context.max_steps,
    );

    if let Some(previous) = context.previous_result {
        prompt.push_str(&format!(
            "\nPrevious capability output:\n```\n{previous}\n```\n\
             Use it: either call a capability with different arguments, or give the FINAL_ANSWER.\n"
        ));
    }
    if !context.session_log.is_empty() {
        prompt.push_str(&format!("\nSession log:\n{}\n", context.session_log));
    }

    prompt.push_str(&format!(
        "\nRelevant memories:\n{memories}\n\n\
         Request:\n\
         - User input: \"{}\"\n\
         - Intent: {}\n\
         - Entities: {}\n\
         - Capability hint: {}\n\n\
         Respond with exactly one line in one of these forms:\n\
         {FUNCTION_CALL_MARKER} {{\"name\": \"<capability>\", \"args\": {{\"<parameter>\": <value>}}}}\n\
         {FINAL_ANSWER_MARKER} <answer>\n\n\
         Rules:\n\
         - Use only the capabilities listed above, with arguments keyed by parameter name.\n\
         - Never repeat an identical call; use its result instead.\n\
         - If no capability fits or you are unsure, answer {FINAL_ANSWER_MARKER} unknown.\n\
         - On step {} you must give the {FINAL_ANSWER_MARKER} line.\n",
        perception.user_input,
        perception.intent.as_deref().unwrap_or("unknown"),
        perception.entities.join(", "),
        perception.tool_hint.as_deref().unwrap_or("None"),
        context.max_steps,
    ));
    prompt
}
