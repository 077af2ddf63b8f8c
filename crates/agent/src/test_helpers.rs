//! Shared test helpers: scripted providers.

use std::collections::VecDeque;
use std::sync::Mutex;

use stepwise_core::error::ProviderError;
use stepwise_core::message::Message;
use stepwise_core::provider::{Provider, ProviderRequest, ProviderResponse, Usage};

use crate::perception::PERCEPTION_HEADER;

/// A mock provider that returns a sequence of scripted results.
///
/// Panics if more calls are made than results provided.
pub struct SequentialMockProvider {
    responses: Mutex<VecDeque<Result<ProviderResponse, ProviderError>>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl SequentialMockProvider {
    pub fn new(responses: Vec<Result<ProviderResponse, ProviderError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn texts(texts: &[&str]) -> Self {
        Self::new(texts.iter().map(|t| Ok(make_text_response(t))).collect())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ProviderRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl Provider for SequentialMockProvider {
    fn name(&self) -> &str {
        "sequential_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let mut requests = self.requests.lock().unwrap();
        requests.push(request);
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            panic!(
                "SequentialMockProvider: no more responses (call #{})",
                requests.len()
            )
        })
    }
}

/// Answers perception prompts with a fixed object and planning prompts
/// from a script. Once the script runs out the last plan repeats.
pub struct AgentScript {
    perception: String,
    plans: Mutex<VecDeque<Result<String, ProviderError>>>,
    last_plan: Mutex<String>,
    plan_prompts: Mutex<Vec<String>>,
}

impl AgentScript {
    pub fn new(plans: &[&str]) -> Self {
        Self::with_results(plans.iter().map(|p| Ok(p.to_string())).collect())
    }

    pub fn with_results(plans: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            perception: r#"{"intent": "solve the task", "entities": [], "tool_hint": null}"#.into(),
            plans: Mutex::new(plans.into()),
            last_plan: Mutex::new("FINAL_ANSWER: unknown".into()),
            plan_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_perception(mut self, perception: &str) -> Self {
        self.perception = perception.to_string();
        self
    }

    pub fn plan_prompts(&self) -> Vec<String> {
        self.plan_prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Provider for AgentScript {
    fn name(&self) -> &str {
        "agent_script"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if prompt.starts_with(PERCEPTION_HEADER) {
            return Ok(make_text_response(&self.perception));
        }

        self.plan_prompts.lock().unwrap().push(prompt);
        let next = self.plans.lock().unwrap().pop_front();
        let mut last = self.last_plan.lock().unwrap();
        match next {
            Some(Ok(plan)) => {
                *last = plan.clone();
                Ok(make_text_response(&plan))
            }
            Some(Err(e)) => Err(e),
            None => Ok(make_text_response(&last)),
        }
    }
}

/// Never answers within any reasonable deadline.
pub struct SlowProvider;

#[async_trait::async_trait]
impl Provider for SlowProvider {
    fn name(&self) -> &str {
        "slow"
    }

    async fn complete(&self, _request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(make_text_response("too late"))
    }
}

/// Create a simple text response.
pub fn make_text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        }),
        model: "mock-model".into(),
    }
}
