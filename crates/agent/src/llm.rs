//! Prompt-in, text-out access to the configured model.

use std::sync::Arc;
use std::time::Duration;

use stepwise_core::error::ProviderError;
use stepwise_core::provider::{Provider, ProviderRequest};
use tracing::{debug, warn};

/// Sends single prompts to a provider under a per-call deadline.
///
/// A timeout is an error for that call and is never retried here.
pub struct TextGenerator {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    timeout: Duration,
}

impl TextGenerator {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: 0.2,
            max_tokens: None,
            timeout: Duration::from_secs(8),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a completion for one prompt. Returns the trimmed text.
    pub async fn generate(&self, prompt: &str) -> Result<String, ProviderError> {
        let mut request = ProviderRequest::prompt(&self.model, prompt);
        request.temperature = self.temperature;
        request.max_tokens = self.max_tokens;

        debug!(
            provider = self.provider.name(),
            model = %self.model,
            prompt_chars = prompt.len(),
            "Generating"
        );

        match tokio::time::timeout(self.timeout, self.provider.complete(request)).await {
            Ok(Ok(response)) => Ok(response.message.content.trim().to_string()),
            Ok(Err(e)) => {
                warn!(provider = self.provider.name(), error = %e, "Generation failed");
                Err(e)
            }
            Err(_) => {
                warn!(
                    provider = self.provider.name(),
                    timeout_secs = self.timeout.as_secs(),
                    "Generation timed out"
                );
                Err(ProviderError::Timeout(format!(
                    "no response from {} within {}s",
                    self.provider.name(),
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{SequentialMockProvider, SlowProvider};

    #[tokio::test]
    async fn returns_trimmed_text() {
        let provider = Arc::new(SequentialMockProvider::texts(&["  FINAL_ANSWER: 5 \n"]));
        let generator = TextGenerator::new(provider.clone(), "mock-model");
        assert_eq!(generator.generate("2+3?").await.unwrap(), "FINAL_ANSWER: 5");
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn request_carries_settings() {
        let provider = Arc::new(SequentialMockProvider::texts(&["ok"]));
        let generator = TextGenerator::new(provider.clone(), "llama3.2")
            .with_temperature(0.0)
            .with_max_tokens(64);
        generator.generate("hello").await.unwrap();

        let request = provider.last_request().unwrap();
        assert_eq!(request.model, "llama3.2");
        assert_eq!(request.temperature, 0.0);
        assert_eq!(request.max_tokens, Some(64));
        assert_eq!(request.messages[0].content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let generator = TextGenerator::new(Arc::new(SlowProvider), "m").with_timeout(Duration::from_secs(2));
        let err = generator.generate("hi").await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let provider = Arc::new(SequentialMockProvider::new(vec![Err(ProviderError::Network(
            "connection refused".into(),
        ))]));
        let generator = TextGenerator::new(provider, "m");
        assert!(matches!(generator.generate("hi").await, Err(ProviderError::Network(_))));
    }
}
