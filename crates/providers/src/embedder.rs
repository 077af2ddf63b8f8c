//! Embedder backed by a provider's `/embeddings` endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stepwise_core::error::{MemoryError, ProviderError};
use stepwise_core::memory::Embedder;
use stepwise_core::provider::{EmbeddingRequest, Provider};
use tracing::warn;

/// Adapts a [`Provider`] into an [`Embedder`] for one model.
pub struct ProviderEmbedder {
    provider: Arc<dyn Provider>,
    model: String,
    timeout: Duration,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let request = EmbeddingRequest {
            model: self.model.clone(),
            inputs: vec![text.to_string()],
        };
        let response = tokio::time::timeout(self.timeout, self.provider.embed(request))
            .await
            .map_err(|_| ProviderError::Timeout(format!("embedding after {:?}", self.timeout)))
            .and_then(|r| r)
            .map_err(|e| {
                warn!(provider = self.provider.name(), error = %e, "Embedding request failed");
                MemoryError::EmbeddingFailed(e.to_string())
            })?;

        response
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemoryError::EmbeddingFailed("provider returned no embeddings".into()))
    }
}
