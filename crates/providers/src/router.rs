//! Provider router: selects the correct LLM provider based on config.

use std::collections::HashMap;
use std::sync::Arc;

use stepwise_core::provider::Provider;

use crate::openai_compat::OpenAiCompatProvider;

/// Holds every configured provider by name.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    /// Create a new router with a default provider.
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    /// Register a provider.
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get the default provider.
    pub fn default(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    /// Get a specific provider by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// List all registered provider names.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}

fn build_provider(
    name: &str,
    config: &stepwise_config::AppConfig,
) -> Arc<dyn Provider> {
    let provider_config = config.providers.get(name);
    let api_key = provider_config
        .and_then(|p| p.api_key.clone())
        .or_else(|| config.api_key.clone())
        .unwrap_or_default();
    let base_url = provider_config
        .and_then(|p| p.api_url.clone())
        .unwrap_or_else(|| default_base_url(name));
    Arc::new(OpenAiCompatProvider::new(name, &base_url, &api_key))
}

/// Build providers from configuration.
///
/// The default provider, and the embedding provider when it names one, are
/// always registered even without an explicit `[providers.*]` table.
pub fn build_from_config(config: &stepwise_config::AppConfig) -> ProviderRouter {
    let mut router = ProviderRouter::new(&config.default_provider);

    for name in config.providers.keys() {
        router.register(name.clone(), build_provider(name, config));
    }

    let mut implicit = vec![config.default_provider.as_str()];
    if config.memory.embedding_provider != "hash" {
        implicit.push(config.memory.embedding_provider.as_str());
    }
    for name in implicit {
        if router.get(name).is_none() {
            router.register(name, build_provider(name, config));
        }
    }

    router
}

/// Get the default base URL for well-known providers.
fn default_base_url(provider_name: &str) -> String {
    match provider_name {
        "openrouter" => "https://openrouter.ai/api/v1".into(),
        "openai" => "https://api.openai.com/v1".into(),
        "ollama" => "http://localhost:11434/v1".into(),
        "deepseek" => "https://api.deepseek.com/v1".into(),
        "groq" => "https://api.groq.com/openai/v1".into(),
        "together" => "https://api.together.xyz/v1".into(),
        "vllm" => "http://localhost:8000/v1".into(),
        "lmstudio" => "http://localhost:1234/v1".into(),
        "llamacpp" | "llama.cpp" => "http://localhost:8080/v1".into(),
        _ => format!("https://{provider_name}.api.example.com/v1"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_config::{AppConfig, ProviderConfig};

    #[test]
    fn router_register_and_lookup() {
        let mut router = ProviderRouter::new("openai");
        let provider = Arc::new(OpenAiCompatProvider::openai("sk-test"));
        router.register("openai", provider);

        assert!(router.get("openai").is_some());
        assert!(router.get("nonexistent").is_none());
        assert!(router.default().is_some());
    }

    #[test]
    fn default_base_urls() {
        assert!(default_base_url("openrouter").contains("openrouter.ai"));
        assert!(default_base_url("openai").contains("api.openai.com"));
        assert!(default_base_url("ollama").contains("localhost:11434"));
    }

    #[test]
    fn build_from_default_config() {
        let config = AppConfig::default();
        let router = build_from_config(&config);
        assert!(router.default().is_some());
        assert_eq!(router.list(), vec!["ollama"]);
    }

    #[test]
    fn embedding_provider_is_registered() {
        let mut config = AppConfig::default();
        config.memory.embedding_provider = "openai".into();
        config.providers.insert(
            "ollama".into(),
            ProviderConfig {
                api_key: None,
                api_url: Some("http://gpu-box:11434/v1".into()),
                default_model: None,
            },
        );
        let router = build_from_config(&config);
        assert!(router.get("openai").is_some());
        assert!(router.get("ollama").is_some());
        assert_eq!(router.list().len(), 2);
    }
}
