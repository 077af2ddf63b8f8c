pub mod capabilities;
pub mod config_cmd;
pub mod memory;
pub mod run;

use std::sync::Arc;
use std::time::Duration;

use stepwise_config::AppConfig;
use stepwise_core::capability::CapabilityProvider;
use stepwise_core::memory::Embedder;
use stepwise_memory::{HashEmbedder, VectorStore};
use stepwise_providers::{ProviderEmbedder, ProviderRouter};
use tracing::{info, warn};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

pub fn load_config() -> Result<AppConfig, Box<dyn std::error::Error>> {
    Ok(AppConfig::load().map_err(|e| format!("Failed to load config: {e}"))?)
}

/// The configured servers, or the built-in set when asked for (or when none
/// are configured).
pub fn build_capabilities(config: &AppConfig, local: bool) -> Arc<dyn CapabilityProvider> {
    if !local {
        if let Some(provider) = stepwise_tools::connect_servers(config) {
            return provider;
        }
        warn!("No capability servers configured, using built-in capabilities");
    }
    Arc::new(stepwise_tools::builtin_capabilities())
}

pub fn build_embedder(config: &AppConfig, router: &ProviderRouter) -> Arc<dyn Embedder> {
    let name = config.memory.embedding_provider.as_str();
    if name != "hash" {
        match router.get(name) {
            Some(provider) => {
                info!(provider = name, model = %config.memory.embedding_model, "Using provider embeddings");
                return Arc::new(
                    ProviderEmbedder::new(provider, &config.memory.embedding_model)
                        .with_timeout(Duration::from_secs(config.memory.embedding_timeout_secs)),
                );
            }
            None => warn!(provider = name, "Embedding provider not available, using hash embeddings"),
        }
    }
    Arc::new(HashEmbedder::new(config.memory.dimension))
}

/// Open the persisted long-term store.
pub fn open_store(config: &AppConfig, router: &ProviderRouter) -> Result<Arc<VectorStore>, Box<dyn std::error::Error>> {
    let embedder = build_embedder(config, router);
    let store = VectorStore::open(
        config.memory_dir(),
        &config.memory.collection,
        embedder,
        config.memory.dimension,
    )?
    .with_oversample(config.memory.oversample_factor);
    Ok(Arc::new(store))
}
