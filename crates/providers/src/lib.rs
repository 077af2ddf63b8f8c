//! LLM provider implementations for Stepwise.
//!
//! All providers implement the `stepwise_core::Provider` trait.
//! The router selects the correct provider based on configuration.

pub mod embedder;
pub mod openai_compat;
pub mod router;

pub use embedder::ProviderEmbedder;
pub use openai_compat::OpenAiCompatProvider;
pub use router::ProviderRouter;
