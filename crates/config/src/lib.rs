//! Configuration loading, validation, and management for Stepwise.
//!
//! Loads configuration from `~/.stepwise/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.stepwise/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// API key (can be overridden per-provider)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Loop budget and timeouts
    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    /// Capability transport settings
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Provider-specific configurations
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Capability servers launched over stdio
    #[serde(default)]
    pub capability_servers: Vec<CapabilityServerConfig>,
}

fn default_provider() -> String {
    "ollama".into()
}
fn default_model() -> String {
    "llama3.2".into()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    1024
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("default_provider", &self.default_provider)
            .field("default_model", &self.default_model)
            .field("default_temperature", &self.default_temperature)
            .field("default_max_tokens", &self.default_max_tokens)
            .field("agent", &self.agent)
            .field("memory", &self.memory)
            .field("rpc", &self.rpc)
            .field("providers", &self.providers)
            .field("capability_servers", &self.capability_servers)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("default_model", &self.default_model)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Iterations allowed before a session is declared exhausted
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Per-call budget for perception and planning requests
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,

    /// Memories recalled into each planning prompt
    #[serde(default = "default_recall_top_k")]
    pub recall_top_k: usize,
}

fn default_max_steps() -> usize {
    5
}
fn default_llm_timeout_secs() -> u64 {
    8
}
fn default_recall_top_k() -> usize {
    3
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            llm_timeout_secs: default_llm_timeout_secs(),
            recall_top_k: default_recall_top_k(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Directory holding the index/metadata pair; defaults to `~/.stepwise/memory`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<String>,

    #[serde(default = "default_collection")]
    pub collection: String,

    /// `"hash"` for the offline embedder, otherwise a provider name
    #[serde(default = "default_embedding_provider")]
    pub embedding_provider: String,

    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// Vector length for a fresh index
    #[serde(default = "default_dimension")]
    pub dimension: usize,

    /// Candidates fetched per requested result before metadata filtering
    #[serde(default = "default_oversample_factor")]
    pub oversample_factor: usize,

    #[serde(default = "default_embedding_timeout_secs")]
    pub embedding_timeout_secs: u64,
}

fn default_collection() -> String {
    "agent_memory".into()
}
fn default_embedding_provider() -> String {
    "hash".into()
}
fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}
fn default_dimension() -> usize {
    768
}
fn default_oversample_factor() -> usize {
    5
}
fn default_embedding_timeout_secs() -> u64 {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            store_dir: None,
            collection: default_collection(),
            embedding_provider: default_embedding_provider(),
            embedding_model: default_embedding_model(),
            dimension: default_dimension(),
            oversample_factor: default_oversample_factor(),
            embedding_timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Attempts per invocation on transient transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Backoff unit; attempt `n` waits `n * backoff_ms`
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle sessions kept per server
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_max_idle() -> usize {
    2
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            max_idle: default_max_idle(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

/// A capability server started as a child process speaking JSON-RPC on stdio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityServerConfig {
    pub name: String,

    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

impl AppConfig {
    /// Load configuration from the default path (~/.stepwise/config.toml).
    ///
    /// Also checks environment variables:
    /// - `STEPWISE_API_KEY` (highest priority), `OPENROUTER_API_KEY`, `OPENAI_API_KEY`
    /// - `STEPWISE_PROVIDER`, `STEPWISE_MODEL`, `STEPWISE_MAX_STEPS`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides read through `lookup`, then re-validate.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if self.api_key.is_none() {
            self.api_key = lookup("STEPWISE_API_KEY")
                .or_else(|| lookup("OPENROUTER_API_KEY"))
                .or_else(|| lookup("OPENAI_API_KEY"));
        }

        if let Some(provider) = lookup("STEPWISE_PROVIDER") {
            self.default_provider = provider;
        }

        if let Some(model) = lookup("STEPWISE_MODEL") {
            self.default_model = model;
        }

        if let Some(steps) = lookup("STEPWISE_MAX_STEPS") {
            self.agent.max_steps = steps.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEPWISE_MAX_STEPS is not a number: {steps}"))
            })?;
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepwise")
    }

    /// Where the vector store keeps its files.
    pub fn memory_dir(&self) -> PathBuf {
        self.memory
            .store_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("memory"))
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::ValidationError("agent.max_steps must be > 0".into()));
        }

        if self.memory.oversample_factor == 0 {
            return Err(ConfigError::ValidationError(
                "memory.oversample_factor must be > 0".into(),
            ));
        }

        if self.memory.dimension == 0 {
            return Err(ConfigError::ValidationError("memory.dimension must be > 0".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.capability_servers {
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate capability server name: {}",
                    server.name
                )));
            }
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            agent: AgentConfig::default(),
            memory: MemoryConfig::default(),
            rpc: RpcConfig::default(),
            providers: HashMap::new(),
            capability_servers: vec![],
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
