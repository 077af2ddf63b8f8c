//! Error types for the Stepwise domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; the loop controller decides
//! which of them are recoverable.

use thiserror::Error;

/// The top-level error type for all Stepwise operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Capability errors ---
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    /// The backend did not answer within the per-call budget.
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Embedding dimension mismatch: index holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The persisted index and metadata table disagree.
    #[error("Store consistency error: {0}")]
    Consistency(String),
}

/// Failure to build a capability snapshot. Always fatal to a session.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to fetch capabilities from {provider}: {reason}")]
    FetchFailed { provider: String, reason: String },

    #[error("Duplicate capability name in snapshot: {0}")]
    DuplicateName(String),
}

/// Failure while invoking a capability through its transport.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The connection broke or could not be opened.
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("{capability} timed out after {timeout_secs}s")]
    Timeout { capability: String, timeout_secs: u64 },

    /// The remote side answered with an error.
    #[error("{capability} failed: {message}")]
    Remote { capability: String, message: String },

    #[error("Capability not available: {0}")]
    NotFound(String),

    #[error("Malformed RPC message: {0}")]
    Rpc(String),
}

impl DispatchError {
    /// Whether retrying on a fresh session could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transport(_) | DispatchError::Timeout { .. })
    }
}

/// The planner's text could not be turned into a valid action.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Expected a line starting with FUNCTION_CALL: but got: {text}")]
    MissingMarker { text: String },

    #[error("Could not parse call payload ({reason}): {text}")]
    MalformedJson { text: String, reason: String },

    #[error("Invalid call payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown capability '{name}'. Known capabilities: {}", .known.join(", "))]
    UnknownCapability { name: String, known: Vec<String> },

    #[error("Not enough arguments for {capability}: missing '{parameter}'")]
    MissingArgument { capability: String, parameter: String },

    #[error("Argument '{parameter}' cannot be read as {expected}: {value}")]
    InvalidArgument {
        parameter: String,
        expected: String,
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_displays_correctly() {
        let err = Error::Provider(ProviderError::ApiError {
            status_code: 429,
            message: "Too many requests".into(),
        });
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn unknown_capability_lists_known_names() {
        let err = ProtocolError::UnknownCapability {
            name: "unknown_tool".into(),
            known: vec!["add".into(), "sqrt".into()],
        };
        let text = err.to_string();
        assert!(text.contains("unknown_tool"));
        assert!(text.contains("add, sqrt"));
    }

    #[test]
    fn dispatch_error_transience() {
        assert!(DispatchError::Transport("pipe closed".into()).is_transient());
        assert!(
            DispatchError::Timeout {
                capability: "add".into(),
                timeout_secs: 5
            }
            .is_transient()
        );
        assert!(
            !DispatchError::Remote {
                capability: "divide".into(),
                message: "division by zero".into()
            }
            .is_transient()
        );
    }
}
