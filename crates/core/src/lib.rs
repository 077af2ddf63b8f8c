//! # Stepwise Core
//!
//! Domain types, traits, and error definitions for the Stepwise agent loop.
//! This crate has no framework dependencies: it defines the model that the
//! provider, memory, tool, and agent crates implement against.
//!
//! ## Seams
//!
//! - [`Provider`]: text generation and embedding backends
//! - [`CapabilityProvider`]: where actions are listed and invoked
//! - [`Embedder`] / [`LongTermMemory`]: similarity-indexed recall
//!
//! Implementations live in their own crates so each can be swapped by
//! configuration or replaced with a scripted stub in tests.

pub mod capability;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod plan;
pub mod provider;
pub mod session;

// Re-export key types at crate root for ergonomics
pub use capability::{
    CapabilityDescriptor, CapabilityProvider, CapabilityRegistry, ParamSpec, ParamType,
    ToolCallResult, ToolOutput,
};
pub use error::{
    DispatchError, Error, MemoryError, ProtocolError, ProviderError, RegistryError, Result,
};
pub use event::{DomainEvent, EventBus};
pub use memory::{Embedder, LongTermMemory, MemoryItem, MemoryKind, Recalled, RetrieveQuery};
pub use message::{Message, Role};
pub use plan::{PerceptionResult, PlanDecision, FINAL_ANSWER_MARKER, FUNCTION_CALL_MARKER};
pub use provider::{Provider, ProviderRequest, ProviderResponse};
pub use session::{Session, SessionId, SessionStatus};
