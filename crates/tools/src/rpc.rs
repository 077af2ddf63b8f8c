//! Session abstractions for remote capability servers.
//!
//! An [`RpcSession`] is one live connection; a [`SessionFactory`] knows how to
//! open a fresh, handshaken one. The pool in [`crate::pool`] sits between them.

use async_trait::async_trait;
use serde_json::{Map, Value};
use stepwise_core::capability::CapabilityDescriptor;
use stepwise_core::error::DispatchError;

/// One connection to a capability server.
#[async_trait]
pub trait RpcSession: Send {
    /// Cheap liveness check used before reusing a pooled session.
    async fn ping(&mut self) -> Result<(), DispatchError>;

    async fn list_tools(&mut self) -> Result<Vec<CapabilityDescriptor>, DispatchError>;

    /// Invoke a tool; the raw `result` object is returned untouched.
    async fn call_tool(
        &mut self,
        name: &str,
        args: Map<String, Value>,
    ) -> Result<Value, DispatchError>;

    /// False once the transport broke or the process exited.
    fn is_alive(&mut self) -> bool;
}

/// Opens new sessions to one server.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<Box<dyn RpcSession>, DispatchError>;
}
