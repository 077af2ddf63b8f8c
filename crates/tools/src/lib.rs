//! Capability transports and dispatch for Stepwise.
//!
//! - [`mcp`]: JSON-RPC client for MCP servers over child-process stdio
//! - [`pool`]: session pooling with retry on transient failures
//! - [`multi`]: several servers behind one provider
//! - [`local`], [`math`], [`calculator`]: in-process built-in capabilities
//! - [`dispatcher`]: invoke a validated action and normalize its result

pub mod calculator;
pub mod dispatcher;
pub mod local;
pub mod math;
pub mod mcp;
pub mod multi;
pub mod pool;
pub mod rpc;

pub use dispatcher::{Dispatcher, normalize};
pub use local::{LocalCapabilities, LocalTool, ToolFailure};
pub use math::builtin_capabilities;
pub use mcp::{McpSession, StdioServer};
pub use multi::{MultiCapabilities, connect_servers};
pub use pool::{PooledCapabilities, RetryPolicy, SessionPool};
pub use rpc::{RpcSession, SessionFactory};
