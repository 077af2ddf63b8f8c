//! Pooled, retrying access to one capability server.
//!
//! [`SessionPool`] keeps up to `max_idle` handshaken sessions. A borrowed
//! session is pinged before reuse; a dead one is dropped and replaced. The
//! borrow/verify/return steps run under the pool's own mutex.
//!
//! [`PooledCapabilities`] puts a [`RetryPolicy`] on top: transport failures
//! and timeouts are retried on a fresh session with linear backoff; remote
//! errors are returned as-is.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use stepwise_config::RpcConfig;
use stepwise_core::capability::{CapabilityDescriptor, CapabilityProvider};
use stepwise_core::error::DispatchError;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::rpc::{RpcSession, SessionFactory};

/// A small pool of sessions to one server.
pub struct SessionPool {
    factory: Arc<dyn SessionFactory>,
    idle: Mutex<Vec<Box<dyn RpcSession>>>,
    max_idle: usize,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, max_idle: usize) -> Self {
        Self {
            factory,
            idle: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    pub fn name(&self) -> &str {
        self.factory.name()
    }

    /// Borrow a verified session, opening a new one when none is usable.
    pub async fn acquire(&self) -> Result<Box<dyn RpcSession>, DispatchError> {
        let mut idle = self.idle.lock().await;
        while let Some(mut session) = idle.pop() {
            if !session.is_alive() {
                debug!(server = self.name(), "Dropping dead pooled session");
                continue;
            }
            match session.ping().await {
                Ok(()) => return Ok(session),
                Err(e) => debug!(server = self.name(), error = %e, "Pooled session failed ping"),
            }
        }
        self.factory.connect().await
    }

    /// Return a session. Dead sessions and overflow are dropped.
    pub async fn release(&self, mut session: Box<dyn RpcSession>) {
        if !session.is_alive() {
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() < self.max_idle {
            idle.push(session);
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }
}

/// How many attempts a call gets and how long to wait between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RpcConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(200),
        }
    }
}

enum Call<'a> {
    List,
    Invoke(&'a str, &'a Map<String, Value>),
}

enum Reply {
    List(Vec<CapabilityDescriptor>),
    Invoke(Value),
}

/// A capability server reached through a session pool.
pub struct PooledCapabilities {
    pool: SessionPool,
    retry: RetryPolicy,
}

impl PooledCapabilities {
    pub fn new(factory: Arc<dyn SessionFactory>, max_idle: usize, retry: RetryPolicy) -> Self {
        Self {
            pool: SessionPool::new(factory, max_idle),
            retry,
        }
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    async fn attempt(&self, call: &Call<'_>) -> Result<Reply, DispatchError> {
        let mut session = self.pool.acquire().await?;
        let reply = match call {
            Call::List => session.list_tools().await.map(Reply::List),
            Call::Invoke(name, args) => session
                .call_tool(name, (*args).clone())
                .await
                .map(Reply::Invoke),
        };
        match &reply {
            Err(e) if e.is_transient() => drop(session),
            _ => self.pool.release(session).await,
        }
        reply
    }

    async fn run(&self, call: Call<'_>) -> Result<Reply, DispatchError> {
        let label = match &call {
            Call::List => "tools/list",
            Call::Invoke(name, _) => *name,
        };
        let mut attempt = 0;
        loop {
            match self.attempt(&call).await {
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        server = self.pool.name(),
                        call = label,
                        attempt = attempt + 1,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl CapabilityProvider for PooledCapabilities {
    fn name(&self) -> &str {
        self.pool.name()
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, DispatchError> {
        match self.run(Call::List).await? {
            Reply::List(descriptors) => Ok(descriptors),
            Reply::Invoke(_) => Err(DispatchError::Rpc("unexpected reply to tools/list".into())),
        }
    }

    async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, DispatchError> {
        match self.run(Call::Invoke(name, &args)).await? {
            Reply::Invoke(value) => Ok(value),
            Reply::List(_) => Err(DispatchError::Rpc("unexpected reply to tools/call".into())),
        }
    }
}
