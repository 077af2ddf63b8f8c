//! Several capability providers presented as one.
//!
//! Listing concatenates each provider's capabilities in registration order
//! and remembers which provider owns which name; invocation routes by that
//! table. A listing failure from any provider fails the whole listing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use stepwise_config::AppConfig;
use stepwise_core::capability::{CapabilityDescriptor, CapabilityProvider};
use stepwise_core::error::DispatchError;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::mcp::StdioServer;
use crate::pool::{PooledCapabilities, RetryPolicy};

pub struct MultiCapabilities {
    name: String,
    providers: Vec<Arc<dyn CapabilityProvider>>,
    routes: RwLock<HashMap<String, usize>>,
}

impl MultiCapabilities {
    pub fn new(name: impl Into<String>, providers: Vec<Arc<dyn CapabilityProvider>>) -> Self {
        Self {
            name: name.into(),
            providers,
            routes: RwLock::new(HashMap::new()),
        }
    }

    /// Which provider serves a capability, if it has been listed.
    pub async fn route(&self, capability: &str) -> Option<&str> {
        let routes = self.routes.read().await;
        routes.get(capability).map(|&i| self.providers[i].name())
    }
}

#[async_trait]
impl CapabilityProvider for MultiCapabilities {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_capabilities(&self) -> Result<Vec<CapabilityDescriptor>, DispatchError> {
        let mut all = Vec::new();
        let mut routes = HashMap::new();
        for (i, provider) in self.providers.iter().enumerate() {
            for descriptor in provider.list_capabilities().await? {
                if routes.contains_key(&descriptor.name) {
                    warn!(
                        capability = %descriptor.name,
                        provider = provider.name(),
                        "Capability name offered by more than one provider"
                    );
                } else {
                    routes.insert(descriptor.name.clone(), i);
                }
                all.push(descriptor);
            }
        }
        *self.routes.write().await = routes;
        Ok(all)
    }

    async fn invoke(&self, name: &str, args: Map<String, Value>) -> Result<Value, DispatchError> {
        let index = self.routes.read().await.get(name).copied();
        match index {
            Some(i) => self.providers[i].invoke(name, args).await,
            None => Err(DispatchError::NotFound(name.to_string())),
        }
    }
}

/// Build the provider for the configured capability servers: a single
/// pooled server as-is, several behind a [`MultiCapabilities`].
/// `None` when no servers are configured.
pub fn connect_servers(config: &AppConfig) -> Option<Arc<dyn CapabilityProvider>> {
    let timeout = std::time::Duration::from_secs(config.rpc.request_timeout_secs);
    let retry = RetryPolicy::from_config(&config.rpc);
    let mut providers: Vec<Arc<dyn CapabilityProvider>> = config
        .capability_servers
        .iter()
        .map(|server| {
            info!(server = %server.name, command = %server.command, "Registering capability server");
            let factory = Arc::new(StdioServer::from_config(server, timeout));
            Arc::new(PooledCapabilities::new(factory, config.rpc.max_idle, retry))
                as Arc<dyn CapabilityProvider>
        })
        .collect();

    match providers.len() {
        0 => None,
        1 => providers.pop(),
        _ => Some(Arc::new(MultiCapabilities::new("servers", providers))),
    }
}
