//! Ephemeral per-session log: ordered strings keyed by session.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Session-keyed append log held only in memory.
///
/// Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct EphemeralStore {
    entries: Arc<RwLock<HashMap<String, Vec<String>>>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`.
    pub async fn add(&self, key: &str, value: impl Into<String>) {
        self.entries
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(value.into());
    }

    /// All values under `key`, newline-joined. Empty when the key is unknown.
    pub async fn get_all(&self, key: &str) -> String {
        self.entries
            .read()
            .await
            .get(key)
            .map(|values| values.join("\n"))
            .unwrap_or_default()
    }

    /// Most recent value under `key`, or `""`.
    pub async fn get_last(&self, key: &str) -> String {
        self.entries
            .read()
            .await
            .get(key)
            .and_then(|values| values.last().cloned())
            .unwrap_or_default()
    }

    /// A copy of the values under `key` in insertion order.
    pub async fn entries(&self, key: &str) -> Vec<String> {
        self.entries.read().await.get(key).cloned().unwrap_or_default()
    }

    /// Forget one session.
    pub async fn clear(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Forget every session.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }

    pub async fn session_count(&self) -> usize {
        self.entries.read().await.len()
    }
}
