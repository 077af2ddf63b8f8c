//! Memory model: what the loop remembers and how it asks for it back.
//!
//! Two stores share this model:
//! - an ephemeral per-session log (plain strings, lives in `stepwise-memory`)
//! - a long-term similarity-indexed store of [`MemoryItem`]s behind the
//!   [`LongTermMemory`] trait

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// What kind of fact a memory item records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Query,
    ToolOutput,
    System,
    Fact,
    Preference,
}

impl MemoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryKind::Query => "query",
            MemoryKind::ToolOutput => "tool_output",
            MemoryKind::System => "system",
            MemoryKind::Fact => "fact",
            MemoryKind::Preference => "preference",
        }
    }
}

impl std::str::FromStr for MemoryKind {
    type Err = MemoryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "query" => Ok(MemoryKind::Query),
            "tool_output" => Ok(MemoryKind::ToolOutput),
            "system" => Ok(MemoryKind::System),
            "fact" => Ok(MemoryKind::Fact),
            "preference" => Ok(MemoryKind::Preference),
            other => Err(MemoryError::QueryFailed(format!("unknown memory type: {other}"))),
        }
    }
}

/// A single remembered piece of text with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub text: String,

    #[serde(rename = "type")]
    pub kind: MemoryKind,

    pub timestamp: DateTime<Utc>,

    pub session_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// The user request that was active when this item was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_query: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl MemoryItem {
    pub fn new(text: impl Into<String>, kind: MemoryKind, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind,
            timestamp: Utc::now(),
            session_id: session_id.into(),
            tool_name: None,
            user_query: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
        self
    }

    pub fn with_user_query(mut self, query: impl Into<String>) -> Self {
        self.user_query = Some(query.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A similarity query with optional metadata filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveQuery {
    pub text: String,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Only items of this kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MemoryKind>,

    /// Only items carrying at least one of these tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Only items from this session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

fn default_top_k() -> usize {
    3
}

impl RetrieveQuery {
    pub fn new(text: impl Into<String>, top_k: usize) -> Self {
        Self {
            text: text.into(),
            top_k,
            kind: None,
            tags: Vec::new(),
            session_id: None,
        }
    }

    pub fn of_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Whether an item passes every filter on this query.
    pub fn matches(&self, item: &MemoryItem) -> bool {
        if self.kind.is_some_and(|k| k != item.kind) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| item.tags.contains(t)) {
            return false;
        }
        if let Some(session) = &self.session_id
            && session != &item.session_id
        {
            return false;
        }
        true
    }
}

/// A retrieved item and its L2 distance from the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recalled {
    pub item: MemoryItem,
    pub distance: f32,
}

/// Turns text into a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, MemoryError>;
}

/// Long-term similarity-searchable memory.
///
/// Implementations: the flat-L2 vector store, scripted stubs in tests.
#[async_trait]
pub trait LongTermMemory: Send + Sync {
    /// Store one item; returns its ordinal.
    async fn add(&self, item: MemoryItem) -> std::result::Result<usize, MemoryError>;

    /// Store several items under one write; returns how many were added.
    async fn add_many(&self, items: Vec<MemoryItem>) -> std::result::Result<usize, MemoryError>;

    /// Nearest items by ascending distance, filtered by the query.
    async fn retrieve(
        &self,
        query: &RetrieveQuery,
    ) -> std::result::Result<Vec<Recalled>, MemoryError>;

    /// Remove every item of one session; returns how many were removed.
    async fn delete_session(&self, session_id: &str) -> std::result::Result<usize, MemoryError>;

    async fn len(&self) -> usize;

    /// Drop everything.
    async fn reset(&self) -> std::result::Result<(), MemoryError>;
}
