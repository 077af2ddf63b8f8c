//! Vector store: flat L2 index with a parallel metadata table.
//!
//! Record `i` in the metadata table always describes vector `i` in the index.
//! When a directory is configured, every mutation is written as a pair of
//! files:
//!
//! - `<dir>/<collection>.index.json`: generation, dimension, vectors
//! - `<dir>/<collection>.meta.jsonl`: header line, then one item per line
//!
//! Both files carry the same generation id. A save writes both temporaries
//! before renaming anything, and the pair it replaces is kept as
//! `<collection>.index.json.bak` / `<collection>.meta.jsonl.bak`. A load takes
//! the first pair whose generations agree, so a save interrupted between
//! renames falls back to the last committed pair. Only when no pair agrees
//! does the store start empty.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stepwise_core::error::MemoryError;
use stepwise_core::memory::{Embedder, LongTermMemory, MemoryItem, Recalled, RetrieveQuery};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::index::FlatL2Index;

const DEFAULT_OVERSAMPLE: usize = 5;

#[derive(Serialize, Deserialize)]
struct IndexFile {
    generation: String,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Serialize, Deserialize)]
struct MetaHeader {
    generation: String,
    count: usize,
}

struct StoreState {
    index: FlatL2Index,
    records: Vec<MemoryItem>,
}

impl StoreState {
    fn empty(dimension: usize) -> Self {
        Self {
            index: FlatL2Index::new(dimension),
            records: Vec::new(),
        }
    }
}

/// Summary numbers for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub records: usize,
    pub dimension: usize,
    pub sessions: usize,
}

/// Similarity-searchable memory over a flat L2 index.
pub struct VectorStore {
    embedder: Arc<dyn Embedder>,
    location: Option<(PathBuf, String)>,
    oversample: usize,
    state: RwLock<StoreState>,
}

impl VectorStore {
    /// A store that never touches disk.
    pub fn in_memory(embedder: Arc<dyn Embedder>, dimension: usize) -> Self {
        Self {
            embedder,
            location: None,
            oversample: DEFAULT_OVERSAMPLE,
            state: RwLock::new(StoreState::empty(dimension)),
        }
    }

    /// Open (or start) a persisted collection under `dir`.
    ///
    /// A half-written or mismatched pair falls back to the backup pair, and
    /// is replaced by an empty store when that does not load either. Only
    /// unreadable files are an error.
    pub fn open(
        dir: impl Into<PathBuf>,
        collection: &str,
        embedder: Arc<dyn Embedder>,
        dimension: usize,
    ) -> Result<Self, MemoryError> {
        let dir = dir.into();

        let state = match load_latest(&dir, collection) {
            Ok(Some(state)) => state,
            Ok(None) => StoreState::empty(dimension),
            Err(MemoryError::Consistency(reason)) => {
                warn!(
                    collection,
                    reason = %reason,
                    "Vector store files are inconsistent, starting empty"
                );
                StoreState::empty(dimension)
            }
            Err(e) => return Err(e),
        };
        debug!(
            collection,
            count = state.records.len(),
            dimension = state.index.dimension(),
            "Vector store loaded"
        );

        Ok(Self {
            embedder,
            location: Some((dir, collection.to_string())),
            oversample: DEFAULT_OVERSAMPLE,
            state: RwLock::new(state),
        })
    }

    /// How many candidates to fetch per requested result before filtering.
    pub fn with_oversample(mut self, factor: usize) -> Self {
        self.oversample = factor.max(1);
        self
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        let sessions: BTreeSet<&str> = state.records.iter().map(|r| r.session_id.as_str()).collect();
        StoreStats {
            records: state.records.len(),
            dimension: state.index.dimension(),
            sessions: sessions.len(),
        }
    }

    /// Embed and append `items`, returning the ordinal of the first one.
    ///
    /// The ordinal is read under the same write lock that appends, so
    /// concurrent callers never see the same position.
    async fn insert(&self, items: Vec<MemoryItem>) -> Result<usize, MemoryError> {
        if items.is_empty() {
            return Ok(self.state.read().await.records.len());
        }

        let mut vectors = Vec::with_capacity(items.len());
        for item in &items {
            let vector = self.embedder.embed(&item.text).await?;
            if vector.is_empty() {
                return Err(MemoryError::EmbeddingFailed(format!(
                    "{} returned an empty vector",
                    self.embedder.name()
                )));
            }
            vectors.push(vector);
        }

        let mut state = self.state.write().await;

        let incoming = vectors[0].len();
        if state.index.is_empty() && state.index.dimension() != incoming {
            info!(
                from = state.index.dimension(),
                to = incoming,
                "Empty index adopting embedding dimension"
            );
            state.index = FlatL2Index::new(incoming);
        }
        let expected = state.index.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            error!(expected, actual = bad.len(), "Embedding dimension mismatch, item rejected");
            return Err(MemoryError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let before = state.records.len();
        let count = items.len();
        for (vector, item) in vectors.iter().zip(items) {
            state.index.add(vector)?;
            state.records.push(item);
        }

        if let Err(e) = self.persist(&state) {
            state.index.truncate(before);
            state.records.truncate(before);
            return Err(e);
        }
        debug!(count, total = state.records.len(), "Vector store items added");
        Ok(before)
    }

    /// Write the current state, or do nothing for an in-memory store.
    fn persist(&self, state: &StoreState) -> Result<(), MemoryError> {
        let Some((dir, collection)) = &self.location else {
            return Ok(());
        };
        std::fs::create_dir_all(dir).map_err(|e| {
            MemoryError::Storage(format!("Failed to create store directory: {e}"))
        })?;

        let generation = Uuid::new_v4().to_string();
        let index_file = IndexFile {
            generation: generation.clone(),
            dimension: state.index.dimension(),
            vectors: state.index.vectors().map(<[f32]>::to_vec).collect(),
        };
        let index_json = serde_json::to_string(&index_file)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize index: {e}")))?;

        let header = MetaHeader {
            generation,
            count: state.records.len(),
        };
        let mut meta = serde_json::to_string(&header)
            .map_err(|e| MemoryError::Storage(format!("Failed to serialize header: {e}")))?;
        meta.push('\n');
        for record in &state.records {
            let line = serde_json::to_string(record).map_err(|e| {
                MemoryError::Storage(format!("Failed to serialize memory item: {e}"))
            })?;
            meta.push_str(&line);
            meta.push('\n');
        }

        let index_path = index_path(dir, collection);
        let meta_path = meta_path(dir, collection);
        let index_tmp = index_path.with_extension("tmp");
        let meta_tmp = meta_path.with_extension("tmp");

        // Nothing is renamed until both temporaries are on disk
        if let Err(e) = write_file(&index_tmp, &index_json).and_then(|()| write_file(&meta_tmp, &meta)) {
            let _ = std::fs::remove_file(&index_tmp);
            let _ = std::fs::remove_file(&meta_tmp);
            return Err(e);
        }

        for path in [&index_path, &meta_path] {
            if path.exists() {
                replace(path, &backup_path(path))?;
            }
        }
        replace(&index_tmp, &index_path)?;
        replace(&meta_tmp, &meta_path)?;
        Ok(())
    }
}

fn index_path(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{collection}.index.json"))
}

fn meta_path(dir: &Path, collection: &str) -> PathBuf {
    dir.join(format!("{collection}.meta.jsonl"))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

fn write_file(path: &Path, content: &str) -> Result<(), MemoryError> {
    std::fs::write(path, content)
        .map_err(|e| MemoryError::Storage(format!("Failed to write {}: {e}", path.display())))
}

fn replace(from: &Path, to: &Path) -> Result<(), MemoryError> {
    std::fs::rename(from, to)
        .map_err(|e| MemoryError::Storage(format!("Failed to replace {}: {e}", to.display())))
}

/// Load the newest pair whose generations agree.
///
/// Besides the current and backup pairs, the two crossed pairs are tried:
/// a save that stopped between its renames leaves the last committed
/// generation split across a current file and a backup file.
fn load_latest(dir: &Path, collection: &str) -> Result<Option<StoreState>, MemoryError> {
    let index = index_path(dir, collection);
    let meta = meta_path(dir, collection);
    let index_bak = backup_path(&index);
    let meta_bak = backup_path(&meta);
    let candidates = [
        (&index, &meta),
        (&index_bak, &meta_bak),
        (&index_bak, &meta),
        (&index, &meta_bak),
    ];

    let mut first_problem = None;
    for (i, (index_path, meta_path)) in candidates.into_iter().enumerate() {
        match load_pair(index_path, meta_path) {
            Ok(Some(state)) => {
                if let Some(reason) = &first_problem {
                    warn!(
                        collection,
                        reason = %reason,
                        index = %index_path.display(),
                        "Current vector store pair unusable, recovered from backup"
                    );
                }
                return Ok(Some(state));
            }
            Ok(None) if i == 0 => {
                if !index_bak.exists() && !meta_bak.exists() {
                    return Ok(None);
                }
                first_problem.get_or_insert_with(|| "current pair missing".to_string());
            }
            Ok(None) => {}
            Err(MemoryError::Consistency(reason)) => {
                first_problem.get_or_insert(reason);
            }
            Err(e) => return Err(e),
        }
    }

    match first_problem {
        Some(reason) => Err(MemoryError::Consistency(reason)),
        None => Ok(None),
    }
}

fn load_pair(index_path: &Path, meta_path: &Path) -> Result<Option<StoreState>, MemoryError> {
    match (index_path.exists(), meta_path.exists()) {
        (false, false) => return Ok(None),
        (true, false) | (false, true) => {
            return Err(MemoryError::Consistency(format!(
                "only one of {} and {} exists",
                index_path.display(),
                meta_path.display()
            )));
        }
        (true, true) => {}
    }

    let index_raw = std::fs::read_to_string(index_path)
        .map_err(|e| MemoryError::Storage(format!("Failed to read index file: {e}")))?;
    let meta_raw = std::fs::read_to_string(meta_path)
        .map_err(|e| MemoryError::Storage(format!("Failed to read metadata file: {e}")))?;

    let index_file: IndexFile = serde_json::from_str(&index_raw)
        .map_err(|e| MemoryError::Consistency(format!("index file unreadable: {e}")))?;

    let mut lines = meta_raw.lines().filter(|l| !l.trim().is_empty());
    let header: MetaHeader = lines
        .next()
        .ok_or_else(|| MemoryError::Consistency("metadata file has no header".into()))
        .and_then(|l| {
            serde_json::from_str(l)
                .map_err(|e| MemoryError::Consistency(format!("metadata header unreadable: {e}")))
        })?;

    if header.generation != index_file.generation {
        return Err(MemoryError::Consistency(format!(
            "generation mismatch: index {} vs metadata {}",
            index_file.generation, header.generation
        )));
    }

    let records = lines
        .map(|l| serde_json::from_str::<MemoryItem>(l))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MemoryError::Consistency(format!("metadata record unreadable: {e}")))?;

    if records.len() != header.count || index_file.vectors.len() != header.count {
        return Err(MemoryError::Consistency(format!(
            "count mismatch: header {}, records {}, vectors {}",
            header.count,
            records.len(),
            index_file.vectors.len()
        )));
    }

    let index = FlatL2Index::from_vectors(index_file.dimension, index_file.vectors)
        .map_err(|e| MemoryError::Consistency(e.to_string()))?;

    Ok(Some(StoreState { index, records }))
}

#[async_trait]
impl LongTermMemory for VectorStore {
    async fn add(&self, item: MemoryItem) -> Result<usize, MemoryError> {
        self.insert(vec![item]).await
    }

    async fn add_many(&self, items: Vec<MemoryItem>) -> Result<usize, MemoryError> {
        let count = items.len();
        self.insert(items).await?;
        Ok(count)
    }

    async fn retrieve(&self, query: &RetrieveQuery) -> Result<Vec<Recalled>, MemoryError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(&query.text).await?;

        let state = self.state.read().await;
        if state.index.is_empty() {
            return Ok(Vec::new());
        }
        if vector.len() != state.index.dimension() {
            return Err(MemoryError::DimensionMismatch {
                expected: state.index.dimension(),
                actual: vector.len(),
            });
        }

        let search_k = (query.top_k * self.oversample)
            .max(query.top_k)
            .min(state.index.len());
        let recalled: Vec<Recalled> = state
            .index
            .search(&vector, search_k)
            .into_iter()
            .filter_map(|(id, distance)| {
                let item = state.records.get(id)?;
                query.matches(item).then(|| Recalled {
                    item: item.clone(),
                    distance,
                })
            })
            .take(query.top_k)
            .collect();

        debug!(
            candidates = search_k,
            returned = recalled.len(),
            "Vector store retrieve"
        );
        Ok(recalled)
    }

    async fn delete_session(&self, session_id: &str) -> Result<usize, MemoryError> {
        let mut state = self.state.write().await;

        let keep: Vec<usize> = (0..state.records.len())
            .filter(|&i| state.records[i].session_id != session_id)
            .collect();
        let removed = state.records.len() - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        let vectors = keep
            .iter()
            .filter_map(|&i| state.index.vector(i).map(<[f32]>::to_vec))
            .collect::<Vec<_>>();
        let records = keep.iter().map(|&i| state.records[i].clone()).collect();
        let rebuilt = StoreState {
            index: FlatL2Index::from_vectors(state.index.dimension(), vectors)?,
            records,
        };

        let previous = std::mem::replace(&mut *state, rebuilt);
        if let Err(e) = self.persist(&state) {
            *state = previous;
            return Err(e);
        }
        info!(session_id, removed, "Session purged from vector store");
        Ok(removed)
    }

    async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    async fn reset(&self) -> Result<(), MemoryError> {
        let mut state = self.state.write().await;
        let dimension = state.index.dimension();
        let previous = std::mem::replace(&mut *state, StoreState::empty(dimension));
        if let Err(e) = self.persist(&state) {
            *state = previous;
            return Err(e);
        }
        Ok(())
    }
}
