//! Memory stores for Stepwise.
//!
//! - [`EphemeralStore`]: per-session append log, never persisted
//! - [`VectorStore`]: flat L2 index plus metadata table, optionally persisted
//! - [`HashEmbedder`]: offline deterministic embedder

pub mod ephemeral;
pub mod hashing;
pub mod index;
pub mod vector_store;

pub use ephemeral::EphemeralStore;
pub use hashing::HashEmbedder;
pub use index::{FlatL2Index, l2_distance_squared};
pub use vector_store::{StoreStats, VectorStore};
