//! Flat (brute-force) L2 nearest-neighbour index.
//!
//! Vectors are stored contiguously; a record's id is its ordinal position.
//! Distances are squared Euclidean, so identical vectors score 0.

use stepwise_core::error::MemoryError;

/// Squared Euclidean distance. Mismatched lengths compare as infinitely far.
pub fn l2_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return f32::INFINITY;
    }
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// An append-only flat index of fixed-dimension vectors.
#[derive(Debug, Clone)]
pub struct FlatL2Index {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Build an index from existing vectors, checking every length.
    pub fn from_vectors(
        dimension: usize,
        vectors: impl IntoIterator<Item = Vec<f32>>,
    ) -> Result<Self, MemoryError> {
        let mut index = Self::new(dimension);
        for v in vectors {
            index.add(&v)?;
        }
        Ok(index)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector; returns its ordinal.
    pub fn add(&mut self, vector: &[f32]) -> Result<usize, MemoryError> {
        if vector.len() != self.dimension || self.dimension == 0 {
            return Err(MemoryError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        let id = self.len();
        self.data.extend_from_slice(vector);
        Ok(id)
    }

    /// The vector stored at `id`.
    pub fn vector(&self, id: usize) -> Option<&[f32]> {
        let start = id.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// Drop every vector at or after ordinal `len`.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len * self.dimension);
    }

    /// The `k` nearest ordinals by ascending distance; ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || query.len() != self.dimension {
            return Vec::new();
        }
        let mut scored: Vec<(usize, f32)> = self
            .vectors()
            .enumerate()
            .map(|(id, v)| (id, l2_distance_squared(query, v)))
            .collect();
        // stable sort keeps lower ordinals first on equal distance
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        scored
    }
}
