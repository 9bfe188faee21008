//! Layout of a per-layer key/value cache.
//!
//! Storage is head-major, `[batch * beam_width, num_heads, capacity,
//! head_dim]`. Rows of the same batch item are contiguous, so row `r` belongs
//! to batch item `r / beam_width`.

use crate::core::{errors::shape_err, AttentionError};

/// Declarative description of a cache layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    /// Hypotheses tracked per batch item; 1 outside beam search.
    pub beam_width: usize,
    /// Maximum number of stored positions.
    pub capacity: usize,
}

impl CacheLayout {
    /// Number of cache slots (`batch * beam_width`).
    pub fn rows(&self) -> usize {
        self.batch * self.beam_width
    }

    /// Batch item owning cache row `row`.
    pub fn batch_of(&self, row: usize) -> usize {
        row / self.beam_width.max(1)
    }

    pub(crate) fn validate(&self) -> Result<(), AttentionError> {
        if self.beam_width == 0 || self.num_heads == 0 || self.head_dim == 0 {
            return Err(shape_err(format!(
                "cache layout needs non-zero beams, heads and head_dim, got {self:?}"
            )));
        }
        Ok(())
    }

    /// Checks a beam selection: one entry per row, each picking a row of the
    /// same batch item.
    pub(crate) fn validate_selection(&self, selection: &[u32]) -> Result<(), AttentionError> {
        let rows = self.rows();
        if selection.len() != rows {
            return Err(shape_err(format!(
                "beam selection has {} entries, expected {rows}",
                selection.len()
            )));
        }
        for (row, &parent) in selection.iter().enumerate() {
            let parent = parent as usize;
            if parent >= rows || self.batch_of(parent) != self.batch_of(row) {
                return Err(AttentionError::BeamSelection { row, parent });
            }
        }
        Ok(())
    }
}
