//! Public trait describing key/value cache behaviour.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Cache of projected keys and values persisted across decoding steps.
///
/// Tensors exchanged with the cache are head-major `[rows, heads, len,
/// head_dim]`.
pub trait KeyValueCache {
    /// Logical number of positions seen so far. Never decreases.
    fn seq_len(&self) -> usize;

    /// Positions physically held by the cache.
    fn stored_len(&self) -> usize;

    /// Appends new positions. `beam_selection[r]` names the row whose history
    /// row `r` continues; `None` keeps every row on its own history.
    fn append(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        beam_selection: Option<&[u32]>,
    ) -> Result<(), AttentionError>;

    /// Full per-row key/value history.
    fn materialize(&self) -> Result<(Tensor, Tensor), AttentionError>;

    /// The most recent `min(stored_len, cutoff)` positions of each row.
    fn window(&self, cutoff: usize) -> Result<(Tensor, Tensor), AttentionError>;
}
