//! Fixed-capacity per-layer cache with beam parent tracking.

use candle_core::{DType, Device, Tensor};

use crate::core::{errors::shape_err, AttentionError};
use crate::kv_cache::{api::KeyValueCache, layout::CacheLayout};

/// Keys and values of one decoder layer.
///
/// Storage is preallocated to `layout.capacity` positions and written in place,
/// so the entry is deliberately not `Clone`: a shallow clone would alias the
/// storage that later appends mutate. Use [`KvCacheEntry::try_clone`] for an
/// independent copy.
#[derive(Debug)]
pub struct KvCacheEntry {
    layout: CacheLayout,
    seq_len: usize,
    stored_len: usize,
    keys: Tensor,
    values: Tensor,
    /// Row-major `[stored_len, rows]`: parent row at position `t - 1` of the
    /// row at position `t`.
    beam_index: Vec<u32>,
    reordered: bool,
}

impl KvCacheEntry {
    /// Zero-length cache whose storage matches `layout`.
    pub fn init_empty(layout: CacheLayout, dtype: DType, device: &Device) -> Result<Self, AttentionError> {
        layout.validate()?;
        let shape = (layout.rows(), layout.num_heads, layout.capacity, layout.head_dim);
        let keys = Tensor::zeros(shape, dtype, device)?;
        let values = Tensor::zeros(shape, dtype, device)?;
        log::debug!(
            "kv-cache init: rows={} heads={} head_dim={} capacity={} dtype={:?}",
            layout.rows(),
            layout.num_heads,
            layout.head_dim,
            layout.capacity,
            dtype
        );
        Ok(Self {
            layout,
            seq_len: 0,
            stored_len: 0,
            keys,
            values,
            beam_index: Vec::new(),
            reordered: false,
        })
    }

    /// Cache holding `keys`/`values` (`[rows, heads, len, head_dim]`) as its
    /// whole history, with a logical length of `seq_len`.
    ///
    /// Used by the sliding-window mode, whose cache keeps only the most recent
    /// positions while the logical length keeps counting.
    pub fn from_history(
        layout: CacheLayout,
        keys: &Tensor,
        values: &Tensor,
        seq_len: usize,
    ) -> Result<Self, AttentionError> {
        let len = keys.dims().get(2).copied().unwrap_or(0);
        if seq_len < len {
            return Err(shape_err(format!(
                "logical length {seq_len} is shorter than the {len} stored positions"
            )));
        }
        let mut entry = Self::init_empty(layout, keys.dtype(), keys.device())?;
        entry.append(keys, values, None)?;
        entry.seq_len = seq_len;
        Ok(entry)
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.keys.dtype()
    }

    pub fn device(&self) -> &Device {
        self.keys.device()
    }

    /// Beam parents as a `U32` tensor `[stored_len, rows]`.
    pub fn beam_index_tensor(&self) -> Result<Tensor, AttentionError> {
        Ok(Tensor::from_vec(
            self.beam_index.clone(),
            (self.stored_len, self.layout.rows()),
            self.keys.device(),
        )?)
    }

    /// Deep copy with independent storage.
    pub fn try_clone(&self) -> Result<Self, AttentionError> {
        Ok(Self {
            layout: self.layout,
            seq_len: self.seq_len,
            stored_len: self.stored_len,
            keys: self.keys.copy()?,
            values: self.values.copy()?,
            beam_index: self.beam_index.clone(),
            reordered: self.reordered,
        })
    }

    fn check_block(&self, name: &str, tensor: &Tensor) -> Result<usize, AttentionError> {
        let rows = self.layout.rows();
        let (heads, dim) = (self.layout.num_heads, self.layout.head_dim);
        let (r, h, n, d) = tensor.dims4().map_err(|_| {
            shape_err(format!(
                "{name} must be [{rows}, {heads}, len, {dim}], got {:?}",
                tensor.dims()
            ))
        })?;
        if (r, h, d) != (rows, heads, dim) {
            return Err(shape_err(format!(
                "{name} must be [{rows}, {heads}, len, {dim}], got [{r}, {h}, {n}, {d}]"
            )));
        }
        if tensor.dtype() != self.dtype() {
            return Err(shape_err(format!(
                "{name} dtype {:?} does not match cache dtype {:?}",
                tensor.dtype(),
                self.dtype()
            )));
        }
        Ok(n)
    }

    fn gather(&self, storage: &Tensor, index: &Tensor) -> Result<Tensor, AttentionError> {
        let rows = self.layout.rows();
        let (heads, dim) = (self.layout.num_heads, self.layout.head_dim);
        let stored = self.stored_len;
        let flat = storage
            .narrow(2, 0, stored)?
            .transpose(1, 2)?
            .reshape((rows * stored, heads * dim))?;
        Ok(flat
            .index_select(index, 0)?
            .reshape((rows, stored, heads, dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Flat gather positions in `[rows * stored, ..]` order: for every row,
    /// follow the parents backwards from the newest position.
    fn history_index(&self) -> Vec<u32> {
        let rows = self.layout.rows();
        let stored = self.stored_len;
        let mut index = vec![0u32; rows * stored];
        for row in 0..rows {
            let mut current = row;
            for t in (0..stored).rev() {
                index[row * stored + t] = (current * stored + t) as u32;
                current = self.beam_index[t * rows + current] as usize;
            }
        }
        index
    }
}

impl KeyValueCache for KvCacheEntry {
    fn seq_len(&self) -> usize {
        self.seq_len
    }

    fn stored_len(&self) -> usize {
        self.stored_len
    }

    fn append(
        &mut self,
        keys: &Tensor,
        values: &Tensor,
        beam_selection: Option<&[u32]>,
    ) -> Result<(), AttentionError> {
        let new = self.check_block("keys", keys)?;
        if self.check_block("values", values)? != new {
            return Err(shape_err("keys and values must append the same number of positions"));
        }
        let required = self.stored_len + new;
        if required > self.layout.capacity {
            return Err(AttentionError::Capacity {
                required,
                capacity: self.layout.capacity,
            });
        }
        if let Some(selection) = beam_selection {
            self.layout.validate_selection(selection)?;
        }
        if new == 0 {
            return Ok(());
        }

        let rows = self.layout.rows();
        let identity = (0..rows as u32).collect::<Vec<_>>();
        let first = beam_selection.unwrap_or(identity.as_slice());
        if self.stored_len > 0 && first != identity.as_slice() {
            self.reordered = true;
        }
        self.beam_index.extend_from_slice(first);
        for _ in 1..new {
            self.beam_index.extend_from_slice(&identity);
        }

        self.keys.slice_set(&keys.contiguous()?, 2, self.stored_len)?;
        self.values.slice_set(&values.contiguous()?, 2, self.stored_len)?;
        self.stored_len = required;
        self.seq_len += new;
        log::debug!(
            "kv-cache append: new={new} stored={} seq_len={}",
            self.stored_len,
            self.seq_len
        );
        Ok(())
    }

    fn materialize(&self) -> Result<(Tensor, Tensor), AttentionError> {
        if !self.reordered {
            return Ok((
                self.keys.narrow(2, 0, self.stored_len)?.contiguous()?,
                self.values.narrow(2, 0, self.stored_len)?.contiguous()?,
            ));
        }
        let index = self.history_index();
        let len = index.len();
        let index = Tensor::from_vec(index, len, self.keys.device())?;
        Ok((self.gather(&self.keys, &index)?, self.gather(&self.values, &index)?))
    }

    fn window(&self, cutoff: usize) -> Result<(Tensor, Tensor), AttentionError> {
        let (keys, values) = self.materialize()?;
        let len = self.stored_len.min(cutoff);
        let start = self.stored_len - len;
        Ok((keys.narrow(2, start, len)?, values.narrow(2, start, len)?))
    }
}
