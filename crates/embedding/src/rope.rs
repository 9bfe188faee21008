//! Rotary positional embeddings.
//!
//! Sine/cosine tables are f32 tensors shaped `[positions, pos_embd_dim / 2]`
//! with `angle(p, i) = p * base^(-2i / pos_embd_dim)`. Tables are memoised in a
//! bounded process-wide LRU keyed by `(positions, dim, base, device)` so every
//! layer of a model shares one copy. Each [`RotaryEmbedding`] holds an
//! `RwLock<Arc<RotaryTable>>`: readers clone the `Arc`, and a request for a
//! position beyond the table takes the write lock, re-checks and swaps in a
//! larger table.
//!
//! [`RotaryEmbedding::apply`] supports the two channel pairings found in
//! checkpoints, selected by `offset`:
//!
//! * `offset == 1` rotates interleaved pairs `(2i, 2i + 1)` (GPT-J),
//! * `offset == rotary_ndims / 2` rotates `(i, i + rotary_ndims / 2)` (NeoX,
//!   LLaMA).
//!
//! Channels past `rotary_ndims` pass through unchanged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use candle_core::{DType, Device, DeviceLocation, Tensor};
use thiserror::Error;

const TABLE_CACHE_CAPACITY: usize = 16;

static TABLE_CACHE_HITS: AtomicUsize = AtomicUsize::new(0);
static TABLE_CACHE_MISSES: AtomicUsize = AtomicUsize::new(0);

/// Errors raised while applying rotary embeddings.
#[derive(Debug, Error)]
pub enum RopeError {
    /// Input geometry, offset or position ids are inconsistent.
    #[error("invalid rope shape: {0}")]
    InvalidShape(String),
    /// A lock guarding a shared rotary table was poisoned.
    #[error("rotary table lock poisoned")]
    Poisoned,
    /// Failure reported by the tensor backend.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

pub type RopeResult<T> = std::result::Result<T, RopeError>;

fn shape_err(message: impl Into<String>) -> RopeError {
    RopeError::InvalidShape(message.into())
}

/// Return the current `(hits, misses)` counters for the shared table cache.
pub fn table_cache_counters() -> (usize, usize) {
    (
        TABLE_CACHE_HITS.load(Ordering::Relaxed),
        TABLE_CACHE_MISSES.load(Ordering::Relaxed),
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    positions: usize,
    dim: usize,
    base_bits: u32,
    device: String,
}

impl TableKey {
    fn new(positions: usize, dim: usize, base: f32, device: &Device) -> Self {
        let device = match device.location() {
            DeviceLocation::Cpu => "cpu".to_owned(),
            DeviceLocation::Cuda { gpu_id } => format!("cuda{gpu_id}"),
            DeviceLocation::Metal { gpu_id } => format!("metal{gpu_id}"),
        };
        Self {
            positions,
            dim,
            base_bits: base.to_bits(),
            device,
        }
    }
}

struct TableCache {
    capacity: usize,
    order: Vec<TableKey>,
    entries: HashMap<TableKey, Arc<RotaryTable>>,
}

impl TableCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: Vec::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
        }
    }

    fn touch(&mut self, key: &TableKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(pos);
            self.order.push(key);
        }
    }

    fn get(&mut self, key: &TableKey) -> Option<Arc<RotaryTable>> {
        let table = self.entries.get(key).cloned()?;
        self.touch(key);
        Some(table)
    }

    fn insert(&mut self, key: TableKey, table: Arc<RotaryTable>) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key.clone(), table);
            self.touch(&key);
            return;
        }
        if self.entries.len() >= self.capacity && !self.order.is_empty() {
            let oldest = self.order.remove(0);
            self.entries.remove(&oldest);
        }
        self.order.push(key.clone());
        self.entries.insert(key, table);
    }
}

fn global_table_cache() -> &'static Mutex<TableCache> {
    static CACHE: OnceLock<Mutex<TableCache>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(TableCache::new(TABLE_CACHE_CAPACITY)))
}

/// Fetches a table from the shared cache, building it on a miss.
fn shared_table(positions: usize, dim: usize, base: f32, device: &Device) -> RopeResult<Arc<RotaryTable>> {
    let key = TableKey::new(positions, dim, base, device);
    let cache = global_table_cache();
    {
        let mut guard = cache.lock().map_err(|_| RopeError::Poisoned)?;
        if let Some(table) = guard.get(&key) {
            TABLE_CACHE_HITS.fetch_add(1, Ordering::Relaxed);
            log::debug!("rope table cache hit: {key:?}");
            return Ok(table);
        }
        TABLE_CACHE_MISSES.fetch_add(1, Ordering::Relaxed);
        log::debug!("rope table cache miss: {key:?}");
    }

    let table = Arc::new(RotaryTable::build(positions, dim, base, device)?);
    let mut guard = cache.lock().map_err(|_| RopeError::Poisoned)?;
    if let Some(existing) = guard.get(&key) {
        return Ok(existing);
    }
    guard.insert(key, Arc::clone(&table));
    Ok(table)
}

/// Immutable sine/cosine tables for one `(positions, dim, base)` triple.
#[derive(Debug)]
pub struct RotaryTable {
    positions: usize,
    dim: usize,
    base: f32,
    sin: Tensor,
    cos: Tensor,
}

impl RotaryTable {
    /// Builds tables covering positions `0..positions` for `dim` rotated channels.
    pub fn build(positions: usize, dim: usize, base: f32, device: &Device) -> RopeResult<Self> {
        if positions == 0 {
            return Err(shape_err("rotary table needs at least one position"));
        }
        if dim < 2 || dim % 2 != 0 {
            return Err(shape_err(format!("pos_embd_dim must be even and >= 2, got {dim}")));
        }
        let half = dim / 2;
        let inv_freqs: Vec<f64> = (0..half)
            .map(|i| (base as f64).powf(-((2 * i) as f64) / dim as f64))
            .collect();

        let mut sin = Vec::with_capacity(positions * half);
        let mut cos = Vec::with_capacity(positions * half);
        for pos in 0..positions {
            for &inv_freq in &inv_freqs {
                let angle = pos as f64 * inv_freq;
                sin.push(angle.sin() as f32);
                cos.push(angle.cos() as f32);
            }
        }
        Ok(Self {
            positions,
            dim,
            base,
            sin: Tensor::from_vec(sin, (positions, half), device)?,
            cos: Tensor::from_vec(cos, (positions, half), device)?,
        })
    }

    pub fn positions(&self) -> usize {
        self.positions
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn base(&self) -> f32 {
        self.base
    }

    pub fn sin(&self) -> &Tensor {
        &self.sin
    }

    pub fn cos(&self) -> &Tensor {
        &self.cos
    }
}

/// Configuration for building rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Number of positions the initial table covers.
    pub max_position_embeddings: usize,
    /// Number of channels the table is built for; must be even.
    pub pos_embd_dim: usize,
    /// Frequency base θ.
    pub base: f32,
}

impl RopeConfig {
    pub fn new(max_position_embeddings: usize, pos_embd_dim: usize) -> Self {
        Self {
            max_position_embeddings,
            pos_embd_dim,
            base: 10_000.0,
        }
    }

    pub fn with_base(mut self, base: f32) -> Self {
        self.base = base;
        self
    }
}

/// Result of [`RotaryEmbedding::apply`].
#[derive(Debug, Clone)]
pub enum RopeOutput {
    /// Rotated tensor with the input's shape and dtype.
    Single(Tensor),
    /// Query/key/value split from a fused projection, each
    /// `[batch, seq, num_head, head_dim]`; value is not rotated.
    Split {
        query: Tensor,
        key: Tensor,
        value: Tensor,
    },
}

impl RopeOutput {
    pub fn into_single(self) -> RopeResult<Tensor> {
        match self {
            RopeOutput::Single(x) => Ok(x),
            RopeOutput::Split { .. } => Err(shape_err("expected a single rotated tensor")),
        }
    }

    pub fn into_split(self) -> RopeResult<(Tensor, Tensor, Tensor)> {
        match self {
            RopeOutput::Split { query, key, value } => Ok((query, key, value)),
            RopeOutput::Single(_) => Err(shape_err("expected split query/key/value")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pairing {
    Interleaved,
    HalfSplit,
}

/// Rotary embedding handle shared by the attention layers of a model.
#[derive(Debug)]
pub struct RotaryEmbedding {
    config: RopeConfig,
    device: Device,
    table: RwLock<Arc<RotaryTable>>,
}

impl RotaryEmbedding {
    pub fn new(config: RopeConfig, device: &Device) -> RopeResult<Self> {
        if !config.base.is_finite() || config.base <= 0.0 {
            return Err(shape_err(format!("rope base must be positive, got {}", config.base)));
        }
        let table = shared_table(
            config.max_position_embeddings,
            config.pos_embd_dim,
            config.base,
            device,
        )?;
        log::info!(
            "rotary embedding: {} positions, dim {}, base {}",
            config.max_position_embeddings,
            config.pos_embd_dim,
            config.base
        );
        Ok(Self {
            config,
            device: device.clone(),
            table: RwLock::new(table),
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    /// Current table snapshot.
    pub fn table(&self) -> RopeResult<Arc<RotaryTable>> {
        let guard = self.table.read().map_err(|_| RopeError::Poisoned)?;
        Ok(Arc::clone(&guard))
    }

    /// Returns a table covering at least `required` positions, regenerating
    /// the shared table when the current one is too short.
    pub fn ensure_capacity(&self, required: usize) -> RopeResult<Arc<RotaryTable>> {
        let current = self.table()?;
        if current.positions() >= required {
            return Ok(current);
        }
        let mut guard = self.table.write().map_err(|_| RopeError::Poisoned)?;
        if guard.positions() >= required {
            return Ok(Arc::clone(&guard));
        }
        log::debug!(
            "rope table regrow: {} -> {} positions",
            guard.positions(),
            required
        );
        let table = shared_table(required, self.config.pos_embd_dim, self.config.base, &self.device)?;
        *guard = Arc::clone(&table);
        Ok(table)
    }

    /// Rotates `x` at the given positions.
    ///
    /// `x` is `[batch, seq, num_head * head_dim]` or `[batch, seq, num_head,
    /// head_dim]`; with `split_qkv` the channel axis holds query, key and value
    /// back to back (`3 * num_head * head_dim` channels, or `3 * num_head`
    /// heads in the rank-4 form). `position_ids` is `[seq]` or `[batch, seq]`
    /// and may be non-contiguous. `seq_len`, when given, is the total context
    /// length the table must cover.
    #[allow(clippy::too_many_arguments)]
    pub fn apply(
        &self,
        x: &Tensor,
        position_ids: &Tensor,
        num_head: usize,
        head_dim: usize,
        offset: usize,
        rotary_ndims: usize,
        seq_len: Option<usize>,
        split_qkv: bool,
    ) -> RopeResult<RopeOutput> {
        if num_head == 0 || head_dim == 0 {
            return Err(shape_err("num_head and head_dim must be non-zero"));
        }
        if rotary_ndims == 0 || rotary_ndims % 2 != 0 || rotary_ndims > head_dim {
            return Err(shape_err(format!(
                "rotary_ndims must be even and within head_dim {head_dim}, got {rotary_ndims}"
            )));
        }
        if rotary_ndims > self.config.pos_embd_dim {
            return Err(shape_err(format!(
                "rotary_ndims {rotary_ndims} exceeds the table dimension {}",
                self.config.pos_embd_dim
            )));
        }
        let pairing = if offset == 1 {
            Pairing::Interleaved
        } else if offset == rotary_ndims / 2 {
            Pairing::HalfSplit
        } else {
            return Err(shape_err(format!(
                "offset must be 1 or rotary_ndims / 2 = {}, got {offset}",
                rotary_ndims / 2
            )));
        };

        let groups = if split_qkv { 3 } else { 1 };
        let (batch, seq) = match x.dims() {
            &[b, s, c] if c == groups * num_head * head_dim => (b, s),
            &[b, s, h, d] if h == groups * num_head && d == head_dim => (b, s),
            dims => {
                return Err(shape_err(format!(
                    "expected x as [batch, seq, {}] or [batch, seq, {}, {head_dim}], got {dims:?}",
                    groups * num_head * head_dim,
                    groups * num_head
                )))
            }
        };

        let (positions, pos_batch) = self.read_positions(position_ids, batch, seq)?;
        let max_pos = positions.iter().copied().max().unwrap_or(0) as usize;
        let required = seq_len.unwrap_or(0).max(max_pos + 1);
        let table = self.ensure_capacity(required)?;

        // Gather the rows for every position: [pos_batch, seq, 1, rotary_ndims / 2].
        let half = rotary_ndims / 2;
        let index = Tensor::from_vec(positions, pos_batch * seq, &self.device)?;
        let gather = |t: &Tensor| -> RopeResult<Tensor> {
            Ok(t.narrow(1, 0, half)?
                .index_select(&index, 0)?
                .reshape((pos_batch, seq, 1, half))?)
        };
        let sin = gather(table.sin())?;
        let cos = gather(table.cos())?;

        let heads = x.reshape((batch, seq, groups * num_head, head_dim))?;
        let rotate_heads = |t: &Tensor| rotate(t, &sin, &cos, rotary_ndims, pairing);

        if split_qkv {
            let query = rotate_heads(&heads.narrow(2, 0, num_head)?)?;
            let key = rotate_heads(&heads.narrow(2, num_head, num_head)?)?;
            let value = heads.narrow(2, 2 * num_head, num_head)?.contiguous()?;
            Ok(RopeOutput::Split { query, key, value })
        } else {
            let rotated = rotate_heads(&heads)?.reshape(x.dims())?;
            Ok(RopeOutput::Single(rotated))
        }
    }

    fn read_positions(
        &self,
        position_ids: &Tensor,
        batch: usize,
        seq: usize,
    ) -> RopeResult<(Vec<u32>, usize)> {
        if !position_ids.dtype().is_int() {
            return Err(shape_err(format!(
                "position_ids must be an integer tensor, got {:?}",
                position_ids.dtype()
            )));
        }
        let pos_batch = match position_ids.dims() {
            &[s] if s == seq => 1,
            &[b, s] if s == seq && (b == batch || b == 1) => b,
            dims => {
                return Err(shape_err(format!(
                    "position_ids {dims:?} do not match batch {batch} and sequence {seq}"
                )))
            }
        };
        let raw = position_ids
            .to_dtype(DType::I64)?
            .flatten_all()?
            .to_vec1::<i64>()?;
        let mut positions = Vec::with_capacity(raw.len());
        for p in raw {
            let p = u32::try_from(p)
                .map_err(|_| shape_err(format!("position id {p} is out of range")))?;
            positions.push(p);
        }
        Ok((positions, pos_batch))
    }
}

/// Rotates the first `rotary_ndims` channels of `[batch, seq, heads, dim]`
/// with `[b, seq, 1, rotary_ndims / 2]` tables, in f32.
fn rotate(
    x: &Tensor,
    sin: &Tensor,
    cos: &Tensor,
    rotary_ndims: usize,
    pairing: Pairing,
) -> RopeResult<Tensor> {
    let (batch, seq, heads, dim) = x.dims4()?;
    let dtype = x.dtype();
    let half = rotary_ndims / 2;
    let rot = x.narrow(3, 0, rotary_ndims)?.to_dtype(DType::F32)?;

    let rotated = match pairing {
        Pairing::Interleaved => {
            let pairs = rot.reshape((batch, seq, heads, half, 2))?;
            let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
            let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;
            let out_even = (even.broadcast_mul(cos)? - odd.broadcast_mul(sin)?)?;
            let out_odd = (odd.broadcast_mul(cos)? + even.broadcast_mul(sin)?)?;
            Tensor::stack(&[&out_even, &out_odd], 4)?.reshape((batch, seq, heads, rotary_ndims))?
        }
        Pairing::HalfSplit => {
            let first = rot.narrow(3, 0, half)?;
            let second = rot.narrow(3, half, half)?;
            let out_first = (first.broadcast_mul(cos)? - second.broadcast_mul(sin)?)?;
            let out_second = (second.broadcast_mul(cos)? + first.broadcast_mul(sin)?)?;
            Tensor::cat(&[&out_first, &out_second], 3)?
        }
    };
    let rotated = rotated.to_dtype(dtype)?;

    if rotary_ndims == dim {
        Ok(rotated)
    } else {
        let tail = x.narrow(3, rotary_ndims, dim - rotary_ndims)?;
        Ok(Tensor::cat(&[&rotated, &tail], 3)?)
    }
}
