use candle_core::{DType, Device, Error, Result, Tensor};

/// Frozen `[vocab, hidden]` lookup table for `embed_tokens`.
///
/// The table is never quantized; it stays in the checkpoint dtype so the
/// residual stream starts in storage precision.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    weight: Tensor,
}

impl TokenEmbedding {
    pub fn new(weight: Tensor) -> Result<Self> {
        let (vocab, hidden) = weight.dims2()?;
        if vocab == 0 || hidden == 0 {
            return Err(Error::Msg(format!("empty embedding table {:?}", weight.dims())));
        }
        Ok(Self { weight })
    }

    /// `N(0, std)` table for synthetic models.
    pub fn random(vocab: usize, hidden: usize, std: f32, dtype: DType, device: &Device) -> Result<Self> {
        Self::new(Tensor::randn(0f32, std, (vocab, hidden), device)?.to_dtype(dtype)?)
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn hidden_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Gathers `[rows, seq]` integer ids into `[rows, seq, hidden]`. A decode
    /// step passes `seq == 1`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (rows, seq) = token_ids
            .dims2()
            .map_err(|_| Error::Msg(format!("token ids must be [rows, seq], got {:?}", token_ids.dims())))?;
        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!("token ids must be integers, got {:?}", token_ids.dtype())));
        }
        let ids = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        if rows * seq > 0 {
            let (lo, hi) = (ids.min(0)?.to_scalar::<i64>()?, ids.max(0)?.to_scalar::<i64>()?);
            let vocab = self.vocab_size() as i64;
            if let Some(bad) = [lo, hi].into_iter().find(|id| *id < 0 || *id >= vocab) {
                return Err(Error::Msg(format!("token id {bad} outside vocabulary of {vocab}")));
            }
        }
        self.weight
            .index_select(&ids.to_dtype(DType::U32)?, 0)?
            .reshape((rows, seq, self.hidden_dim()))
    }
}
