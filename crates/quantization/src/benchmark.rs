//! Token latency benchmark over a loaded (usually quantized) model.

use candle_core::Tensor;
use model::{generate, CacheMode, GenerationConfig, LatencySummary, Model};

use crate::error::{QuantizationError, QuantizationResult};

/// Beams used unless greedy decoding is requested.
pub const DEFAULT_NUM_BEAMS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkOptions {
    pub num_iter: usize,
    pub num_warmup: usize,
    pub batch_size: usize,
    pub input_tokens: usize,
    pub max_new_tokens: usize,
    pub greedy: bool,
}

impl Default for BenchmarkOptions {
    fn default() -> Self {
        Self {
            num_iter: 100,
            num_warmup: 10,
            batch_size: 1,
            input_tokens: 32,
            max_new_tokens: 32,
            greedy: false,
        }
    }
}

impl BenchmarkOptions {
    pub fn num_beams(&self) -> usize {
        if self.greedy {
            1
        } else {
            DEFAULT_NUM_BEAMS
        }
    }
}

/// Deterministic `[batch, tokens]` prompt ids inside the model vocabulary.
pub fn synthetic_prompt(model: &Model, batch: usize, tokens: usize) -> QuantizationResult<Tensor> {
    let vocab_size = model.config().vocab_size;
    let ids: Vec<u32> = (0..batch * tokens)
        .map(|i| ((i * 31 + 7) % vocab_size.max(1)) as u32)
        .collect();
    Ok(Tensor::from_vec(ids, (batch, tokens), model.device())?)
}

/// Runs `num_warmup + num_iter` generations and summarises the timed ones.
pub fn run(model: &mut Model, options: &BenchmarkOptions) -> QuantizationResult<LatencySummary> {
    if options.num_iter == 0 || options.batch_size == 0 || options.input_tokens == 0 {
        return Err(QuantizationError::config(
            "benchmark needs num_iter, batch_size and input_tokens above zero",
        ));
    }
    let max_positions = model.config().max_position_embeddings;
    if options.input_tokens + options.max_new_tokens > max_positions {
        return Err(QuantizationError::config(format!(
            "{} prompt + {} new tokens exceed max_position_embeddings {max_positions}",
            options.input_tokens, options.max_new_tokens
        )));
    }

    let prompt = synthetic_prompt(model, options.batch_size, options.input_tokens)?;
    let generation = GenerationConfig {
        max_new_tokens: options.max_new_tokens,
        num_beams: options.num_beams(),
        cache_mode: CacheMode::Full,
    };
    log::info!(
        "benchmark: batch={} input={} new={} beams={} warmup={} iters={}",
        options.batch_size,
        options.input_tokens,
        options.max_new_tokens,
        generation.num_beams,
        options.num_warmup,
        options.num_iter
    );

    let mut runs = Vec::with_capacity(options.num_iter);
    for iteration in 0..options.num_warmup + options.num_iter {
        let output = generate(model, &prompt, &generation)?;
        if iteration >= options.num_warmup {
            runs.push(output.token_latencies);
        }
    }
    LatencySummary::from_runs(&runs)
        .ok_or_else(|| QuantizationError::config("benchmark produced no timed tokens"))
}
