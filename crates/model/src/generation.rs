//! Greedy and beam-search decoding with per-token latency capture.

use std::time::{Duration, Instant};

use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::{
    model::{CacheMode, Model},
    ModelError, ModelResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    /// 1 decodes greedily.
    pub num_beams: usize,
    pub cache_mode: CacheMode,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            num_beams: 1,
            cache_mode: CacheMode::Full,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutput {
    /// Prompt followed by the generated tokens of the best beam, per batch item.
    pub sequences: Vec<Vec<u32>>,
    /// Wall time of every decoding step; the first entry includes the prompt.
    pub token_latencies: Vec<Duration>,
}

/// Decodes `max_new_tokens` tokens after every prompt of `input_ids`
/// (`[batch, prompt_len]`, unpadded).
///
/// The cache capacity is sized to `prompt_len + max_new_tokens`. With beams,
/// the parents chosen at step `n` are handed to the model as the beam
/// selection of step `n + 1`, before its keys are appended.
pub fn generate(
    model: &mut Model,
    input_ids: &Tensor,
    config: &GenerationConfig,
) -> ModelResult<GenerationOutput> {
    let (batch, prompt_len) = input_ids.dims2()?;
    if prompt_len == 0 {
        return Err(ModelError::Input("prompt must hold at least one token".to_string()));
    }
    let beams = config.num_beams.max(1);
    if beams > model.config().vocab_size {
        return Err(ModelError::Input(format!(
            "num_beams {beams} exceeds the vocabulary size {}",
            model.config().vocab_size
        )));
    }
    let prompts = input_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let rows = batch * beams;
    let device = model.device().clone();
    model.configure_cache(beams, prompt_len + config.max_new_tokens);
    log::info!(
        "generate: batch={batch} beams={beams} prompt={prompt_len} new={} mode={:?}",
        config.max_new_tokens,
        config.cache_mode
    );

    let mut sequences: Vec<Vec<u32>> = (0..rows).map(|row| prompts[row / beams].clone()).collect();
    let mut scores: Vec<f32> = (0..rows)
        .map(|row| if row % beams == 0 { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    let mut next_input = token_tensor(&sequences, &device)?;
    let mut past = None;
    let mut selection: Option<Vec<u32>> = None;
    let mut latencies = Vec::with_capacity(config.max_new_tokens);

    for _ in 0..config.max_new_tokens {
        let start = Instant::now();
        let output = match config.cache_mode {
            CacheMode::None => model.forward(
                &token_tensor(&sequences, &device)?,
                None,
                None,
                None,
                CacheMode::None,
                None,
            )?,
            mode => model.forward(&next_input, None, None, past.take(), mode, selection.as_deref())?,
        };
        past = output.present;
        let seq = output.logits.dim(1)?;
        let last = output.logits.narrow(1, seq - 1, 1)?.squeeze(1)?.to_dtype(DType::F32)?;

        let (parents, tokens) = if beams == 1 {
            ((0..rows as u32).collect::<Vec<_>>(), last.argmax(D::Minus1)?.to_vec1::<u32>()?)
        } else {
            let log_probs = log_softmax(&last, D::Minus1)?.to_vec2::<f32>()?;
            beam_step(&log_probs, &mut scores, beams)
        };

        sequences = parents
            .iter()
            .zip(&tokens)
            .map(|(&parent, &token)| {
                let mut sequence = sequences[parent as usize].clone();
                sequence.push(token);
                sequence
            })
            .collect();
        selection = (beams > 1).then_some(parents);
        next_input = Tensor::from_vec(tokens, (rows, 1), &device)?;
        latencies.push(start.elapsed());
    }

    let best = (0..batch)
        .map(|item| {
            let rows = item * beams..(item + 1) * beams;
            let winner = rows
                .clone()
                .max_by(|&a, &b| scores[a].total_cmp(&scores[b]))
                .unwrap_or(rows.start);
            sequences[winner].clone()
        })
        .collect();
    Ok(GenerationOutput {
        sequences: best,
        token_latencies: latencies,
    })
}

fn token_tensor(sequences: &[Vec<u32>], device: &candle_core::Device) -> ModelResult<Tensor> {
    let len = sequences.first().map_or(0, Vec::len);
    let flat: Vec<u32> = sequences.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (sequences.len(), len), device)?)
}

/// One beam-search step. Returns the global parent row and the new token of
/// every row and updates the cumulative log-probabilities in place.
fn beam_step(log_probs: &[Vec<f32>], scores: &mut [f32], beams: usize) -> (Vec<u32>, Vec<u32>) {
    let rows = scores.len();
    let mut parents = Vec::with_capacity(rows);
    let mut tokens = Vec::with_capacity(rows);
    let mut next_scores = Vec::with_capacity(rows);
    for item in 0..rows / beams {
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for row in item * beams..(item + 1) * beams {
            if scores[row] == f32::NEG_INFINITY {
                continue;
            }
            let mut order: Vec<usize> = (0..log_probs[row].len()).collect();
            order.sort_unstable_by(|&a, &b| log_probs[row][b].total_cmp(&log_probs[row][a]));
            for &token in order.iter().take(beams) {
                candidates.push((scores[row] + log_probs[row][token], row, token));
            }
        }
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        for &(score, row, token) in candidates.iter().take(beams) {
            parents.push(row as u32);
            tokens.push(token as u32);
            next_scores.push(score);
        }
    }
    scores.copy_from_slice(&next_scores);
    (parents, tokens)
}

/// First-token and next-token latency statistics over several runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub runs: usize,
    pub first_token: Duration,
    pub next_token_mean: Duration,
    pub next_token_p90: Duration,
    pub next_token_p99: Duration,
}

impl LatencySummary {
    /// Summarises per-run token latencies; `None` without any run.
    pub fn from_runs(runs: &[Vec<Duration>]) -> Option<Self> {
        let firsts: Vec<Duration> = runs.iter().filter_map(|run| run.first().copied()).collect();
        if firsts.is_empty() {
            return None;
        }
        let mut next: Vec<Duration> = runs
            .iter()
            .flat_map(|run| run.iter().skip(1).copied())
            .collect();
        next.sort();
        let percentile = |p: f64| -> Duration {
            if next.is_empty() {
                return Duration::ZERO;
            }
            let index = ((next.len() as f64 * p) as usize).min(next.len() - 1);
            next[index]
        };
        Some(Self {
            runs: firsts.len(),
            first_token: mean(&firsts),
            next_token_mean: mean(&next),
            next_token_p90: percentile(0.9),
            next_token_p99: percentile(0.99),
        })
    }
}

fn mean(values: &[Duration]) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.iter().sum::<Duration>() / values.len() as u32
}
