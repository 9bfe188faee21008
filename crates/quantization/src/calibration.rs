//! Calibration samples for smooth-quant.
//!
//! Input is JSON lines of pre-tokenized samples (`{"input_ids": [...]}`).
//! Samples are truncated to `pad_max` tokens and right-padded per batch with
//! token 0 and mask 0. Right padding keeps the real tokens of a causal model
//! unaffected by the pad positions.

use std::{fs, path::Path};

use candle_core::{Device, Tensor};
use serde::Deserialize;

use crate::error::{QuantizationError, QuantizationResult};

/// Upper bound on the batches observed during calibration.
pub const MAX_CALIBRATION_BATCHES: usize = 512;
/// Longest sample kept, in tokens.
pub const PAD_MAX: usize = 512;

#[derive(Debug, Deserialize)]
struct Sample {
    input_ids: Vec<u32>,
}

/// One padded batch ready for a model forward pass.
#[derive(Debug, Clone)]
pub struct CalibrationBatch {
    /// `[rows, seq]` U32.
    pub input_ids: Tensor,
    /// `[rows, seq]` U8, 1 for real tokens.
    pub attention_mask: Tensor,
    /// `[rows, seq]` U32 positions `0..seq`.
    pub position_ids: Tensor,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationSet {
    samples: Vec<Vec<u32>>,
}

impl CalibrationSet {
    /// Keeps non-empty samples, truncated to `pad_max` tokens.
    pub fn from_samples(samples: Vec<Vec<u32>>, pad_max: usize) -> Self {
        let total = samples.len();
        let samples: Vec<Vec<u32>> = samples
            .into_iter()
            .filter(|ids| !ids.is_empty())
            .map(|mut ids| {
                ids.truncate(pad_max.max(1));
                ids
            })
            .collect();
        if samples.len() < total {
            log::warn!("dropped {} empty calibration samples", total - samples.len());
        }
        Self { samples }
    }

    pub fn from_jsonl(path: impl AsRef<Path>, pad_max: usize) -> QuantizationResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut samples = Vec::new();
        for (line_no, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let sample: Sample = serde_json::from_str(line).map_err(|err| {
                QuantizationError::Format(format!(
                    "{}:{}: {}",
                    path.display(),
                    line_no + 1,
                    err
                ))
            })?;
            samples.push(sample.input_ids);
        }
        let set = Self::from_samples(samples, pad_max);
        log::info!(
            "calibration: {} samples from {}",
            set.len(),
            path.display()
        );
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Vec<u32>] {
        &self.samples
    }

    /// Groups samples into padded batches, at most `max_batches` of them.
    ///
    /// Samples holding ids outside `vocab_size` are skipped with a warning.
    pub fn batches(
        &self,
        batch_size: usize,
        max_batches: usize,
        vocab_size: usize,
        device: &Device,
    ) -> QuantizationResult<Vec<CalibrationBatch>> {
        let usable: Vec<&Vec<u32>> = self
            .samples
            .iter()
            .filter(|ids| {
                let ok = ids.iter().all(|id| (*id as usize) < vocab_size);
                if !ok {
                    log::warn!("skipping calibration sample with ids outside vocab {vocab_size}");
                }
                ok
            })
            .collect();
        usable
            .chunks(batch_size.max(1))
            .take(max_batches.min(MAX_CALIBRATION_BATCHES))
            .map(|chunk| pad_batch(chunk, device))
            .collect()
    }
}

fn pad_batch(samples: &[&Vec<u32>], device: &Device) -> QuantizationResult<CalibrationBatch> {
    let rows = samples.len();
    let seq = samples.iter().map(|ids| ids.len()).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(rows * seq);
    let mut mask = Vec::with_capacity(rows * seq);
    for sample in samples {
        ids.extend_from_slice(sample);
        ids.extend(std::iter::repeat(0u32).take(seq - sample.len()));
        mask.extend(std::iter::repeat(1u8).take(sample.len()));
        mask.extend(std::iter::repeat(0u8).take(seq - sample.len()));
    }
    let position_ids = Tensor::arange(0u32, seq as u32, device)?
        .unsqueeze(0)?
        .broadcast_as((rows, seq))?
        .contiguous()?;
    Ok(CalibrationBatch {
        input_ids: Tensor::from_vec(ids, (rows, seq), device)?,
        attention_mask: Tensor::from_vec(mask, (rows, seq), device)?,
        position_ids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_right_padded() -> QuantizationResult<()> {
        let set = CalibrationSet::from_samples(vec![vec![5, 6, 7], vec![8], vec![]], PAD_MAX);
        assert_eq!(set.len(), 2);
        let batches = set.batches(2, 10, 16, &Device::Cpu)?;
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            vec![vec![5, 6, 7], vec![8, 0, 0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u8>()?,
            vec![vec![1, 1, 1], vec![1, 0, 0]]
        );
        assert_eq!(
            batch.position_ids.to_vec2::<u32>()?,
            vec![vec![0, 1, 2], vec![0, 1, 2]]
        );
        Ok(())
    }

    #[test]
    fn truncates_and_caps_batches() -> QuantizationResult<()> {
        let samples = (0..10).map(|i| vec![i; 8]).collect();
        let set = CalibrationSet::from_samples(samples, 4);
        assert!(set.samples().iter().all(|ids| ids.len() == 4));
        let batches = set.batches(3, 2, 16, &Device::Cpu)?;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].input_ids.dims(), &[3, 4]);
        Ok(())
    }

    #[test]
    fn out_of_vocab_samples_are_skipped() -> QuantizationResult<()> {
        let set = CalibrationSet::from_samples(vec![vec![1, 2], vec![1, 99]], PAD_MAX);
        let batches = set.batches(4, 10, 16, &Device::Cpu)?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].input_ids.dims(), &[1, 2]);
        Ok(())
    }

    #[test]
    fn reads_json_lines() -> QuantizationResult<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("calib.jsonl");
        fs::write(&path, "{\"input_ids\": [1, 2, 3]}\n\n{\"input_ids\": [4]}\n")?;
        let set = CalibrationSet::from_jsonl(&path, PAD_MAX)?;
        assert_eq!(set.samples(), &[vec![1, 2, 3], vec![4]]);

        fs::write(&path, "{\"input_ids\": [1]}\nnot json\n")?;
        match CalibrationSet::from_jsonl(&path, PAD_MAX) {
            Err(QuantizationError::Format(message)) => assert!(message.contains(":2:")),
            other => panic!("expected format error, got {other:?}"),
        }
        Ok(())
    }
}
