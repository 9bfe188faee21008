use super::*;
use candle_core::{Device, IndexOp, Result, Tensor};

const NEG: f32 = f32::NEG_INFINITY;

/// Row `q` of head 0, batch `b`.
fn row(mask: &Tensor, b: usize, q: usize) -> Result<Vec<f32>> {
    mask.i((b, 0, q))?.to_vec1::<f32>()
}

#[test]
fn prefill_mask_is_lower_triangular() -> Result<()> {
    let mask = build_causal_mask(&Device::Cpu, 1, 2, 3, 3)?;
    assert_eq!(mask.dims(), &[1, 2, 3, 3]);
    assert_eq!(row(&mask, 0, 0)?, vec![0.0, NEG, NEG]);
    assert_eq!(row(&mask, 0, 1)?, vec![0.0, 0.0, NEG]);
    assert_eq!(row(&mask, 0, 2)?, vec![0.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn appended_tokens_see_the_cached_history() -> Result<()> {
    // Two new tokens after three cached positions.
    let mask = build_causal_mask(&Device::Cpu, 1, 1, 2, 5)?;
    assert_eq!(row(&mask, 0, 0)?, vec![0.0, 0.0, 0.0, 0.0, NEG]);
    assert_eq!(row(&mask, 0, 1)?, vec![0.0; 5]);

    // A single decode step never masks anything.
    let step = build_causal_mask(&Device::Cpu, 1, 1, 1, 7)?;
    assert_eq!(row(&step, 0, 0)?, vec![0.0; 7]);
    Ok(())
}

#[test]
fn causal_block_is_a_column_slice_of_the_full_mask() -> Result<()> {
    let device = Device::Cpu;
    let full = build_causal_mask(&device, 1, 1, 3, 7)?.i((0, 0))?;
    for (start, len) in [(0, 3), (2, 4), (4, 3)] {
        let block = causal_block(&device, 3, 7, start, len)?;
        assert_eq!(block.to_vec2::<f32>()?, full.narrow(1, start, len)?.to_vec2::<f32>()?);
    }
    Ok(())
}

#[test]
fn padding_drops_the_right_tail() -> Result<()> {
    let mask = padding_mask_from_lengths(&Device::Cpu, &[2, 9], 2, 3, 4)?;
    assert_eq!(mask.dims(), &[2, 2, 3, 4]);
    for q in 0..3 {
        assert_eq!(row(&mask, 0, q)?, vec![0.0, 0.0, NEG, NEG]);
        assert_eq!(row(&mask, 1, q)?, vec![0.0; 4]);
    }
    Ok(())
}

#[test]
fn padding_and_causal_masks_compose_by_addition() -> Result<()> {
    let device = Device::Cpu;
    let causal = build_causal_mask(&device, 1, 1, 3, 5)?;
    let padding = padding_mask_from_lengths(&device, &[4], 1, 3, 5)?;
    let combined = causal.add(&padding)?;
    assert_eq!(row(&combined, 0, 0)?, vec![0.0, 0.0, 0.0, NEG, NEG]);
    assert_eq!(row(&combined, 0, 2)?, vec![0.0, 0.0, 0.0, 0.0, NEG]);
    Ok(())
}

#[test]
fn model_attention_mask_becomes_additive_per_row() -> Result<()> {
    let device = Device::Cpu;
    for mask in [
        Tensor::new(&[[1i64, 1, 0], [1, 1, 1]], &device)?,
        Tensor::new(&[[1u8, 1, 0], [1, 1, 1]], &device)?,
        Tensor::new(&[[1f32, 1., 0.], [1., 1., 1.]], &device)?,
    ] {
        let additive = additive_from_attention_mask(&mask)?;
        assert_eq!(additive.dims(), &[2, 1, 1, 3]);
        assert_eq!(row(&additive, 0, 0)?, vec![0.0, 0.0, NEG]);
        assert_eq!(row(&additive, 1, 0)?, vec![0.0; 3]);
    }
    Ok(())
}

#[test]
fn causal_mask_folds_in_row_padding() -> Result<()> {
    let device = Device::Cpu;
    let padding = Tensor::new(&[[0u32, 1, 1, 1], [1, 1, 1, 1]], &device)?;
    let mask = causal_with_attention_mask(&device, Some(&padding), 2, 4)?;
    assert_eq!(mask.dims(), &[2, 1, 2, 4]);
    assert_eq!(row(&mask, 0, 0)?, vec![NEG, 0.0, 0.0, NEG]);
    assert_eq!(row(&mask, 1, 1)?, vec![0.0; 4]);

    let bare = causal_with_attention_mask(&device, None, 2, 4)?;
    assert_eq!(bare.dims(), &[1, 1, 2, 4]);
    assert_eq!(row(&bare, 0, 0)?, vec![0.0, 0.0, 0.0, NEG]);
    Ok(())
}

#[test]
fn boolean_masks_become_additive() -> Result<()> {
    let mask = Tensor::new(&[[[[1u8, 0, 1]]]], &Device::Cpu)?;
    let additive = to_additive(&mask)?;
    assert_eq!(additive.dtype(), MASK_DTYPE);
    assert_eq!(row(&additive, 0, 0)?, vec![0.0, NEG, 0.0]);
    Ok(())
}

#[test]
fn prepare_mask_accepts_broadcast_axes_only() -> Result<()> {
    let device = Device::Cpu;
    let ok = Tensor::zeros((2, 1, 1, 5), MASK_DTYPE, &device)?;
    assert!(prepare_mask(&ok, 2, 4, 3, 5).is_ok());
    let per_head = Tensor::zeros((1, 4, 3, 5), MASK_DTYPE, &device)?;
    assert!(prepare_mask(&per_head, 2, 4, 3, 5).is_ok());
    for bad in [(2, 3, 1, 5), (2, 1, 3, 4), (3, 1, 1, 5)] {
        let mask = Tensor::zeros(bad, MASK_DTYPE, &device)?;
        assert!(matches!(
            prepare_mask(&mask, 2, 4, 3, 5),
            Err(AttentionError::InvalidShape { .. })
        ));
    }
    assert!(prepare_mask(&Tensor::zeros((2, 5), MASK_DTYPE, &device)?, 2, 4, 3, 5).is_err());
    Ok(())
}
