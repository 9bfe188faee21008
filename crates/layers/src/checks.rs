//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the checked value so that failures read
//! like `linear.weight: expected shape [4, 8], got [8, 4]`. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{DType, Error, Result, Tensor};

fn fail(label: &str, message: String) -> Error {
    Error::Msg(format!("{label}: {message}"))
}

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(fail(
            label,
            format!("expected shape {:?}, got {:?}", expected, actual),
        ))
    }
}

/// Validates that the trailing axis carries `features` channels.
pub fn expect_last_dim(label: &str, tensor: &Tensor, features: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == features && tensor.rank() >= 2 => Ok(()),
        _ => Err(fail(
            label,
            format!("expected (.., {features}) layout, got {:?}", tensor.dims()),
        )),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(fail(
            label,
            format!("expected dtype in {:?}, got {:?}", allowed, dtype),
        ))
    }
}

/// Rejects strided views where the kernels expect packed storage.
pub fn expect_contiguous(label: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(fail(label, "tensor must be contiguous".to_string()))
    }
}

/// Float dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
