//! Builders for the mask inputs of the forward pass.
//!
//! Key-padding masks have shape `[batch, k_len]` and attention masks
//! `[q_len, k_len]`, where lengths are measured in elements (`blocks · B`).
//! Additive masks ([`MaskMode::Add`]) hold `0.0` to keep a position and
//! `-inf` to drop it; multiplicative masks ([`MaskMode::Mul`]) hold `1.0` and
//! `0.0`. Builders take the target dtype so masks can match the scores.

pub mod causal;
pub mod padding;

use candle_core::{DType, Device, Tensor};

use crate::core::{MaskMode, Result};

pub use causal::build_causal_mask;
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// Encoded value of a kept or dropped position.
pub fn mask_value(keep: bool, mode: MaskMode) -> f32 {
    match (mode, keep) {
        (MaskMode::Add, true) => 0.0,
        (MaskMode::Add, false) => f32::NEG_INFINITY,
        (MaskMode::Mul, true) => 1.0,
        (MaskMode::Mul, false) => 0.0,
    }
}

/// Re-encode `mask` from one mode to the other, preserving shape and dtype.
pub fn convert_mode(mask: &Tensor, from: MaskMode, to: MaskMode) -> Result<Tensor> {
    if from == to {
        return Ok(mask.clone());
    }
    let values = mask.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let converted: Vec<f32> = values
        .into_iter()
        .map(|v| mask_value(from.additive(v) != f32::NEG_INFINITY, to))
        .collect();
    let tensor = Tensor::from_vec(converted, mask.shape().clone(), mask.device())?;
    Ok(tensor.to_dtype(mask.dtype())?)
}

fn finish(data: Vec<f32>, shape: (usize, usize), dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_vec(data, shape, device)?.to_dtype(dtype)?)
}

#[cfg(test)]
mod tests;
