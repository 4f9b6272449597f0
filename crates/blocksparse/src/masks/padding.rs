//! Key-padding masks of shape `[batch, k_len]`.

use candle_core::{DType, Device, Tensor};

use super::{finish, mask_value};
use crate::core::{MaskMode, Result, SoftmaxError};

/// Mask every key at or beyond each batch entry's valid length.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
    mode: MaskMode,
    dtype: DType,
) -> Result<Tensor> {
    let batch = key_lengths.len();
    let mut data = vec![mask_value(true, mode); batch * k_len];
    for (b, &valid) in key_lengths.iter().enumerate() {
        let valid = valid.min(k_len);
        data[b * k_len + valid..(b + 1) * k_len].fill(mask_value(false, mode));
    }
    finish(data, (batch, k_len), dtype, device)
}

/// Mask keys flagged `true` in per-batch padding indicators.
///
/// Every inner slice must share the same length.
pub fn padding_mask_from_booleans(
    device: &Device,
    padding: &[Vec<bool>],
    mode: MaskMode,
    dtype: DType,
) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(bad) = padding.iter().position(|mask| mask.len() != k_len) {
        return Err(SoftmaxError::shape(format!(
            "padding mask {bad} has {} keys, expected {k_len}",
            padding[bad].len()
        )));
    }
    let data = padding
        .iter()
        .flatten()
        .map(|&is_padding| mask_value(!is_padding, mode))
        .collect();
    finish(data, (padding.len(), k_len), dtype, device)
}
