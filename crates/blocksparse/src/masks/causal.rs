//! Causal attention masks.
//!
//! The causal flag of the forward pass covers square score matrices. These
//! builders are for callers that need the same constraint as an explicit
//! attention mask, for example when `k_len > q_len`.

use candle_core::{DType, Device, Tensor};

use super::{finish, mask_value};
use crate::core::{MaskMode, Result};

/// Construct a `[q_len, k_len]` causal mask.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_mask(
    device: &Device,
    q_len: usize,
    k_len: usize,
    mode: MaskMode,
    dtype: DType,
) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let (keep, drop) = (mask_value(true, mode), mask_value(false, mode));
    let mut data = vec![keep; q_len * k_len];
    for q in 0..q_len {
        let row = &mut data[q * k_len..(q + 1) * k_len];
        for (k, value) in row.iter_mut().enumerate() {
            if k > q + offset {
                *value = drop;
            }
        }
    }
    finish(data, (q_len, k_len), dtype, device)
}
