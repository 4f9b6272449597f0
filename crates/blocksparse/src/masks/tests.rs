use super::*;
use crate::core::SoftmaxError;
use candle_core::{DType, Device};

fn values(mask: &Tensor) -> Vec<f32> {
    mask.to_dtype(DType::F32)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let (q_len, k_len) = (3, 5);
    let mask = build_causal_mask(&device, q_len, k_len, MaskMode::Add, DType::F32)?;
    assert_eq!(mask.dims(), &[q_len, k_len]);
    let values = values(&mask);

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[2], 0.0);
    assert_eq!(values[3], f32::NEG_INFINITY);
    // Last query sees everything.
    assert!(values[2 * k_len..].iter().all(|&v| v == 0.0));
    Ok(())
}

#[test]
fn square_causal_mask_is_lower_triangular() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_causal_mask(&device, 3, 3, MaskMode::Mul, DType::F16)?;
    assert_eq!(mask.dtype(), DType::F16);
    let expected = vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0, 1.0];
    assert_eq!(values(&mask), expected);
    Ok(())
}

#[test]
fn padding_mask_from_lengths_masks_tail() -> Result<()> {
    let device = Device::Cpu;
    let mask = padding_mask_from_lengths(&device, &[2, 7], 4, MaskMode::Add, DType::F32)?;
    assert_eq!(mask.dims(), &[2, 4]);
    let inf = f32::NEG_INFINITY;
    // Batch 1 is clamped to k_len, so nothing is masked.
    assert_eq!(values(&mask), vec![0.0, 0.0, inf, inf, 0.0, 0.0, 0.0, 0.0]);
    Ok(())
}

#[test]
fn padding_mask_from_booleans_respects_flags() -> Result<()> {
    let device = Device::Cpu;
    let padding = vec![vec![false, true, false], vec![true, true, false]];
    let mask = padding_mask_from_booleans(&device, &padding, MaskMode::Mul, DType::F64)?;
    assert_eq!(mask.dims(), &[2, 3]);
    assert_eq!(values(&mask), vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn ragged_boolean_padding_is_rejected() {
    let padding = vec![vec![false, true], vec![true]];
    let err = padding_mask_from_booleans(&Device::Cpu, &padding, MaskMode::Add, DType::F32)
        .unwrap_err();
    assert!(matches!(err, SoftmaxError::InvalidShape { .. }));
}

#[test]
fn convert_mode_round_trips_between_encodings() -> Result<()> {
    let device = Device::Cpu;
    let additive = padding_mask_from_lengths(&device, &[1, 3], 3, MaskMode::Add, DType::F32)?;
    let multiplicative = convert_mode(&additive, MaskMode::Add, MaskMode::Mul)?;
    assert_eq!(values(&multiplicative), vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
    let back = convert_mode(&multiplicative, MaskMode::Mul, MaskMode::Add)?;
    assert_eq!(values(&back), values(&additive));
    assert_eq!(back.dims(), additive.dims());
    Ok(())
}
