//! Element types accepted by the kernels.
//!
//! Storage follows the caller's dtype while arithmetic is promoted to a
//! compute type: `f32` for the half-precision formats and `f32`, `f64` for
//! `f64`.

use candle_core::WithDType;
use half::{bf16, f16};
use num_traits::Float;

/// Floating-point storage type of a packed score buffer.
pub trait Element: WithDType {
    /// Type used for masking, reductions and the softmax itself.
    type Compute: Float + Send + Sync + std::fmt::Debug;

    fn to_compute(self) -> Self::Compute;
    fn from_compute(value: Self::Compute) -> Self;
    fn compute_from_f64(value: f64) -> Self::Compute;
}

impl Element for f32 {
    type Compute = f32;

    #[inline(always)]
    fn to_compute(self) -> f32 {
        self
    }

    #[inline(always)]
    fn from_compute(value: f32) -> Self {
        value
    }

    #[inline(always)]
    fn compute_from_f64(value: f64) -> f32 {
        value as f32
    }
}

impl Element for f64 {
    type Compute = f64;

    #[inline(always)]
    fn to_compute(self) -> f64 {
        self
    }

    #[inline(always)]
    fn from_compute(value: f64) -> Self {
        value
    }

    #[inline(always)]
    fn compute_from_f64(value: f64) -> f64 {
        value
    }
}

impl Element for f16 {
    type Compute = f32;

    #[inline(always)]
    fn to_compute(self) -> f32 {
        self.to_f32()
    }

    #[inline(always)]
    fn from_compute(value: f32) -> Self {
        f16::from_f32(value)
    }

    #[inline(always)]
    fn compute_from_f64(value: f64) -> f32 {
        value as f32
    }
}

impl Element for bf16 {
    type Compute = f32;

    #[inline(always)]
    fn to_compute(self) -> f32 {
        self.to_f32()
    }

    #[inline(always)]
    fn from_compute(value: f32) -> Self {
        bf16::from_f32(value)
    }

    #[inline(always)]
    fn compute_from_f64(value: f64) -> f32 {
        value as f32
    }
}
