//! Per-call options for the forward pass.

use num_traits::Float;

/// Interpretation of a key-padding or attention mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskMode {
    /// Values are added to the scores as-is (`0` keeps, `-inf` drops).
    #[default]
    Add,
    /// Zero entries drop the position, any other value keeps it.
    Mul,
}

impl MaskMode {
    /// Convert a raw mask value into its additive contribution.
    #[inline]
    pub fn additive<F: Float>(self, value: F) -> F {
        match self {
            MaskMode::Add => value,
            MaskMode::Mul if value == F::zero() => F::neg_infinity(),
            MaskMode::Mul => F::zero(),
        }
    }
}

/// Scalar knobs of a forward call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftmaxOptions {
    /// Multiplier applied to the raw scores before any bias or mask.
    pub scale: f64,
    /// How the key-padding mask, when supplied, is interpreted.
    pub key_padding_mode: MaskMode,
    /// How the attention mask, when supplied, is interpreted.
    pub attn_mask_mode: MaskMode,
    /// Forbid attending to columns past the current row.
    pub causal: bool,
}

impl Default for SoftmaxOptions {
    fn default() -> Self {
        Self {
            scale: 1.0,
            key_padding_mode: MaskMode::Add,
            attn_mask_mode: MaskMode::Add,
            causal: false,
        }
    }
}

impl SoftmaxOptions {
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn with_key_padding_mode(mut self, mode: MaskMode) -> Self {
        self.key_padding_mode = mode;
        self
    }

    pub fn with_attn_mask_mode(mut self, mode: MaskMode) -> Self {
        self.attn_mask_mode = mode;
        self
    }

    /// The scale is only applied when it differs from one.
    pub(crate) fn applies_scale(&self) -> bool {
        self.scale != 1.0
    }
}
