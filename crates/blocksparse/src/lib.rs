//! Block-sparse softmax for attention score matrices.
//!
//! Scores are stored as packed `B×B` tiles: only the tiles named by a
//! [`Layout`] are materialized and every other position of the conceptual
//! `[rows·B, cols·B]` matrix is treated as `-inf`. The packed buffer has shape
//! `[batch, nnz·B·B]`, with tiles concatenated in row-major `(head, row, col)`
//! order over the active entries of the layout.
//!
//! The forward pass applies an optional scale, relative-position bias,
//! key-padding mask, attention mask and causal mask before a numerically
//! stable softmax over each (block-row, intra-block row, batch) line. The
//! backward pass computes the softmax Jacobian-vector product in place.
//!
//! [`BlockSparseSoftmax`] owns the layout and a per-device cache of look-up
//! tables. It exposes two surfaces:
//!
//! * a tensor API ([`BlockSparseSoftmax::apply`] / [`BlockSparseSoftmax::grad`])
//!   over candle tensors, which returns fresh tensors and keeps single-use
//!   saved state for the gradient call;
//! * a slice API ([`BlockSparseSoftmax::forward`]) that mutates the caller's
//!   buffer in place and hands back a [`ForwardPass`] token that can be
//!   consumed exactly once by [`ForwardPass::backward`].
//!
//! Arithmetic runs in `f32` for `f16`, `bf16` and `f32` inputs, and in `f64`
//! for `f64` inputs.

pub mod core;
pub mod kernels;
pub mod layout;
pub mod lut;
pub mod masks;
pub mod ops;

pub use crate::core::{Config, Element, MaskMode, Result, SoftmaxError, SoftmaxOptions};
pub use kernels::MaskInputs;
pub use layout::Layout;
pub use lut::{DeviceKind, Lut, LutCache};
pub use ops::{BlockSparseSoftmax, ForwardPass, SoftmaxArgs};
