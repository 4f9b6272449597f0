//! Error types emitted by the block-sparse softmax.

use candle_core::DType;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SoftmaxError>;

/// Failure categories for layout construction and kernel dispatch.
#[derive(Debug, Error)]
pub enum SoftmaxError {
    /// An optional input does not share the element type of the scores.
    #[error("{input} has dtype {got:?} but the scores are {expected:?}")]
    DTypeMismatch {
        input: &'static str,
        expected: DType,
        got: DType,
    },
    /// An input lives on a different device than the scores.
    #[error("{input} does not reside on the device of the scores")]
    DeviceMismatch { input: &'static str },
    /// The kernels do not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// Buffer sizes or tensor shapes disagree with the layout.
    #[error("invalid tensor shape for {context}")]
    InvalidShape { context: String },
    /// The layout or a look-up table violates its structural contract.
    #[error("malformed layout: {context}")]
    MalformedLayout { context: String },
    /// `grad` was called without an unconsumed forward pass.
    #[error("grad requires a pending forward pass; saved state is single-use")]
    NoPendingForward,
    /// A lock guarding operator state was poisoned by a panicking thread.
    #[error("{what} lock poisoned")]
    Poisoned { what: &'static str },
    /// A candle failure propagated to the caller.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl SoftmaxError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn malformed(context: impl Into<String>) -> Self {
        Self::MalformedLayout {
            context: context.into(),
        }
    }
}
