//! Public operator wrapping layout, look-up tables and kernels.

mod softmax;

pub use softmax::{BlockSparseSoftmax, ForwardPass, MaskFlags, SoftmaxArgs};
