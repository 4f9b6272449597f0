//! Core types shared by the kernels and the operator.
//!
//! Packed score buffers hold elements of one [`Element`] type. Optional bias
//! and mask inputs must share that type; the slice API enforces this through
//! the type system and the tensor API checks it before touching any data.

pub mod config;
pub mod element;
pub mod errors;
pub mod options;

pub use config::Config;
pub use element::Element;
pub use errors::{Result, SoftmaxError};
pub use options::{MaskMode, SoftmaxOptions};
