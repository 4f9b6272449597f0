//! Block-sparse layout descriptors.
//!
//! A [`Layout`] is a boolean indicator of shape `[heads, rows, cols]` over
//! `B×B` tiles. `true` marks a materialized tile. The packed score buffer
//! stores the active tiles in the row-major order of [`Layout::active_tiles`].

use candle_core::{DType, Tensor};

use crate::core::{Result, SoftmaxError};

/// Immutable tile indicator over (head, block-row, block-col).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    heads: usize,
    rows: usize,
    cols: usize,
    active: Vec<bool>,
}

impl Layout {
    /// Wrap a flat row-major indicator of length `heads * rows * cols`.
    pub fn new(heads: usize, rows: usize, cols: usize, active: Vec<bool>) -> Result<Self> {
        if heads == 0 || rows == 0 || cols == 0 {
            return Err(SoftmaxError::malformed(format!(
                "layout dimensions must be non-zero, got [{heads}, {rows}, {cols}]"
            )));
        }
        let expected = heads
            .checked_mul(rows)
            .and_then(|hr| hr.checked_mul(cols))
            .ok_or_else(|| SoftmaxError::malformed("layout dimensions overflow usize"))?;
        if active.len() != expected {
            return Err(SoftmaxError::malformed(format!(
                "layout [{heads}, {rows}, {cols}] expects {expected} entries, got {}",
                active.len()
            )));
        }
        Ok(Self {
            heads,
            rows,
            cols,
            active,
        })
    }

    /// Build a layout by evaluating `is_active(head, row, col)` for every tile.
    pub fn from_fn(
        heads: usize,
        rows: usize,
        cols: usize,
        mut is_active: impl FnMut(usize, usize, usize) -> bool,
    ) -> Result<Self> {
        let mut active = Vec::with_capacity(heads * rows * cols);
        for h in 0..heads {
            for r in 0..rows {
                for c in 0..cols {
                    active.push(is_active(h, r, c));
                }
            }
        }
        Self::new(heads, rows, cols, active)
    }

    /// Fully materialized layout.
    pub fn dense(heads: usize, rows: usize, cols: usize) -> Result<Self> {
        Self::from_fn(heads, rows, cols, |_, _, _| true)
    }

    /// Read a layout from a rank-3 tensor; nonzero entries are active.
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let (heads, rows, cols) = tensor.dims3().map_err(|_| {
            SoftmaxError::shape(format!(
                "layout must have shape [heads, rows, cols], got {:?}",
                tensor.dims()
            ))
        })?;
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Self::new(
            heads,
            rows,
            cols,
            values.into_iter().map(|v| v != 0.0).collect(),
        )
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(heads, rows, cols)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.heads, self.rows, self.cols)
    }

    /// Number of flattened (head, block-row) ids.
    pub fn block_rows(&self) -> usize {
        self.heads * self.rows
    }

    pub fn is_active(&self, head: usize, row: usize, col: usize) -> bool {
        self.active[(head * self.rows + row) * self.cols + col]
    }

    /// Total number of active tiles.
    pub fn nnz(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    /// Active tiles in block-row `row` of head `head`.
    pub fn row_count(&self, head: usize, row: usize) -> usize {
        let start = (head * self.rows + row) * self.cols;
        self.active[start..start + self.cols]
            .iter()
            .filter(|&&a| a)
            .count()
    }

    /// Active `(head, row, col)` triples in packing order.
    pub fn active_tiles(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        let (rows, cols) = (self.rows, self.cols);
        self.active
            .iter()
            .enumerate()
            .filter(|&(_, &a)| a)
            .map(move |(idx, _)| (idx / (rows * cols), (idx / cols) % rows, idx % cols))
    }
}
