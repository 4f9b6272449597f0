//! Forward and backward kernels over packed block-sparse buffers.
//!
//! A logical task covers one `(block-row, intra-block row, batch)` line. The
//! dispatch groups the `B` lines of a `(block-row, batch)` pair into one work
//! item: that pair owns a contiguous range of the packed buffer, so the buffer
//! is split into disjoint mutable segments up front and handed to rayon
//! without any locking. Block-rows with no active tiles own no storage and
//! produce no work item.

mod backward;
mod forward;

use rayon::prelude::*;

use crate::core::{Result, SoftmaxError};
use crate::lut::Lut;

pub use backward::backward_in_place;
pub use forward::forward_in_place;

/// Optional bias and mask inputs of a forward call.
///
/// * `rpe`: `[1 | batch, heads, rows·B, cols·B]`
/// * `key_padding_mask`: `[1 | batch, cols·B]`
/// * `attn_mask`: `[rows·B, cols·B]`
#[derive(Debug)]
pub struct MaskInputs<'a, T> {
    pub rpe: Option<&'a [T]>,
    pub key_padding_mask: Option<&'a [T]>,
    pub attn_mask: Option<&'a [T]>,
}

impl<T> Default for MaskInputs<'_, T> {
    fn default() -> Self {
        Self {
            rpe: None,
            key_padding_mask: None,
            attn_mask: None,
        }
    }
}

impl<T> Clone for MaskInputs<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for MaskInputs<'_, T> {}

impl<'a, T> MaskInputs<'a, T> {
    pub fn with_rpe(mut self, rpe: &'a [T]) -> Self {
        self.rpe = Some(rpe);
        self
    }

    pub fn with_key_padding_mask(mut self, mask: &'a [T]) -> Self {
        self.key_padding_mask = Some(mask);
        self
    }

    pub fn with_attn_mask(mut self, mask: &'a [T]) -> Self {
        self.attn_mask = Some(mask);
        self
    }
}

/// A `(block-row, batch)` region of a packed buffer.
pub(crate) struct RowSegment<'a, T> {
    pub batch: usize,
    pub row_id: usize,
    pub first_tile: usize,
    pub data: &'a mut [T],
}

pub(crate) fn check_buffer_len(lut: &Lut, batch: usize, len: usize, what: &str) -> Result<()> {
    let expected = batch * lut.batch_stride();
    if len != expected {
        return Err(SoftmaxError::shape(format!(
            "{what}: expected {batch} x {} elements ({expected}), got {len}",
            lut.batch_stride()
        )));
    }
    Ok(())
}

/// Split `buf` into one disjoint segment per non-empty `(block-row, batch)`.
pub(crate) fn row_segments<'a, T>(
    lut: &Lut,
    buf: &'a mut [T],
    batch: usize,
) -> Vec<RowSegment<'a, T>> {
    let tile_len = lut.block_size() * lut.block_size();
    let stride = lut.batch_stride();
    let mut segments = Vec::with_capacity(batch * lut.rows_by_tile().len());
    if stride == 0 {
        return segments;
    }
    for (z, mut rest) in buf.chunks_mut(stride).enumerate().take(batch) {
        for &row_id in lut.rows_by_tile() {
            let tiles = lut.row_tiles(row_id);
            let (data, tail) = std::mem::take(&mut rest).split_at_mut(tiles.len() * tile_len);
            segments.push(RowSegment {
                batch: z,
                row_id,
                first_tile: tiles.start,
                data,
            });
            rest = tail;
        }
    }
    segments
}

/// Run `task` over every segment, in parallel when `parallel` is set.
///
/// `init` creates per-worker scratch state reused across segments.
pub(crate) fn dispatch<T, S, I, F>(
    segments: Vec<RowSegment<'_, T>>,
    parallel: bool,
    init: I,
    task: F,
) where
    T: Send,
    I: Fn() -> S + Sync + Send,
    F: Fn(&mut S, RowSegment<'_, T>) + Sync + Send,
{
    if parallel {
        segments
            .into_par_iter()
            .for_each_init(&init, |scratch, segment| task(scratch, segment));
    } else {
        let mut scratch = init();
        for segment in segments {
            task(&mut scratch, segment);
        }
    }
}

/// Softmax over `values` in place. Returns `false` when every value is
/// `-inf`, in which case all outputs are zero.
#[inline]
pub(crate) fn stable_softmax<F: num_traits::Float>(values: &mut [F]) -> bool {
    let max = values.iter().copied().fold(F::neg_infinity(), F::max);
    if max == F::neg_infinity() {
        values.fill(F::zero());
        return false;
    }
    let mut sum = F::zero();
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum = sum + *v;
    }
    for v in values.iter_mut() {
        *v = *v / sum;
    }
    true
}
