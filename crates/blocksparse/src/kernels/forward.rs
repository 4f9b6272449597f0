//! Masked softmax forward pass.

use num_traits::Float;

use super::{check_buffer_len, dispatch, row_segments, stable_softmax, MaskInputs, RowSegment};
use crate::core::{Config, Element, MaskMode, Result, SoftmaxError, SoftmaxOptions};
use crate::lut::Lut;

/// Replace the scores in `x` (shape `[batch, nnz·B·B]`) with probabilities.
///
/// Each line gathers the active tiles of its block-row into a working vector
/// padded with `-inf` to `max_row_count·B`, applies scale, relative-position
/// bias, key-padding mask, attention mask and causal mask in that order, then
/// takes a stable softmax and scatters the real entries back. Lines whose
/// entries are all masked are written as zeros.
pub fn forward_in_place<T: Element>(
    lut: &Lut,
    x: &mut [T],
    batch: usize,
    inputs: MaskInputs<'_, T>,
    options: &SoftmaxOptions,
    config: &Config,
) -> Result<()> {
    check_buffer_len(lut, batch, x.len(), "scores")?;
    let plan = ForwardPlan::new(lut, batch, inputs, options)?;
    let segments = row_segments(lut, x, batch);
    let parallel = config.use_parallel(segments.len());
    log::trace!(
        "blocksparse forward segments={} parallel={parallel}",
        segments.len()
    );
    let width = lut.max_row_count() * lut.block_size();
    dispatch(
        segments,
        parallel,
        || Vec::with_capacity(width),
        |work, segment| plan.run(segment, work),
    );
    Ok(())
}

/// An optional input that is either shared by every batch entry or
/// provided once per batch entry.
#[derive(Clone, Copy)]
struct Batched<'a, T> {
    data: &'a [T],
    per_batch: usize,
    broadcast: bool,
}

impl<'a, T> Batched<'a, T> {
    fn new(data: &'a [T], per_batch: usize, batch: usize, what: &str) -> Result<Self> {
        let broadcast = if data.len() == per_batch * batch {
            false
        } else if data.len() == per_batch {
            true
        } else {
            return Err(SoftmaxError::shape(format!(
                "{what}: expected {per_batch} or {batch} x {per_batch} elements, got {}",
                data.len()
            )));
        };
        Ok(Self {
            data,
            per_batch,
            broadcast,
        })
    }

    #[inline]
    fn get(&self, batch: usize, index: usize) -> &T {
        let z = if self.broadcast { 0 } else { batch };
        &self.data[z * self.per_batch + index]
    }
}

struct ForwardPlan<'a, T: Element> {
    lut: &'a Lut,
    scale: Option<T::Compute>,
    rpe: Option<Batched<'a, T>>,
    key_padding_mask: Option<Batched<'a, T>>,
    attn_mask: Option<&'a [T]>,
    key_padding_mode: MaskMode,
    attn_mask_mode: MaskMode,
    causal: bool,
}

impl<'a, T: Element> ForwardPlan<'a, T> {
    fn new(
        lut: &'a Lut,
        batch: usize,
        inputs: MaskInputs<'a, T>,
        options: &SoftmaxOptions,
    ) -> Result<Self> {
        let (heads, _, _) = lut.dims();
        let (seq_rows, seq_cols) = (lut.seq_rows(), lut.seq_cols());
        let rpe_len = heads * seq_rows * seq_cols;
        let rpe = inputs
            .rpe
            .map(|rpe| Batched::new(rpe, rpe_len, batch, "relative position bias"))
            .transpose()?;
        let key_padding_mask = inputs
            .key_padding_mask
            .map(|mask| Batched::new(mask, seq_cols, batch, "key padding mask"))
            .transpose()?;
        if let Some(mask) = inputs.attn_mask {
            if mask.len() != seq_rows * seq_cols {
                return Err(SoftmaxError::shape(format!(
                    "attention mask: expected [{seq_rows}, {seq_cols}] elements, got {}",
                    mask.len()
                )));
            }
        }
        Ok(Self {
            lut,
            scale: options
                .applies_scale()
                .then(|| T::compute_from_f64(options.scale)),
            rpe,
            key_padding_mask,
            attn_mask: inputs.attn_mask,
            key_padding_mode: options.key_padding_mode,
            attn_mask_mode: options.attn_mask_mode,
            causal: options.causal,
        })
    }

    #[inline]
    fn masked_score(
        &self,
        raw: T,
        batch: usize,
        head: usize,
        global_row: usize,
        global_col: usize,
    ) -> T::Compute {
        let seq_cols = self.lut.seq_cols();
        let mut value = raw.to_compute();
        if let Some(scale) = self.scale {
            value = value * scale;
        }
        if let Some(rpe) = &self.rpe {
            let index = (head * self.lut.seq_rows() + global_row) * seq_cols + global_col;
            value = value + rpe.get(batch, index).to_compute();
        }
        if let Some(mask) = &self.key_padding_mask {
            value = value
                + self
                    .key_padding_mode
                    .additive(mask.get(batch, global_col).to_compute());
        }
        if let Some(mask) = self.attn_mask {
            value = value
                + self
                    .attn_mask_mode
                    .additive(mask[global_row * seq_cols + global_col].to_compute());
        }
        if self.causal && global_col > global_row {
            value = T::Compute::neg_infinity();
        }
        value
    }

    fn run(&self, segment: RowSegment<'_, T>, work: &mut Vec<T::Compute>) {
        let RowSegment {
            batch,
            row_id,
            first_tile,
            data,
        } = segment;
        let lut = self.lut;
        let block = lut.block_size();
        let tile_len = block * block;
        let row = lut.row(row_id);
        let width = lut.max_row_count() * block;

        for within_row in 0..block {
            work.clear();
            work.resize(width, T::Compute::neg_infinity());
            for slot in 0..row.size {
                let entry = lut.entry(row, slot);
                let global_row = entry.row * block + within_row;
                let base = (entry.tile - first_tile) * tile_len + within_row * block;
                for within_col in 0..block {
                    work[slot * block + within_col] = self.masked_score(
                        data[base + within_col],
                        batch,
                        entry.head,
                        global_row,
                        entry.col * block + within_col,
                    );
                }
            }

            if !stable_softmax(work) {
                log::trace!(
                    "blocksparse forward row={row_id} line={within_row} batch={batch} \
                     fully masked; zeroed"
                );
            }

            for slot in 0..row.size {
                let tile = lut.entry(row, slot).tile;
                let base = (tile - first_tile) * tile_len + within_row * block;
                for within_col in 0..block {
                    data[base + within_col] = T::from_compute(work[slot * block + within_col]);
                }
            }
        }
    }
}
