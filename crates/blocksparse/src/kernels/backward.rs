//! Fused softmax backward pass.

use num_traits::Zero;

use super::{check_buffer_len, dispatch, row_segments, RowSegment};
use crate::core::{Config, Element, Result};
use crate::lut::Lut;

/// Overwrite `dy` with the gradient with respect to the pre-softmax scores.
///
/// `y` holds the forward probabilities. Per line, `dx = y · (dy − Σ y·dy) ·
/// scale`, which is the softmax Jacobian-vector product chained through the
/// forward scale. Bias, masks and the scale itself receive no gradient.
pub fn backward_in_place<T: Element>(
    lut: &Lut,
    y: &[T],
    dy: &mut [T],
    batch: usize,
    scale: f64,
    config: &Config,
) -> Result<()> {
    check_buffer_len(lut, batch, y.len(), "forward output")?;
    check_buffer_len(lut, batch, dy.len(), "upstream gradient")?;

    let scale = T::compute_from_f64(scale);
    let block = lut.block_size();
    let tile_len = block * block;
    let stride = lut.batch_stride();
    let segments = row_segments(lut, dy, batch);
    let parallel = config.use_parallel(segments.len());
    log::trace!(
        "blocksparse backward segments={} parallel={parallel}",
        segments.len()
    );

    dispatch(
        segments,
        parallel,
        || (),
        |_, segment| {
            let RowSegment {
                batch: z,
                row_id,
                first_tile,
                data,
            } = segment;
            let start = z * stride + first_tile * tile_len;
            let probs = &y[start..start + data.len()];
            let row = lut.row(row_id);
            let tile_base = |slot| (lut.entry(row, slot).tile - first_tile) * tile_len;

            for within_row in 0..block {
                let mut dot = T::Compute::zero();
                for slot in 0..row.size {
                    let base = tile_base(slot) + within_row * block;
                    for i in base..base + block {
                        dot = dot + probs[i].to_compute() * data[i].to_compute();
                    }
                }
                for slot in 0..row.size {
                    let base = tile_base(slot) + within_row * block;
                    for i in base..base + block {
                        let p = probs[i].to_compute();
                        data[i] = T::from_compute(p * (data[i].to_compute() - dot) * scale);
                    }
                }
            }
        },
    );
    Ok(())
}
