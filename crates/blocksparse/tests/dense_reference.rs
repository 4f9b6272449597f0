//! Compares the block-sparse operator against a dense candle softmax in
//! which every inactive tile is filled with `-inf`.

use blocksparse::masks::{build_causal_mask, padding_mask_from_lengths};
use blocksparse::{BlockSparseSoftmax, Layout, MaskMode, SoftmaxArgs};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;

struct Case {
    layout: Layout,
    block: usize,
    batch: usize,
}

impl Case {
    fn seq(&self) -> (usize, usize) {
        (self.layout.rows() * self.block, self.layout.cols() * self.block)
    }
}

/// Copy the active tiles of a dense `[batch, heads, rows·B, cols·B]` buffer
/// into packed `[batch, nnz·B·B]` order.
fn pack(case: &Case, dense: &[f32]) -> Vec<f32> {
    let b = case.block;
    let (heads, _, _) = case.layout.dims();
    let (seq_rows, seq_cols) = case.seq();
    let mut packed = Vec::with_capacity(case.batch * case.layout.nnz() * b * b);
    for z in 0..case.batch {
        for (h, r, c) in case.layout.active_tiles() {
            for i in 0..b {
                for j in 0..b {
                    let row = r * b + i;
                    let col = c * b + j;
                    packed.push(dense[((z * heads + h) * seq_rows + row) * seq_cols + col]);
                }
            }
        }
    }
    packed
}

/// Additive `[heads, rows·B, cols·B]` mask hiding inactive tiles.
fn layout_mask(case: &Case, device: &Device) -> candle_core::Result<Tensor> {
    let b = case.block;
    let (heads, _, _) = case.layout.dims();
    let (seq_rows, seq_cols) = case.seq();
    let mut data = vec![f32::NEG_INFINITY; heads * seq_rows * seq_cols];
    for (h, r, c) in case.layout.active_tiles() {
        for i in 0..b {
            for j in 0..b {
                data[(h * seq_rows + r * b + i) * seq_cols + c * b + j] = 0.0;
            }
        }
    }
    Tensor::from_vec(data, (1, heads, seq_rows, seq_cols), device)
}

fn assert_allclose(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    let max = a
        .iter()
        .zip(b)
        .fold(0.0f32, |acc, (x, y)| acc.max((x - y).abs()));
    assert!(max <= tol, "max diff {max} exceeded tolerance {tol}");
}

#[test]
fn matches_dense_softmax_with_every_stage_enabled() -> blocksparse::Result<()> {
    let device = Device::Cpu;
    let case = Case {
        layout: Layout::from_fn(2, 3, 3, |h, r, c| c == r || (h + r + c) % 2 == 0)?,
        block: 2,
        batch: 2,
    };
    let (heads, _, _) = case.layout.dims();
    let (seq_rows, seq_cols) = case.seq();
    let scale = 0.4f64;

    let scores = Tensor::randn(0f32, 1.0, (case.batch, heads, seq_rows, seq_cols), &device)?;
    let rpe = Tensor::randn(0f32, 0.5, (1, heads, seq_rows, seq_cols), &device)?;
    let lengths = [seq_cols, 4];
    let kpm = padding_mask_from_lengths(&device, &lengths, seq_cols, MaskMode::Mul, DType::F32)?;
    let attn = build_causal_mask(&device, seq_rows, seq_cols, MaskMode::Add, DType::F32)?;

    // Dense reference: scale, bias, padding, attention mask, layout.
    let kpm_additive = blocksparse::masks::convert_mode(&kpm, MaskMode::Mul, MaskMode::Add)?
        .reshape((case.batch, 1, 1, seq_cols))?;
    let dense = (scores.affine(scale, 0.0)? + rpe.broadcast_as(scores.shape())?)?
        .broadcast_add(&kpm_additive)?
        .broadcast_add(&attn.reshape((1, 1, seq_rows, seq_cols))?)?
        .broadcast_add(&layout_mask(&case, &device)?)?;
    let reference = softmax_last_dim(&dense)?.flatten_all()?.to_vec1::<f32>()?;

    let op = BlockSparseSoftmax::new(case.layout.clone(), case.block)?;
    let stride = op.nnz() * case.block * case.block;
    let packed_scores = pack(&case, &scores.flatten_all()?.to_vec1::<f32>()?);
    let x = Tensor::from_vec(packed_scores, (case.batch, stride), &device)?;
    let args = SoftmaxArgs::default()
        .with_scale(scale)
        .with_rpe(&rpe)
        .with_key_padding_mask(&kpm, MaskMode::Mul)
        .with_attn_mask(&attn, MaskMode::Add);
    let y = op.apply(&x, &args)?;

    assert_allclose(
        &y.flatten_all()?.to_vec1::<f32>()?,
        &pack(&case, &reference),
        1e-5,
    );
    Ok(())
}

#[test]
fn grad_matches_dense_softmax_jacobian() -> blocksparse::Result<()> {
    let device = Device::Cpu;
    let case = Case {
        layout: Layout::from_fn(1, 2, 2, |_, r, c| c <= r)?,
        block: 3,
        batch: 1,
    };
    let (seq_rows, seq_cols) = case.seq();
    let scores = Tensor::randn(0f32, 1.0, (1, 1, seq_rows, seq_cols), &device)?;
    let upstream = Tensor::randn(0f32, 1.0, (1, 1, seq_rows, seq_cols), &device)?;

    let dense = scores.broadcast_add(&layout_mask(&case, &device)?)?;
    let probs = softmax_last_dim(&dense)?;
    let dot = (&probs * &upstream)?.sum_keepdim(3)?;
    let expected = (&probs * upstream.broadcast_sub(&dot)?)?
        .flatten_all()?
        .to_vec1::<f32>()?;

    let op = BlockSparseSoftmax::new(case.layout.clone(), case.block)?;
    let stride = op.nnz() * case.block * case.block;
    let x = Tensor::from_vec(
        pack(&case, &scores.flatten_all()?.to_vec1::<f32>()?),
        (1, stride),
        &device,
    )?;
    let dy = Tensor::from_vec(
        pack(&case, &upstream.flatten_all()?.to_vec1::<f32>()?),
        (1, stride),
        &device,
    )?;
    op.apply(&x, &SoftmaxArgs::default())?;
    let dx = op.grad(&dy)?;

    assert_allclose(
        &dx.flatten_all()?.to_vec1::<f32>()?,
        &pack(&case, &expected),
        1e-5,
    );
    Ok(())
}
