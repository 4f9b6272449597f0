use std::sync::{Arc, Mutex};

use candle_core::{DType, Device, Tensor};
use half::{bf16, f16};

use crate::core::{Config, Element, MaskMode, Result, SoftmaxError, SoftmaxOptions};
use crate::kernels::{backward_in_place, forward_in_place, MaskInputs};
use crate::layout::Layout;
use crate::lut::{self, DeviceKind, Lut, LutCache};

/// Arguments of a tensor-level forward call.
///
/// * `rpe`: `[1 | batch, heads, rows·B, cols·B]`
/// * `key_padding_mask`: `[1 | batch, cols·B]`
/// * `attn_mask`: `[rows·B, cols·B]`
///
/// All supplied tensors must share the dtype and device of the scores.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftmaxArgs<'a> {
    pub options: SoftmaxOptions,
    pub rpe: Option<&'a Tensor>,
    pub key_padding_mask: Option<&'a Tensor>,
    pub attn_mask: Option<&'a Tensor>,
}

impl<'a> SoftmaxArgs<'a> {
    pub fn with_scale(mut self, scale: f64) -> Self {
        self.options.scale = scale;
        self
    }

    pub fn with_causal(mut self, causal: bool) -> Self {
        self.options.causal = causal;
        self
    }

    pub fn with_rpe(mut self, rpe: &'a Tensor) -> Self {
        self.rpe = Some(rpe);
        self
    }

    pub fn with_key_padding_mask(mut self, mask: &'a Tensor, mode: MaskMode) -> Self {
        self.key_padding_mask = Some(mask);
        self.options.key_padding_mode = mode;
        self
    }

    pub fn with_attn_mask(mut self, mask: &'a Tensor, mode: MaskMode) -> Self {
        self.attn_mask = Some(mask);
        self.options.attn_mask_mode = mode;
        self
    }

    pub fn flags(&self) -> MaskFlags {
        MaskFlags {
            scale: self.options.applies_scale(),
            rpe: self.rpe.is_some(),
            key_padding_mask: self.key_padding_mask.is_some(),
            attn_mask: self.attn_mask.is_some(),
            causal: self.options.causal,
        }
    }

    fn supplied(&self) -> impl Iterator<Item = (&'static str, &'a Tensor)> {
        [
            ("relative position bias", self.rpe),
            ("key padding mask", self.key_padding_mask),
            ("attention mask", self.attn_mask),
        ]
        .into_iter()
        .filter_map(|(name, tensor)| tensor.map(|t| (name, t)))
    }
}

/// Which optional stages a forward call applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MaskFlags {
    pub scale: bool,
    pub rpe: bool,
    pub key_padding_mask: bool,
    pub attn_mask: bool,
    pub causal: bool,
}

/// State retained by [`BlockSparseSoftmax::apply`] for one gradient call.
#[derive(Debug)]
struct SavedForward {
    probs: Tensor,
    lut: Arc<Lut>,
    batch: usize,
    scale: f64,
    flags: MaskFlags,
}

impl SavedForward {
    fn check_upstream(&self, dy: &Tensor) -> Result<()> {
        if dy.dtype() != self.probs.dtype() {
            return Err(SoftmaxError::DTypeMismatch {
                input: "upstream gradient",
                expected: self.probs.dtype(),
                got: dy.dtype(),
            });
        }
        if dy.dims() != self.probs.dims() {
            return Err(SoftmaxError::shape(format!(
                "upstream gradient: expected {:?}, got {:?}",
                self.probs.dims(),
                dy.dims()
            )));
        }
        if !dy.device().same_device(self.probs.device()) {
            return Err(SoftmaxError::DeviceMismatch {
                input: "upstream gradient",
            });
        }
        Ok(())
    }
}

/// Block-sparse softmax over a fixed layout and block size.
///
/// Look-up tables are built lazily, once per device, and shared by every
/// subsequent call. The tensor API keeps the output of the latest
/// [`apply`](Self::apply) for exactly one [`grad`](Self::grad) call.
#[derive(Debug)]
pub struct BlockSparseSoftmax {
    layout: Layout,
    block: usize,
    config: Config,
    luts: LutCache,
    saved: Mutex<Option<SavedForward>>,
}

impl BlockSparseSoftmax {
    pub fn new(layout: Layout, block: usize) -> Result<Self> {
        Self::with_config(layout, block, Config::default())
    }

    pub fn with_config(layout: Layout, block: usize, config: Config) -> Result<Self> {
        lut::check_capacity(&layout, block)?;
        Ok(Self {
            layout,
            block,
            config,
            luts: LutCache::new(),
            saved: Mutex::new(None),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of active tiles.
    pub fn nnz(&self) -> usize {
        self.layout.nnz()
    }

    /// Look-up table for `device`, built on first request.
    pub fn lut_for(&self, device: &Device) -> Result<Arc<Lut>> {
        self.luts
            .get_or_build(DeviceKind::from_device(device), &self.layout, self.block)
    }

    /// Whether a forward pass is waiting for its gradient call.
    pub fn has_pending_grad(&self) -> bool {
        self.saved
            .lock()
            .map(|saved| saved.is_some())
            .unwrap_or(false)
    }

    fn runtime_config(&self) -> Config {
        let mut cfg = self.config.clone();
        cfg.apply_env_overrides();
        cfg
    }

    /// Softmax over the packed scores `x`, shaped `[batch, ...]` with
    /// `nnz·B·B` elements per batch entry.
    ///
    /// Returns a new tensor with the shape, dtype and device of `x`, and keeps
    /// it as single-use saved state for [`grad`](Self::grad). Inputs are
    /// validated before any work or state change.
    pub fn apply(&self, x: &Tensor, args: &SoftmaxArgs<'_>) -> Result<Tensor> {
        let dtype = x.dtype();
        let companions: Vec<_> = args
            .supplied()
            .map(|(input, t)| {
                let kind = DeviceKind::from_device(t.device());
                (input, t.dtype(), kind)
            })
            .collect();
        check_companions(dtype, DeviceKind::from_device(x.device()), &companions)?;
        check_supported(dtype)?;
        let batch = self.batch_of(x)?;
        self.check_input_dims(args, batch)?;

        let lut = self.lut_for(x.device())?;
        let config = self.runtime_config();
        let probs = match dtype {
            DType::F32 => forward_tensor::<f32>(&lut, x, batch, args, &config)?,
            DType::F64 => forward_tensor::<f64>(&lut, x, batch, args, &config)?,
            DType::F16 => forward_tensor::<f16>(&lut, x, batch, args, &config)?,
            DType::BF16 => forward_tensor::<bf16>(&lut, x, batch, args, &config)?,
            other => return Err(unsupported(other)),
        };

        let flags = args.flags();
        log::debug!(
            "blocksparse apply batch={batch} dtype={dtype:?} scale={} flags={flags:?}",
            args.options.scale
        );
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| SoftmaxError::Poisoned {
                what: "saved forward",
            })?;
        *saved = Some(SavedForward {
            probs: probs.clone(),
            lut,
            batch,
            scale: args.options.scale,
            flags,
        });
        Ok(probs)
    }

    /// Gradient with respect to the scores of the pending forward pass.
    ///
    /// Consumes the saved state: a second call without an intervening
    /// [`apply`](Self::apply) fails with [`SoftmaxError::NoPendingForward`].
    /// An invalid `dy` is rejected without consuming the state.
    pub fn grad(&self, dy: &Tensor) -> Result<Tensor> {
        let mut guard = self
            .saved
            .lock()
            .map_err(|_| SoftmaxError::Poisoned {
                what: "saved forward",
            })?;
        let saved = guard.take().ok_or(SoftmaxError::NoPendingForward)?;
        if let Err(err) = saved.check_upstream(dy) {
            *guard = Some(saved);
            return Err(err);
        }
        drop(guard);

        let config = self.runtime_config();
        let dx = match dy.dtype() {
            DType::F32 => backward_tensor::<f32>(&saved, dy, &config)?,
            DType::F64 => backward_tensor::<f64>(&saved, dy, &config)?,
            DType::F16 => backward_tensor::<f16>(&saved, dy, &config)?,
            DType::BF16 => backward_tensor::<bf16>(&saved, dy, &config)?,
            other => return Err(unsupported(other)),
        };
        log::debug!(
            "blocksparse grad batch={} scale={} flags={:?}",
            saved.batch,
            saved.scale,
            saved.flags
        );
        Ok(dx)
    }

    /// In-place softmax over a packed host buffer of `batch` entries.
    ///
    /// `x` is overwritten with probabilities. The returned [`ForwardPass`]
    /// keeps `x` borrowed and can run the backward pass once.
    pub fn forward<'a, T: Element>(
        &self,
        x: &'a mut [T],
        batch: usize,
        inputs: MaskInputs<'_, T>,
        options: &SoftmaxOptions,
    ) -> Result<ForwardPass<'a, T>> {
        let lut = self
            .luts
            .get_or_build(DeviceKind::Cpu, &self.layout, self.block)?;
        let config = self.runtime_config();
        forward_in_place(&lut, x, batch, inputs, options, &config)?;
        log::debug!(
            "blocksparse forward batch={batch} dtype={:?} scale={} causal={}",
            T::DTYPE,
            options.scale,
            options.causal
        );
        Ok(ForwardPass {
            probs: x,
            lut,
            batch,
            scale: options.scale,
            config,
        })
    }

    fn batch_of(&self, x: &Tensor) -> Result<usize> {
        let Some(&batch) = x.dims().first() else {
            return Err(SoftmaxError::shape("scores must have a leading batch dimension"));
        };
        let stride = self.layout.nnz() * self.block * self.block;
        if x.elem_count() != batch * stride {
            return Err(SoftmaxError::shape(format!(
                "scores: expected [{batch}, {stride}] elements for nnz={} block={}, got shape {:?}",
                self.layout.nnz(),
                self.block,
                x.dims()
            )));
        }
        Ok(batch)
    }

    fn check_input_dims(&self, args: &SoftmaxArgs<'_>, batch: usize) -> Result<()> {
        let (heads, rows, cols) = self.layout.dims();
        let (seq_rows, seq_cols) = (rows * self.block, cols * self.block);
        let batch_ok = |b: usize| b == 1 || b == batch;
        if let Some(rpe) = args.rpe {
            match rpe.dims() {
                &[b, h, r, c] if batch_ok(b) && h == heads && r == seq_rows && c == seq_cols => {}
                dims => {
                    return Err(SoftmaxError::shape(format!(
                        "relative position bias: expected \
                         [1|{batch}, {heads}, {seq_rows}, {seq_cols}], got {dims:?}"
                    )))
                }
            }
        }
        if let Some(mask) = args.key_padding_mask {
            match mask.dims() {
                &[b, c] if batch_ok(b) && c == seq_cols => {}
                dims => {
                    return Err(SoftmaxError::shape(format!(
                        "key padding mask: expected [1|{batch}, {seq_cols}], got {dims:?}"
                    )))
                }
            }
        }
        if let Some(mask) = args.attn_mask {
            if mask.dims() != [seq_rows, seq_cols] {
                return Err(SoftmaxError::shape(format!(
                    "attention mask: expected [{seq_rows}, {seq_cols}], got {:?}",
                    mask.dims()
                )));
            }
        }
        Ok(())
    }
}

/// Consume-once handle to the output of [`BlockSparseSoftmax::forward`].
#[must_use = "dropping a ForwardPass discards the state needed for backward"]
#[derive(Debug)]
pub struct ForwardPass<'a, T: Element> {
    probs: &'a mut [T],
    lut: Arc<Lut>,
    batch: usize,
    scale: f64,
    config: Config,
}

impl<'a, T: Element> ForwardPass<'a, T> {
    pub fn probs(&self) -> &[T] {
        &*self.probs
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn lut(&self) -> &Lut {
        &self.lut
    }

    /// Release the probabilities without running backward.
    pub fn into_probs(self) -> &'a mut [T] {
        self.probs
    }

    /// Overwrite `dy` with the gradient with respect to the scores.
    pub fn backward(self, dy: &mut [T]) -> Result<()> {
        backward_in_place(
            &self.lut,
            &*self.probs,
            dy,
            self.batch,
            self.scale,
            &self.config,
        )
    }
}

/// Check `(name, dtype, device)` of every supplied input against the scores.
/// Dtypes are compared before devices.
pub(crate) fn check_companions(
    dtype: DType,
    device: DeviceKind,
    inputs: &[(&'static str, DType, DeviceKind)],
) -> Result<()> {
    if let Some(&(input, got, _)) = inputs.iter().find(|(_, d, _)| *d != dtype) {
        return Err(SoftmaxError::DTypeMismatch {
            input,
            expected: dtype,
            got,
        });
    }
    if let Some(&(input, _, _)) = inputs.iter().find(|(_, _, kind)| *kind != device) {
        return Err(SoftmaxError::DeviceMismatch { input });
    }
    Ok(())
}

fn check_supported(dtype: DType) -> Result<()> {
    match dtype {
        DType::F32 | DType::F64 | DType::F16 | DType::BF16 => Ok(()),
        other => Err(unsupported(other)),
    }
}

fn unsupported(dtype: DType) -> SoftmaxError {
    SoftmaxError::UnsupportedDType {
        requested: format!("{dtype:?}"),
    }
}

fn host_vec<T: Element>(tensor: &Tensor) -> Result<Vec<T>> {
    Ok(tensor.flatten_all()?.to_vec1::<T>()?)
}

fn forward_tensor<T: Element>(
    lut: &Lut,
    x: &Tensor,
    batch: usize,
    args: &SoftmaxArgs<'_>,
    config: &Config,
) -> Result<Tensor> {
    let mut data = host_vec::<T>(x)?;
    let rpe = args.rpe.map(host_vec::<T>).transpose()?;
    let key_padding_mask = args.key_padding_mask.map(host_vec::<T>).transpose()?;
    let attn_mask = args.attn_mask.map(host_vec::<T>).transpose()?;
    let inputs = MaskInputs {
        rpe: rpe.as_deref(),
        key_padding_mask: key_padding_mask.as_deref(),
        attn_mask: attn_mask.as_deref(),
    };
    forward_in_place(lut, &mut data, batch, inputs, &args.options, config)?;
    Ok(Tensor::from_vec(data, x.shape().clone(), x.device())?)
}

fn backward_tensor<T: Element>(
    saved: &SavedForward,
    dy: &Tensor,
    config: &Config,
) -> Result<Tensor> {
    let probs = host_vec::<T>(&saved.probs)?;
    let mut grad = host_vec::<T>(dy)?;
    backward_in_place(
        &saved.lut,
        &probs,
        &mut grad,
        saved.batch,
        saved.scale,
        config,
    )?;
    Ok(Tensor::from_vec(grad, dy.shape().clone(), dy.device())?)
}
