//! Per-device cache of look-up tables for one layout.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use candle_core::{Device, DeviceLocation};

use super::Lut;
use crate::core::{Result, SoftmaxError};
use crate::layout::Layout;

/// Hashable identity of a candle device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceKind {
    pub fn from_device(device: &Device) -> Self {
        match device.location() {
            DeviceLocation::Cpu => Self::Cpu,
            DeviceLocation::Cuda { gpu_id } => Self::Cuda(gpu_id),
            DeviceLocation::Metal { gpu_id } => Self::Metal(gpu_id),
        }
    }
}

/// Lazily built tables keyed by device. Entries are immutable once inserted.
#[derive(Debug, Default)]
pub struct LutCache {
    entries: Mutex<HashMap<DeviceKind, Arc<Lut>>>,
}

impl LutCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the table for `device`, building it from `layout` on first use.
    pub fn get_or_build(
        &self,
        device: DeviceKind,
        layout: &Layout,
        block: usize,
    ) -> Result<Arc<Lut>> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| SoftmaxError::Poisoned { what: "lut cache" })?;
        if let Some(lut) = guard.get(&device) {
            return Ok(Arc::clone(lut));
        }
        let lut = Arc::new(Lut::build(layout, block)?);
        log::info!(
            "blocksparse lut built device={:?} layout={:?} block={} nnz={} max_row_count={}",
            device,
            layout.dims(),
            block,
            lut.nnz(),
            lut.max_row_count()
        );
        guard.insert(device, Arc::clone(&lut));
        Ok(lut)
    }

    /// Previously built table for `device`, if any.
    pub fn get(&self, device: DeviceKind) -> Option<Arc<Lut>> {
        self.entries
            .lock()
            .ok()
            .and_then(|guard| guard.get(&device).cloned())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
