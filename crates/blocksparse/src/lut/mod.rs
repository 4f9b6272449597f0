//! Look-up tables addressing the active tiles of a layout.
//!
//! A [`Lut`] is a single `i32` arena split into two regions:
//!
//! * the header, one `(size, offset)` pair per flattened `(head, block-row)`
//!   id, where `size` counts the active tiles of that row and `offset` is the
//!   arena index of the row's first body record;
//! * the body, one `(tile, col, row, head)` record per active tile, grouped by
//!   row in header order. `tile` is the tile's position in the packed buffer.
//!
//! Every row's tiles occupy one contiguous range of the packed tile axis, so
//! the (row, batch) regions of a packed buffer are pairwise disjoint.

mod cache;

use std::ops::Range;

use candle_core::{Device, Tensor};

use crate::core::{Result, SoftmaxError};
use crate::layout::Layout;

pub use cache::{DeviceKind, LutCache};

/// Integers per header entry: `(size, offset)`.
pub const HEADER_STRIDE: usize = 2;
/// Integers per body record: `(tile, col, row, head)`.
pub const ENTRY_STRIDE: usize = 4;

/// Decoded header entry of one block-row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LutRow {
    pub size: usize,
    pub offset: usize,
}

/// Decoded body record of one active tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileEntry {
    pub tile: usize,
    pub col: usize,
    pub row: usize,
    pub head: usize,
}

/// Compact index over the active tiles of a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lut {
    table: Box<[i32]>,
    heads: usize,
    rows: usize,
    cols: usize,
    block: usize,
    nnz: usize,
    max_row_count: usize,
    first_tiles: Box<[usize]>,
    rows_by_tile: Box<[usize]>,
}

impl Lut {
    /// Build the table for `layout` with tiles of `block × block` elements.
    pub fn build(layout: &Layout, block: usize) -> Result<Self> {
        check_capacity(layout, block)?;
        let (heads, rows, cols) = layout.dims();
        let block_rows = layout.block_rows();
        let nnz = layout.nnz();
        let header_len = HEADER_STRIDE * block_rows;
        let total = header_len + ENTRY_STRIDE * nnz;

        let mut table = vec![0i32; total];
        let mut first_tiles = vec![0usize; block_rows];
        let mut cursor = header_len;
        let mut tile = 0usize;
        let mut max_row_count = 0usize;
        for head in 0..heads {
            for row in 0..rows {
                let row_id = head * rows + row;
                let size = layout.row_count(head, row);
                table[HEADER_STRIDE * row_id] = size as i32;
                table[HEADER_STRIDE * row_id + 1] = cursor as i32;
                first_tiles[row_id] = if size > 0 { tile } else { 0 };
                for col in (0..cols).filter(|&c| layout.is_active(head, row, c)) {
                    table[cursor..cursor + ENTRY_STRIDE].copy_from_slice(&[
                        tile as i32,
                        col as i32,
                        row as i32,
                        head as i32,
                    ]);
                    cursor += ENTRY_STRIDE;
                    tile += 1;
                }
                max_row_count = max_row_count.max(size);
            }
        }
        debug_assert_eq!(cursor, total);
        debug_assert_eq!(tile, nnz);

        let rows_by_tile = (0..block_rows)
            .filter(|&r| table[HEADER_STRIDE * r] > 0)
            .collect();
        Ok(Self {
            table: table.into_boxed_slice(),
            heads,
            rows,
            cols,
            block,
            nnz,
            max_row_count,
            first_tiles: first_tiles.into_boxed_slice(),
            rows_by_tile,
        })
    }

    /// Validate an externally produced arena for a `[heads, rows, cols]`
    /// layout.
    ///
    /// Body records may appear in any order within their row and rows may own
    /// any contiguous range of tile indices, as long as the ranges partition
    /// `0..nnz`.
    pub fn from_table(
        table: Vec<i32>,
        (heads, rows, cols): (usize, usize, usize),
        block: usize,
    ) -> Result<Self> {
        if block == 0 {
            return Err(SoftmaxError::malformed("block size must be non-zero"));
        }
        if heads == 0 || rows == 0 || cols == 0 {
            return Err(SoftmaxError::malformed(format!(
                "layout dimensions must be non-zero, got [{heads}, {rows}, {cols}]"
            )));
        }
        let block_rows = heads * rows;
        let header_len = HEADER_STRIDE * block_rows;
        if table.len() < header_len {
            return Err(SoftmaxError::malformed(format!(
                "table of {} entries cannot hold a header for {block_rows} rows",
                table.len()
            )));
        }

        let mut sizes = Vec::with_capacity(block_rows);
        let mut cursor = header_len;
        for row_id in 0..block_rows {
            let size = table[HEADER_STRIDE * row_id];
            let offset = table[HEADER_STRIDE * row_id + 1];
            if size < 0 || offset < 0 {
                return Err(SoftmaxError::malformed(format!(
                    "row {row_id} has negative size {size} or offset {offset}"
                )));
            }
            if offset as usize != cursor {
                return Err(SoftmaxError::malformed(format!(
                    "row {row_id} offset {offset} breaks the contiguous body (expected {cursor})"
                )));
            }
            sizes.push(size as usize);
            cursor += ENTRY_STRIDE * size as usize;
        }
        if cursor != table.len() {
            return Err(SoftmaxError::malformed(format!(
                "body spans {} entries but the table holds {}",
                cursor - header_len,
                table.len() - header_len
            )));
        }

        let nnz: usize = sizes.iter().sum();
        let mut seen = vec![false; nnz];
        let mut first_tiles = vec![0usize; block_rows];
        let mut seen_cols = vec![false; cols];
        let mut offset = header_len;
        for (row_id, &size) in sizes.iter().enumerate() {
            let (expected_head, expected_row) = (row_id / rows, row_id % rows);
            let mut lo = usize::MAX;
            let mut hi = 0usize;
            seen_cols.fill(false);
            let records = &table[offset..offset + ENTRY_STRIDE * size];
            for record in records.chunks_exact(ENTRY_STRIDE) {
                let [tile, col, row, head] = [record[0], record[1], record[2], record[3]];
                if tile < 0 || tile as usize >= nnz || seen[tile as usize] {
                    return Err(SoftmaxError::malformed(format!(
                        "row {row_id} references invalid or duplicate tile {tile}"
                    )));
                }
                if col < 0 || col as usize >= cols {
                    return Err(SoftmaxError::malformed(format!(
                        "row {row_id} references column block {col} outside 0..{cols}"
                    )));
                }
                if seen_cols[col as usize] {
                    return Err(SoftmaxError::malformed(format!(
                        "row {row_id} references column block {col} more than once"
                    )));
                }
                if head < 0
                    || row < 0
                    || head as usize != expected_head
                    || row as usize != expected_row
                {
                    return Err(SoftmaxError::malformed(format!(
                        "row {row_id} names head {head} row {row}, \
                         expected head {expected_head} row {expected_row}"
                    )));
                }
                seen[tile as usize] = true;
                seen_cols[col as usize] = true;
                lo = lo.min(tile as usize);
                hi = hi.max(tile as usize);
            }
            if size > 0 && hi - lo + 1 != size {
                return Err(SoftmaxError::malformed(format!(
                    "row {row_id} tiles {lo}..={hi} are not contiguous"
                )));
            }
            first_tiles[row_id] = if size > 0 { lo } else { 0 };
            offset += ENTRY_STRIDE * size;
        }

        let mut rows_by_tile: Vec<usize> = (0..block_rows).filter(|&r| sizes[r] > 0).collect();
        rows_by_tile.sort_unstable_by_key(|&r| first_tiles[r]);
        Ok(Self {
            table: table.into_boxed_slice(),
            heads,
            rows,
            cols,
            block,
            nnz,
            max_row_count: sizes.iter().copied().max().unwrap_or(0),
            first_tiles: first_tiles.into_boxed_slice(),
            rows_by_tile: rows_by_tile.into_boxed_slice(),
        })
    }

    /// The whole arena, header followed by body.
    pub fn as_slice(&self) -> &[i32] {
        &self.table
    }

    pub fn header(&self) -> &[i32] {
        &self.table[..HEADER_STRIDE * self.block_rows()]
    }

    pub fn body(&self) -> &[i32] {
        &self.table[HEADER_STRIDE * self.block_rows()..]
    }

    /// `(heads, rows, cols)` of the layout this table addresses.
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.heads, self.rows, self.cols)
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    pub fn block_rows(&self) -> usize {
        self.heads * self.rows
    }

    pub fn nnz(&self) -> usize {
        self.nnz
    }

    /// Largest number of active tiles in any row.
    pub fn max_row_count(&self) -> usize {
        self.max_row_count
    }

    /// Elements per batch entry of a packed buffer: `nnz · B · B`.
    pub fn batch_stride(&self) -> usize {
        self.nnz * self.block * self.block
    }

    /// Global rows of the conceptual score matrix: `rows · B`.
    pub fn seq_rows(&self) -> usize {
        self.rows * self.block
    }

    /// Global columns of the conceptual score matrix: `cols · B`.
    pub fn seq_cols(&self) -> usize {
        self.cols * self.block
    }

    #[inline]
    pub fn row(&self, row_id: usize) -> LutRow {
        LutRow {
            size: self.table[HEADER_STRIDE * row_id] as usize,
            offset: self.table[HEADER_STRIDE * row_id + 1] as usize,
        }
    }

    #[inline]
    pub fn entry(&self, row: LutRow, slot: usize) -> TileEntry {
        let at = row.offset + ENTRY_STRIDE * slot;
        TileEntry {
            tile: self.table[at] as usize,
            col: self.table[at + 1] as usize,
            row: self.table[at + 2] as usize,
            head: self.table[at + 3] as usize,
        }
    }

    /// Range of packed tile indices owned by `row_id`.
    pub fn row_tiles(&self, row_id: usize) -> Range<usize> {
        let start = self.first_tiles[row_id];
        start..start + self.row(row_id).size
    }

    /// Non-empty rows ordered by the position of their tiles in the packed
    /// buffer. Empty rows own no storage and never appear here.
    pub fn rows_by_tile(&self) -> &[usize] {
        &self.rows_by_tile
    }

    /// Upload the arena to `device` as a `u32` tensor.
    pub fn to_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let data: Vec<u32> = self.table.iter().map(|&v| v as u32).collect();
        Tensor::from_vec(data, self.table.len(), device)
    }
}

/// Reject block sizes and layouts the `i32` arena cannot address.
pub(crate) fn check_capacity(layout: &Layout, block: usize) -> Result<()> {
    if block == 0 {
        return Err(SoftmaxError::malformed("block size must be non-zero"));
    }
    let total = HEADER_STRIDE * layout.block_rows() + ENTRY_STRIDE * layout.nnz();
    if total > i32::MAX as usize || layout.cols().saturating_mul(block) > i32::MAX as usize {
        return Err(SoftmaxError::malformed(format!(
            "look-up table of {total} entries exceeds i32 addressing"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
