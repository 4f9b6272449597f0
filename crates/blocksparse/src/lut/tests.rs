use std::sync::Arc;

use super::*;
use crate::layout::Layout;

fn two_row_layout() -> Layout {
    // row 0: columns 0 and 2, row 1: column 1
    Layout::new(1, 2, 3, vec![true, false, true, false, true, false]).unwrap()
}

const TWO_ROW_TABLE: [i32; 16] = [2, 4, 1, 12, 0, 0, 0, 0, 1, 2, 0, 0, 2, 1, 1, 0];

#[test]
fn build_emits_header_then_body() {
    let lut = Lut::build(&two_row_layout(), 2).unwrap();
    assert_eq!(lut.as_slice(), &TWO_ROW_TABLE);
    assert_eq!(lut.header(), &[2, 4, 1, 12]);
    assert_eq!(lut.body().len(), ENTRY_STRIDE * 3);
    assert_eq!(lut.nnz(), 3);
    assert_eq!(lut.max_row_count(), 2);
    assert_eq!(lut.batch_stride(), 12);
    assert_eq!((lut.seq_rows(), lut.seq_cols()), (4, 6));
}

#[test]
fn entries_decode_body_records() {
    let lut = Lut::build(&two_row_layout(), 2).unwrap();
    let row = lut.row(0);
    assert_eq!(row, LutRow { size: 2, offset: 4 });
    assert_eq!(
        lut.entry(row, 1),
        TileEntry {
            tile: 1,
            col: 2,
            row: 0,
            head: 0
        }
    );
    assert_eq!(lut.row_tiles(1), 2..3);
}

#[test]
fn sizes_sum_to_nnz_across_heads() {
    let layout = Layout::from_fn(3, 4, 5, |h, r, c| (h * 7 + r * 3 + c) % 3 != 1).unwrap();
    let lut = Lut::build(&layout, 4).unwrap();
    let total: usize = (0..lut.block_rows()).map(|r| lut.row(r).size).sum();
    assert_eq!(total, layout.nnz());

    let mut tiles: Vec<usize> = (0..lut.block_rows())
        .flat_map(|r| {
            let row = lut.row(r);
            (0..row.size).map(move |slot| (row, slot))
        })
        .map(|(row, slot)| lut.entry(row, slot).tile)
        .collect();
    tiles.sort_unstable();
    assert_eq!(tiles, (0..layout.nnz()).collect::<Vec<_>>());
}

#[test]
fn empty_rows_own_no_tiles() {
    let layout = Layout::new(1, 3, 2, vec![true, true, false, false, false, true]).unwrap();
    let lut = Lut::build(&layout, 1).unwrap();
    assert_eq!(lut.row(1).size, 0);
    assert_eq!(lut.row_tiles(1).len(), 0);
    assert_eq!(lut.rows_by_tile(), &[0, 2]);
}

#[test]
fn zero_block_is_rejected() {
    let err = Lut::build(&two_row_layout(), 0).unwrap_err();
    assert!(matches!(err, SoftmaxError::MalformedLayout { .. }));
}

#[test]
fn from_table_accepts_built_tables() {
    let built = Lut::build(&two_row_layout(), 2).unwrap();
    let parsed = Lut::from_table(TWO_ROW_TABLE.to_vec(), (1, 2, 3), 2).unwrap();
    assert_eq!(parsed, built);
}

#[test]
fn from_table_accepts_reordered_records_and_rows() {
    let swapped = vec![2, 4, 1, 12, 1, 2, 0, 0, 0, 0, 0, 0, 2, 1, 1, 0];
    let lut = Lut::from_table(swapped, (1, 2, 3), 2).unwrap();
    assert_eq!(lut.row_tiles(0), 0..2);

    let reversed = vec![2, 4, 1, 12, 1, 0, 0, 0, 2, 2, 0, 0, 0, 1, 1, 0];
    let lut = Lut::from_table(reversed, (1, 2, 3), 2).unwrap();
    assert_eq!(lut.row_tiles(0), 1..3);
    assert_eq!(lut.row_tiles(1), 0..1);
    assert_eq!(lut.rows_by_tile(), &[1, 0]);
}

#[test]
fn from_table_rejects_malformed_tables() {
    let dims = (1, 2, 3);
    let cases: Vec<(&str, Vec<i32>)> = vec![
        ("short header", vec![2, 4, 1]),
        ("negative size", vec![-1, 4, 1, 12, 0, 0, 0, 0]),
        ("offset gap", vec![2, 5, 1, 13, 0, 0, 0, 0, 0, 1, 2, 0, 0, 2, 1, 1, 0]),
        ("duplicate tile", vec![2, 4, 1, 12, 0, 0, 0, 0, 0, 2, 0, 0, 2, 1, 1, 0]),
        ("duplicate column", vec![2, 4, 1, 12, 0, 0, 0, 0, 1, 0, 0, 0, 2, 1, 1, 0]),
        ("split row", vec![2, 4, 1, 12, 0, 0, 0, 0, 2, 2, 0, 0, 1, 1, 1, 0]),
        ("column out of range", vec![2, 4, 1, 12, 0, 0, 0, 0, 1, 3, 0, 0, 2, 1, 1, 0]),
        ("wrong row", vec![2, 4, 1, 12, 0, 0, 1, 0, 1, 2, 0, 0, 2, 1, 1, 0]),
        ("trailing data", {
            let mut t = TWO_ROW_TABLE.to_vec();
            t.push(0);
            t
        }),
    ];
    for (name, table) in cases {
        let err = Lut::from_table(table, dims, 2).unwrap_err();
        assert!(
            matches!(err, SoftmaxError::MalformedLayout { .. }),
            "{name} should be rejected, got {err:?}"
        );
    }
}

#[test]
fn table_uploads_as_u32_tensor() -> candle_core::Result<()> {
    let lut = Lut::build(&two_row_layout(), 2).unwrap();
    let tensor = lut.to_tensor(&Device::Cpu)?;
    let values = tensor.to_vec1::<u32>()?;
    assert_eq!(values.len(), TWO_ROW_TABLE.len());
    assert_eq!(values[3], 12);
    Ok(())
}

#[test]
fn cache_builds_once_per_device() {
    let cache = LutCache::new();
    let layout = two_row_layout();
    assert!(cache.is_empty());
    let first = cache.get_or_build(DeviceKind::Cpu, &layout, 2).unwrap();
    let second = cache.get_or_build(DeviceKind::Cpu, &layout, 2).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(cache.len(), 1);
    assert!(cache.get(DeviceKind::Cuda(0)).is_none());

    let gpu = cache.get_or_build(DeviceKind::Cuda(0), &layout, 2).unwrap();
    assert!(!Arc::ptr_eq(&first, &gpu));
    assert_eq!(*first, *gpu);
    assert_eq!(cache.len(), 2);
}

#[test]
fn device_kind_tracks_cpu() {
    assert_eq!(DeviceKind::from_device(&Device::Cpu), DeviceKind::Cpu);
}
