//! FILENAME: core/engine/src/matrix_mapping.rs
//! PURPOSE: Tracks the rectangles occupied by matrix vertices.
//! CONTEXT: Every structural operation must ask "does this region touch a
//! matrix?" before mutating anything. Rectangles are bucketed per sheet by
//! their top row; a query scans only the band of top rows that could reach
//! the query rectangle, bounded by the tallest matrix on the sheet.
//! Matrix rectangles never overlap.

use crate::address::{CellRange, SheetId};
use crate::vertex::VertexId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct SheetMatrices {
    /// Top row -> rectangles starting on that row.
    by_top_row: BTreeMap<u32, Vec<(CellRange, VertexId)>>,
    /// Height of the tallest matrix ever stored; bounds the query band.
    max_height: u32,
}

/// Non-owning index of matrix rectangles.
#[derive(Debug, Default)]
pub struct MatrixMapping {
    sheets: HashMap<SheetId, SheetMatrices>,
}

impl MatrixMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a matrix rectangle. The caller guarantees non-overlap
    /// (checked via `intersecting` before installation).
    pub fn insert(&mut self, range: CellRange, id: VertexId) {
        let sheet = self.sheets.entry(range.sheet).or_default();
        sheet.max_height = sheet.max_height.max(range.height());
        sheet
            .by_top_row
            .entry(range.start_row)
            .or_default()
            .push((range, id));
    }

    /// Unregisters a rectangle.
    pub fn remove(&mut self, range: &CellRange) -> Option<VertexId> {
        let sheet = self.sheets.get_mut(&range.sheet)?;
        let bucket = sheet.by_top_row.get_mut(&range.start_row)?;
        let pos = bucket.iter().position(|(r, _)| r == range)?;
        let (_, id) = bucket.swap_remove(pos);
        if bucket.is_empty() {
            sheet.by_top_row.remove(&range.start_row);
        }
        Some(id)
    }

    /// The first matrix intersecting the query rectangle, if any.
    /// Scans only top rows within reach of the query.
    pub fn intersecting(&self, query: &CellRange) -> Option<(CellRange, VertexId)> {
        let sheet = self.sheets.get(&query.sheet)?;
        let band_start = query.start_row.saturating_sub(sheet.max_height.saturating_sub(1));
        for (_, bucket) in sheet.by_top_row.range(band_start..=query.end_row) {
            for &(range, id) in bucket {
                if range.intersects(query) {
                    return Some((range, id));
                }
            }
        }
        None
    }

    /// True if the query rectangle touches any matrix.
    pub fn intersects(&self, query: &CellRange) -> bool {
        self.intersecting(query).is_some()
    }

    /// The matrix covering a single cell, if any.
    pub fn matrix_at(&self, sheet: SheetId, col: u32, row: u32) -> Option<(CellRange, VertexId)> {
        self.intersecting(&CellRange::new(sheet, (col, row), (col, row)))
    }

    /// All matrices on one sheet, ordered by (top row, left col).
    pub fn matrices_in_sheet(&self, sheet: SheetId) -> Vec<(CellRange, VertexId)> {
        let mut result = Vec::new();
        if let Some(matrices) = self.sheets.get(&sheet) {
            for bucket in matrices.by_top_row.values() {
                result.extend(bucket.iter().copied());
            }
        }
        result.sort_unstable_by_key(|(range, _)| (range.start_row, range.start_col));
        result
    }

    /// Replaces a rectangle under the same vertex (structural shift).
    pub fn rekey(&mut self, old: &CellRange, new: CellRange) {
        if let Some(id) = self.remove(old) {
            self.insert(new, id);
        }
    }

    /// Extent of matrix content on a sheet, as (columns, rows).
    pub fn sheet_extent(&self, sheet: SheetId) -> (u32, u32) {
        let mut max_col = 0;
        let mut max_row = 0;
        let mut any = false;
        if let Some(matrices) = self.sheets.get(&sheet) {
            for bucket in matrices.by_top_row.values() {
                for (range, _) in bucket {
                    any = true;
                    max_col = max_col.max(range.end_col);
                    max_row = max_row.max(range.end_row);
                }
            }
        }
        if any {
            (max_col + 1, max_row + 1)
        } else {
            (0, 0)
        }
    }
}
