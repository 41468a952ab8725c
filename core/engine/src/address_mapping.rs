//! FILENAME: core/engine/src/address_mapping.rs
//! PURPOSE: Two-level indexed store from (sheet, col, row) to vertex identity.
//! CONTEXT: Sparse storage: outer map by sheet id, inner map by column with
//! an ordered row index per column. The ordered rows are what keep row and
//! column insertion/removal at O(affected cells): a shift touches only the
//! entries at or below the edit, never the whole sheet. A reverse index by
//! vertex id serves the evaluator's address-ordered scheduling.

use crate::address::{CellAddress, SheetId};
use crate::vertex::VertexId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct SheetIndex {
    /// Column index -> ordered rows -> vertex.
    columns: HashMap<u32, BTreeMap<u32, VertexId>>,
}

/// The address mapping. Holds non-owning vertex ids; the graph arena owns
/// the vertices themselves.
#[derive(Debug, Default)]
pub struct AddressMapping {
    sheets: HashMap<SheetId, SheetIndex>,
    by_id: HashMap<VertexId, CellAddress>,
}

impl AddressMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the vertex at an address.
    pub fn get(&self, addr: CellAddress) -> Option<VertexId> {
        self.sheets
            .get(&addr.sheet)?
            .columns
            .get(&addr.col)?
            .get(&addr.row)
            .copied()
    }

    pub fn has(&self, addr: CellAddress) -> bool {
        self.get(addr).is_some()
    }

    /// Installs or replaces the vertex at an address.
    pub fn set(&mut self, addr: CellAddress, id: VertexId) {
        let sheet = self.sheets.entry(addr.sheet).or_default();
        let previous = sheet.columns.entry(addr.col).or_default().insert(addr.row, id);
        if let Some(old) = previous {
            if old != id {
                self.by_id.remove(&old);
            }
        }
        self.by_id.insert(id, addr);
    }

    /// Removes the entry at an address, returning the vertex that was there.
    pub fn remove(&mut self, addr: CellAddress) -> Option<VertexId> {
        let sheet = self.sheets.get_mut(&addr.sheet)?;
        let column = sheet.columns.get_mut(&addr.col)?;
        let id = column.remove(&addr.row)?;
        if column.is_empty() {
            sheet.columns.remove(&addr.col);
        }
        // A matrix vertex occupies many addresses; only drop the reverse
        // entry when it still points at the removed address.
        if self.by_id.get(&id) == Some(&addr) {
            self.by_id.remove(&id);
        }
        Some(id)
    }

    /// The address a cell vertex currently occupies. For matrix vertices
    /// this is one of the covered addresses (the last installed).
    pub fn address_of(&self, id: VertexId) -> Option<CellAddress> {
        self.by_id.get(&id).copied()
    }

    /// Iterates occupied cells of one sheet in (col, row) order.
    pub fn iter_sheet(&self, sheet: SheetId) -> impl Iterator<Item = (CellAddress, VertexId)> + '_ {
        let columns = self.sheets.get(&sheet).map(|s| &s.columns);
        let mut cols: Vec<u32> = columns.map(|c| c.keys().copied().collect()).unwrap_or_default();
        cols.sort_unstable();
        cols.into_iter().flat_map(move |col| {
            columns
                .and_then(|c| c.get(&col))
                .into_iter()
                .flatten()
                .map(move |(&row, &id)| (CellAddress::new(sheet, col, row), id))
        })
    }

    /// Iterates occupied cells of one sheet within a span of rows.
    pub fn iter_row_span(
        &self,
        sheet: SheetId,
        row_start: u32,
        row_end: u32,
    ) -> Vec<(CellAddress, VertexId)> {
        let mut result = Vec::new();
        if let Some(index) = self.sheets.get(&sheet) {
            for (&col, rows) in &index.columns {
                for (&row, &id) in rows.range(row_start..=row_end) {
                    result.push((CellAddress::new(sheet, col, row), id));
                }
            }
        }
        result.sort_unstable_by_key(|(addr, _)| (addr.col, addr.row));
        result
    }

    /// Iterates occupied cells of one sheet within a span of columns.
    pub fn iter_col_span(
        &self,
        sheet: SheetId,
        col_start: u32,
        col_end: u32,
    ) -> Vec<(CellAddress, VertexId)> {
        let mut result = Vec::new();
        if let Some(index) = self.sheets.get(&sheet) {
            for (&col, rows) in &index.columns {
                if col < col_start || col > col_end {
                    continue;
                }
                for (&row, &id) in rows {
                    result.push((CellAddress::new(sheet, col, row), id));
                }
            }
        }
        result.sort_unstable_by_key(|(addr, _)| (addr.col, addr.row));
        result
    }

    /// Shifts every cell at or below `row` down by `count`. Touches only
    /// the affected tail of each column.
    pub fn shift_rows_down(&mut self, sheet: SheetId, row: u32, count: u32) {
        let Some(index) = self.sheets.get_mut(&sheet) else {
            return;
        };
        for rows in index.columns.values_mut() {
            let moved: Vec<(u32, VertexId)> =
                rows.range(row..).map(|(&r, &id)| (r, id)).collect();
            // Detach the whole tail before reinserting so entries never collide.
            for &(r, _) in moved.iter() {
                rows.remove(&r);
            }
            for &(r, id) in moved.iter() {
                rows.insert(r + count, id);
            }
        }
        self.rebuild_reverse_for_sheet(sheet);
    }

    /// Removes the span [row_start, row_end] and shifts the cells below up.
    /// The removed entries must have been cleared by the caller already.
    pub fn shift_rows_up(&mut self, sheet: SheetId, row_start: u32, count: u32) {
        let Some(index) = self.sheets.get_mut(&sheet) else {
            return;
        };
        for rows in index.columns.values_mut() {
            let moved: Vec<(u32, VertexId)> =
                rows.range(row_start + count..).map(|(&r, &id)| (r, id)).collect();
            for &(r, _) in moved.iter() {
                rows.remove(&r);
            }
            for &(r, id) in moved.iter() {
                rows.insert(r - count, id);
            }
        }
        self.rebuild_reverse_for_sheet(sheet);
    }

    /// Shifts every cell at or right of `col` right by `count`.
    pub fn shift_cols_right(&mut self, sheet: SheetId, col: u32, count: u32) {
        let Some(index) = self.sheets.get_mut(&sheet) else {
            return;
        };
        let moved: Vec<u32> = index
            .columns
            .keys()
            .filter(|&&c| c >= col)
            .copied()
            .collect();
        let mut detached: Vec<(u32, BTreeMap<u32, VertexId>)> = Vec::new();
        for c in moved {
            if let Some(rows) = index.columns.remove(&c) {
                detached.push((c + count, rows));
            }
        }
        for (c, rows) in detached {
            index.columns.insert(c, rows);
        }
        self.rebuild_reverse_for_sheet(sheet);
    }

    /// Removes the span [col_start, col_start + count) and shifts the
    /// columns to the right of it left. Removed entries must already be gone.
    pub fn shift_cols_left(&mut self, sheet: SheetId, col_start: u32, count: u32) {
        let Some(index) = self.sheets.get_mut(&sheet) else {
            return;
        };
        let moved: Vec<u32> = index
            .columns
            .keys()
            .filter(|&&c| c >= col_start + count)
            .copied()
            .collect();
        let mut detached: Vec<(u32, BTreeMap<u32, VertexId>)> = Vec::new();
        for c in moved {
            if let Some(rows) = index.columns.remove(&c) {
                detached.push((c - count, rows));
            }
        }
        for (c, rows) in detached {
            index.columns.insert(c, rows);
        }
        self.rebuild_reverse_for_sheet(sheet);
    }

    /// Content extent of a sheet: (columns, rows) past the last occupied cell.
    pub fn sheet_extent(&self, sheet: SheetId) -> (u32, u32) {
        let mut max_col = 0;
        let mut max_row = 0;
        let mut any = false;
        if let Some(index) = self.sheets.get(&sheet) {
            for (&col, rows) in &index.columns {
                if let Some((&row, _)) = rows.iter().next_back() {
                    any = true;
                    max_col = max_col.max(col);
                    max_row = max_row.max(row);
                }
            }
        }
        if any {
            (max_col + 1, max_row + 1)
        } else {
            (0, 0)
        }
    }

    fn rebuild_reverse_for_sheet(&mut self, sheet: SheetId) {
        if let Some(index) = self.sheets.get(&sheet) {
            let mut updates = Vec::new();
            for (&col, rows) in &index.columns {
                for (&row, &id) in rows {
                    updates.push((id, CellAddress::new(sheet, col, row)));
                }
            }
            for (id, addr) in updates {
                self.by_id.insert(id, addr);
            }
        }
    }
}
