//! FILENAME: core/engine/src/transform.rs
//! PURPOSE: Eager graph-side handling of structural changes.
//! CONTEXT: Inserting/removing rows or columns and moving cell blocks
//! shift addresses under every formula. The eager pass here rewrites the
//! address/range/matrix mappings and the graph's edges, enforces the
//! matrix non-split invariant fail-fast, and enqueues a versioned record
//! with the lazy transform service; cached formula trees catch up with
//! those records when the evaluator next consumes them.
//!
//! Every operation validates before mutating: an Err return leaves the
//! engine observably unchanged.

use crate::address::{CellAddress, CellRange, SheetId};
use crate::error::EngineError;
use crate::graph::DependencyGraph;
use crate::lazy_transform::{LazyTransformService, TransformKind};
use crate::vertex::{Vertex, VertexId};
use tracing::debug;

impl DependencyGraph {
    /// Inserts `count` empty rows before `row`. Fails when the insert
    /// would split a matrix rectangle.
    pub fn add_rows(
        &mut self,
        sheet: SheetId,
        row: u32,
        count: u32,
        lazy: &mut LazyTransformService,
    ) -> Result<(), EngineError> {
        if count == 0 {
            return Ok(());
        }
        for (rect, _) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_row < row && row <= rect.end_row {
                return Err(EngineError::MatrixNonSplittable(rect));
            }
        }

        self.addresses.shift_rows_down(sheet, row, count);

        for (rect, id) in self.ranges.ranges_in_sheet(sheet) {
            if rect.start_row >= row {
                let mut shifted = rect;
                shifted.start_row += count;
                shifted.end_row += count;
                self.update_range_rect(id, rect, shifted, false);
            } else if rect.end_row >= row {
                // The insert landed inside the rectangle: it grows, and the
                // new (empty) cells join its fan-in.
                let mut grown = rect;
                grown.end_row += count;
                self.update_range_rect(id, rect, grown, true);
            }
        }

        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_row >= row {
                let mut shifted = rect;
                shifted.start_row += count;
                shifted.end_row += count;
                self.update_matrix_rect(id, rect, shifted);
            }
        }

        self.mark_structure_sensitive_dirty();
        let version = lazy.add_transformation(TransformKind::AddRows { sheet, row, count });
        debug!(sheet, row, count, version, "added rows");
        Ok(())
    }

    /// Removes the inclusive row span [row_start, row_end]. References to
    /// the removed cells dangle to Error(ref) on next evaluation. Fails
    /// when a matrix would lose only part of its rows.
    pub fn remove_rows(
        &mut self,
        sheet: SheetId,
        row_start: u32,
        row_end: u32,
        lazy: &mut LazyTransformService,
    ) -> Result<(), EngineError> {
        let (row_start, row_end) = (row_start.min(row_end), row_start.max(row_end));
        let count = row_end - row_start + 1;

        for (rect, _) in self.matrices.matrices_in_sheet(sheet) {
            let intersects = rect.start_row <= row_end && rect.end_row >= row_start;
            let contained = rect.start_row >= row_start && rect.end_row <= row_end;
            if intersects && !contained {
                return Err(EngineError::MatrixNonSplittable(rect));
            }
        }

        // Matrices fully inside the span disappear with their rows.
        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_row >= row_start && rect.end_row <= row_end {
                self.drop_matrix(rect, id);
            }
        }

        // Delete the span's cell vertices; consumers recompute to #REF!.
        for (addr, id) in self.addresses.iter_row_span(sheet, row_start, row_end) {
            self.mark_consumers_dirty(id);
            self.addresses.remove(addr);
            self.remove_vertex(id);
        }

        self.addresses.shift_rows_up(sheet, row_start, count);

        for (rect, id) in self.ranges.ranges_in_sheet(sheet) {
            if rect.end_row < row_start {
                continue;
            }
            if rect.start_row >= row_start && rect.end_row <= row_end {
                // The whole rectangle was removed.
                self.drop_range(rect, id);
                continue;
            }
            let mut updated = rect;
            if rect.start_row > row_end {
                updated.start_row -= count;
                updated.end_row -= count;
                self.update_range_rect(id, rect, updated, false);
            } else if rect.start_row >= row_start {
                updated.start_row = row_start;
                updated.end_row -= count;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            } else if rect.end_row > row_end {
                updated.end_row -= count;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            } else {
                updated.end_row = row_start - 1;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            }
        }

        // Matrices below the span shift up.
        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_row > row_end {
                let mut shifted = rect;
                shifted.start_row -= count;
                shifted.end_row -= count;
                self.update_matrix_rect(id, rect, shifted);
            }
        }

        self.mark_structure_sensitive_dirty();
        let version = lazy.add_transformation(TransformKind::RemoveRows {
            sheet,
            row_start,
            row_end,
        });
        debug!(sheet, row_start, row_end, version, "removed rows");
        Ok(())
    }

    /// Inserts `count` empty columns before `col`.
    pub fn add_columns(
        &mut self,
        sheet: SheetId,
        col: u32,
        count: u32,
        lazy: &mut LazyTransformService,
    ) -> Result<(), EngineError> {
        if count == 0 {
            return Ok(());
        }
        for (rect, _) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_col < col && col <= rect.end_col {
                return Err(EngineError::MatrixNonSplittable(rect));
            }
        }

        self.addresses.shift_cols_right(sheet, col, count);

        for (rect, id) in self.ranges.ranges_in_sheet(sheet) {
            if rect.start_col >= col {
                let mut shifted = rect;
                shifted.start_col += count;
                shifted.end_col += count;
                self.update_range_rect(id, rect, shifted, false);
            } else if rect.end_col >= col {
                let mut grown = rect;
                grown.end_col += count;
                self.update_range_rect(id, rect, grown, true);
            }
        }

        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_col >= col {
                let mut shifted = rect;
                shifted.start_col += count;
                shifted.end_col += count;
                self.update_matrix_rect(id, rect, shifted);
            }
        }

        self.mark_structure_sensitive_dirty();
        let version = lazy.add_transformation(TransformKind::AddColumns { sheet, col, count });
        debug!(sheet, col, count, version, "added columns");
        Ok(())
    }

    /// Removes the inclusive column span [col_start, col_end].
    pub fn remove_columns(
        &mut self,
        sheet: SheetId,
        col_start: u32,
        col_end: u32,
        lazy: &mut LazyTransformService,
    ) -> Result<(), EngineError> {
        let (col_start, col_end) = (col_start.min(col_end), col_start.max(col_end));
        let count = col_end - col_start + 1;

        for (rect, _) in self.matrices.matrices_in_sheet(sheet) {
            let intersects = rect.start_col <= col_end && rect.end_col >= col_start;
            let contained = rect.start_col >= col_start && rect.end_col <= col_end;
            if intersects && !contained {
                return Err(EngineError::MatrixNonSplittable(rect));
            }
        }

        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_col >= col_start && rect.end_col <= col_end {
                self.drop_matrix(rect, id);
            }
        }

        for (addr, id) in self.addresses.iter_col_span(sheet, col_start, col_end) {
            self.mark_consumers_dirty(id);
            self.addresses.remove(addr);
            self.remove_vertex(id);
        }

        self.addresses.shift_cols_left(sheet, col_start, count);

        for (rect, id) in self.ranges.ranges_in_sheet(sheet) {
            if rect.end_col < col_start {
                continue;
            }
            if rect.start_col >= col_start && rect.end_col <= col_end {
                self.drop_range(rect, id);
                continue;
            }
            let mut updated = rect;
            if rect.start_col > col_end {
                updated.start_col -= count;
                updated.end_col -= count;
                self.update_range_rect(id, rect, updated, false);
            } else if rect.start_col >= col_start {
                updated.start_col = col_start;
                updated.end_col -= count;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            } else if rect.end_col > col_end {
                updated.end_col -= count;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            } else {
                updated.end_col = col_start - 1;
                self.update_range_rect(id, rect, updated, false);
                self.mark_consumers_dirty(id);
            }
        }

        for (rect, id) in self.matrices.matrices_in_sheet(sheet) {
            if rect.start_col > col_end {
                let mut shifted = rect;
                shifted.start_col -= count;
                shifted.end_col -= count;
                self.update_matrix_rect(id, rect, shifted);
            }
        }

        self.mark_structure_sensitive_dirty();
        let version = lazy.add_transformation(TransformKind::RemoveColumns {
            sheet,
            col_start,
            col_end,
        });
        debug!(sheet, col_start, col_end, version, "removed columns");
        Ok(())
    }

    /// Lifts the cells of `source` onto the rectangle translated by
    /// (d_col, d_row) on `to_sheet`, overwriting what was there. Fails when
    /// either rectangle touches a matrix or the target leaves the sheet.
    pub fn move_cells(
        &mut self,
        source: CellRange,
        d_col: i64,
        d_row: i64,
        to_sheet: SheetId,
        lazy: &mut LazyTransformService,
    ) -> Result<(), EngineError> {
        let start_col = source.start_col as i64 + d_col;
        let start_row = source.start_row as i64 + d_row;
        if start_col < 0 || start_row < 0 {
            return Err(EngineError::TargetOutOfBounds);
        }
        let target = CellRange::new(
            to_sheet,
            (start_col as u32, start_row as u32),
            (
                (source.end_col as i64 + d_col) as u32,
                (source.end_row as i64 + d_row) as u32,
            ),
        );

        if self.matrices.intersects(&source) || self.matrices.intersects(&target) {
            return Err(EngineError::MoveOverlapsMatrix);
        }

        // Phase 1: lift every occupied source cell out of the mapping.
        let moved: Vec<(CellAddress, VertexId)> = source
            .iter()
            .filter_map(|addr| self.addresses.get(addr).map(|id| (addr, id)))
            .collect();
        for (addr, _) in &moved {
            self.addresses.remove(*addr);
        }

        // Phase 2: land them on the target, overwriting survivors there.
        for (old, id) in &moved {
            let new = CellAddress::new(
                to_sheet,
                (old.col as i64 + d_col) as u32,
                (old.row as i64 + d_row) as u32,
            );
            if let Some(victim) = self.addresses.get(new) {
                // Whatever referenced the overwritten address now reads the
                // arriving vertex.
                self.mark_consumers_dirty(victim);
                self.transfer_consumers(victim, *id);
                self.addresses.remove(new);
                self.remove_vertex(victim);
            }
            self.addresses.set(new, *id);
            // Moved formulas recompute: their relative references follow
            // the carrier and may now read different cells.
            if matches!(self.vertex(*id), Some(Vertex::Formula(_))) {
                self.mark_dirty(*id);
            }
        }

        // Phase 3: ranges overlapping either rectangle see different cells.
        let mut sheet_ids = vec![source.sheet];
        if to_sheet != source.sheet {
            sheet_ids.push(to_sheet);
        }
        for sheet in sheet_ids {
            for (rect, id) in self.ranges.ranges_in_sheet(sheet) {
                if source.contains_range(&rect) {
                    // The whole rectangle traveled with the block.
                    let translated = CellRange::new(
                        to_sheet,
                        (
                            (rect.start_col as i64 + d_col) as u32,
                            (rect.start_row as i64 + d_row) as u32,
                        ),
                        (
                            (rect.end_col as i64 + d_col) as u32,
                            (rect.end_row as i64 + d_row) as u32,
                        ),
                    );
                    self.update_range_rect(id, rect, translated, true);
                } else if rect.intersects(&source) || rect.intersects(&target) {
                    self.clear_outgoing_edges(id);
                    self.ensure_range_edges(id);
                    self.mark_consumers_dirty(id);
                }
            }
        }

        self.mark_structure_sensitive_dirty();
        let version = lazy.add_transformation(TransformKind::MoveCells {
            source,
            to_sheet,
            d_col,
            d_row,
        });

        // A moved formula's relative references resolve to different cells
        // now; its edges must follow. Catching the carriers up immediately
        // is bounded by the moved block, not by the workbook.
        for (_, id) in &moved {
            if matches!(self.vertex(*id), Some(Vertex::Formula(_))) {
                crate::evaluator::apply_pending_to_formula(self, lazy, *id);
                self.rewire_consumer(*id);
            }
        }

        debug!(%source, %target, version, "moved cells");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Rekeys a range vertex to a new rectangle and refreshes its fan-in
    /// when the covered cell set changed. Two rectangles can collapse onto
    /// the same corners (shrinks and moves); interning requires folding the
    /// arriving vertex into the survivor then.
    fn update_range_rect(
        &mut self,
        id: VertexId,
        old: CellRange,
        new: CellRange,
        refresh_edges: bool,
    ) {
        if let Some(existing) = self.ranges.get(&new) {
            if existing != id {
                self.mark_consumers_dirty(id);
                self.transfer_consumers(id, existing);
                self.ranges.remove(&old);
                self.remove_vertex(id);
                self.ensure_range_edges(existing);
                return;
            }
        }
        self.ranges.rekey(&old, new);
        if let Some(Vertex::Range(range)) = self.vertex_mut(id) {
            range.range = new;
        }
        if refresh_edges {
            self.ensure_range_edges(id);
        }
    }

    fn update_matrix_rect(&mut self, id: VertexId, old: CellRange, new: CellRange) {
        self.matrices.rekey(&old, new);
        if let Some(Vertex::Matrix(matrix)) = self.vertex_mut(id) {
            matrix.range = new;
        }
    }

    /// Removes a range vertex whose rectangle was deleted outright.
    fn drop_range(&mut self, rect: CellRange, id: VertexId) {
        self.mark_consumers_dirty(id);
        self.ranges.remove(&rect);
        self.remove_vertex(id);
    }

    /// Removes a matrix whose rectangle was deleted outright.
    fn drop_matrix(&mut self, rect: CellRange, id: VertexId) {
        self.mark_consumers_dirty(id);
        self.matrices.remove(&rect);
        for addr in rect.iter() {
            if self.addresses.get(addr) == Some(id) {
                self.addresses.remove(addr);
            }
        }
        self.remove_vertex(id);
    }
}
