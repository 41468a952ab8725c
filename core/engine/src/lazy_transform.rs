//! FILENAME: core/engine/src/lazy_transform.rs
//! PURPOSE: Deferred rewriting of formula references after structural changes.
//! CONTEXT: A structural operation updates the graph and mappings eagerly,
//! but rewriting the references of every cached formula would make inserts
//! O(workbook). Instead each operation enqueues a versioned transformation
//! record here; a formula vertex carries the version it was last
//! transformed to, and the evaluator applies the missing records right
//! before consuming the vertex. Because templates index into per-vertex
//! operand lists, most rewrites touch only the operand list; the shared
//! tree is forked (copy-on-write) only when a reference target was deleted
//! and the node itself must become an Error(ref) literal.

use crate::address::{CellAddress, CellRange, SheetId};
use crate::vertex::{BoundOperand, BoundRef};
use parser::{AstError, Expression};
use std::collections::HashSet;
use std::sync::Arc;

/// One structural change, in the engine's absolute coordinates.
/// Row/column spans are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    AddRows {
        sheet: SheetId,
        row: u32,
        count: u32,
    },
    RemoveRows {
        sheet: SheetId,
        row_start: u32,
        row_end: u32,
    },
    AddColumns {
        sheet: SheetId,
        col: u32,
        count: u32,
    },
    RemoveColumns {
        sheet: SheetId,
        col_start: u32,
        col_end: u32,
    },
    MoveCells {
        source: CellRange,
        to_sheet: SheetId,
        d_col: i64,
        d_row: i64,
    },
}

/// A queued transformation with its monotonic version.
#[derive(Debug, Clone, Copy)]
pub struct TransformSpec {
    pub kind: TransformKind,
    pub version: u64,
}

/// The result of catching a formula up to the present: a (possibly forked)
/// tree, rewritten operands, the anchor's current address, and the version
/// watermark to record on the vertex.
pub struct AppliedTransforms {
    pub ast: Arc<Expression>,
    pub operands: Vec<BoundOperand>,
    pub address: CellAddress,
    pub version: u64,
}

/// Queue of pending transformations. Versions are dense and start at 1, so
/// the records newer than watermark `v` are exactly `transformations[v..]`.
#[derive(Debug, Default)]
pub struct LazyTransformService {
    transformations: Vec<TransformSpec>,
    version: u64,
}

impl LazyTransformService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current (latest) version; 0 means nothing was ever enqueued.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Enqueues a transformation and returns its version.
    pub fn add_transformation(&mut self, kind: TransformKind) -> u64 {
        self.version += 1;
        self.transformations.push(TransformSpec {
            kind,
            version: self.version,
        });
        self.version
    }

    /// Applies every record newer than `version` to a formula's state, in
    /// order. Returns None when the formula is already up to date.
    pub fn apply_pending(
        &self,
        ast: &Arc<Expression>,
        operands: &[BoundOperand],
        address: CellAddress,
        version: u64,
    ) -> Option<AppliedTransforms> {
        let pending = &self.transformations[version.min(self.version) as usize..];
        if pending.is_empty() {
            return None;
        }

        let mut operands = operands.to_vec();
        let mut address = address;
        let mut invalidated = HashSet::new();

        for spec in pending {
            apply_kind(&spec.kind, &mut operands, &mut address, &mut invalidated);
        }

        let ast = if invalidated.is_empty() {
            // Nothing to fork: the shared template stays shared.
            Arc::clone(ast)
        } else {
            Arc::new(replace_invalidated_refs(ast, &invalidated))
        };

        Some(AppliedTransforms {
            ast,
            operands,
            address,
            version: self.version,
        })
    }
}

/// Applies one transformation record to an operand list and anchor address.
/// Invalidated operand indices are collected for the tree rewrite.
fn apply_kind(
    kind: &TransformKind,
    operands: &mut [BoundOperand],
    address: &mut CellAddress,
    invalidated: &mut HashSet<usize>,
) {
    // The move rules need the anchor as it was before this record.
    let anchor_before = *address;
    transform_anchor(kind, address);

    for (index, operand) in operands.iter_mut().enumerate() {
        let survived = match operand {
            BoundOperand::Cell(r) => transform_cell_ref(kind, r, anchor_before),
            BoundOperand::Range(start, end) => transform_range_ref(kind, start, end, anchor_before),
            BoundOperand::Invalid => true,
        };
        if !survived {
            *operand = BoundOperand::Invalid;
            invalidated.insert(index);
        }
    }
}

fn transform_anchor(kind: &TransformKind, address: &mut CellAddress) {
    match *kind {
        TransformKind::AddRows { sheet, row, count } => {
            if address.sheet == sheet && address.row >= row {
                address.row += count;
            }
        }
        TransformKind::RemoveRows {
            sheet,
            row_start,
            row_end,
        } => {
            // A formula inside the removed span is deleted eagerly and
            // never reaches this point; only the below-span shift remains.
            if address.sheet == sheet && address.row > row_end {
                address.row -= row_end - row_start + 1;
            }
        }
        TransformKind::AddColumns { sheet, col, count } => {
            if address.sheet == sheet && address.col >= col {
                address.col += count;
            }
        }
        TransformKind::RemoveColumns {
            sheet,
            col_start,
            col_end,
        } => {
            if address.sheet == sheet && address.col > col_end {
                address.col -= col_end - col_start + 1;
            }
        }
        TransformKind::MoveCells {
            source,
            to_sheet,
            d_col,
            d_row,
        } => {
            if source.contains(*address) {
                address.sheet = to_sheet;
                address.col = (address.col as i64 + d_col) as u32;
                address.row = (address.row as i64 + d_row) as u32;
            }
        }
    }
}

/// Rewrites a single cell reference. Returns false when the reference's
/// target was removed and the operand must dangle.
fn transform_cell_ref(kind: &TransformKind, r: &mut BoundRef, anchor_before: CellAddress) -> bool {
    match *kind {
        TransformKind::AddRows { sheet, row, count } => {
            if r.sheet == sheet && r.row >= row {
                r.row += count;
            }
            true
        }
        TransformKind::RemoveRows {
            sheet,
            row_start,
            row_end,
        } => {
            if r.sheet != sheet {
                return true;
            }
            if r.row >= row_start && r.row <= row_end {
                return false;
            }
            if r.row > row_end {
                r.row -= row_end - row_start + 1;
            }
            true
        }
        TransformKind::AddColumns { sheet, col, count } => {
            if r.sheet == sheet && r.col >= col {
                r.col += count;
            }
            true
        }
        TransformKind::RemoveColumns {
            sheet,
            col_start,
            col_end,
        } => {
            if r.sheet != sheet {
                return true;
            }
            if r.col >= col_start && r.col <= col_end {
                return false;
            }
            if r.col > col_end {
                r.col -= col_end - col_start + 1;
            }
            true
        }
        TransformKind::MoveCells {
            source,
            to_sheet,
            d_col,
            d_row,
        } => {
            if source.contains(r.address()) {
                // The target traveled with the moved block.
                r.sheet = to_sheet;
                r.col = (r.col as i64 + d_col) as u32;
                r.row = (r.row as i64 + d_row) as u32;
                return true;
            }
            if source.contains(anchor_before) {
                // The formula itself moved: relative components follow the
                // carrier cell, pinned components stay put.
                return shift_relative_axes(r, to_sheet, source.sheet, d_col, d_row);
            }
            // References into the move destination are deliberately not
            // retargeted: the move overwrites those cells.
            true
        }
    }
}

/// Rewrites a range reference's corners. Returns false when the rectangle
/// was removed entirely.
fn transform_range_ref(
    kind: &TransformKind,
    start: &mut BoundRef,
    end: &mut BoundRef,
    anchor_before: CellAddress,
) -> bool {
    match *kind {
        TransformKind::AddRows { sheet, row, count } => {
            if start.sheet == sheet {
                if start.row >= row {
                    start.row += count;
                    end.row += count;
                } else if end.row >= row {
                    // The insert landed inside the rectangle: it grows.
                    end.row += count;
                }
            }
            true
        }
        TransformKind::RemoveRows {
            sheet,
            row_start,
            row_end,
        } => {
            if start.sheet != sheet {
                return true;
            }
            let count = row_end - row_start + 1;
            if start.row >= row_start && end.row <= row_end {
                return false;
            }
            if end.row < row_start {
                return true;
            }
            if start.row >= row_start {
                // Top corner was removed; the survivor starts at the cut.
                start.row = row_start;
                end.row -= count;
            } else if end.row > row_end {
                end.row -= count;
            } else {
                // Bottom corner was removed.
                end.row = row_start - 1;
            }
            true
        }
        TransformKind::AddColumns { sheet, col, count } => {
            if start.sheet == sheet {
                if start.col >= col {
                    start.col += count;
                    end.col += count;
                } else if end.col >= col {
                    end.col += count;
                }
            }
            true
        }
        TransformKind::RemoveColumns {
            sheet,
            col_start,
            col_end,
        } => {
            if start.sheet != sheet {
                return true;
            }
            let count = col_end - col_start + 1;
            if start.col >= col_start && end.col <= col_end {
                return false;
            }
            if end.col < col_start {
                return true;
            }
            if start.col >= col_start {
                start.col = col_start;
                end.col -= count;
            } else if end.col > col_end {
                end.col -= count;
            } else {
                end.col = col_start - 1;
            }
            true
        }
        TransformKind::MoveCells {
            source,
            to_sheet,
            d_col,
            d_row,
        } => {
            let rect = CellRange::new(start.sheet, (start.col, start.row), (end.col, end.row));
            if source.contains_range(&rect) {
                for corner in [&mut *start, &mut *end] {
                    corner.sheet = to_sheet;
                    corner.col = (corner.col as i64 + d_col) as u32;
                    corner.row = (corner.row as i64 + d_row) as u32;
                }
                return true;
            }
            if source.contains(anchor_before) {
                let start_ok = shift_relative_axes(start, to_sheet, source.sheet, d_col, d_row);
                let end_ok = shift_relative_axes(end, to_sheet, source.sheet, d_col, d_row);
                return start_ok && end_ok;
            }
            true
        }
    }
}

/// Shifts the relative components of a carrier formula's reference by the
/// move delta. A shift below the sheet origin leaves the reference dangling.
fn shift_relative_axes(
    r: &mut BoundRef,
    to_sheet: SheetId,
    source_sheet: SheetId,
    d_col: i64,
    d_row: i64,
) -> bool {
    let mut col = r.col as i64;
    let mut row = r.row as i64;
    if !r.col_abs {
        col += d_col;
    }
    if !r.row_abs {
        row += d_row;
    }
    if col < 0 || row < 0 {
        return false;
    }
    r.col = col as u32;
    r.row = row as u32;
    // Implicit same-sheet references follow the carrier across sheets;
    // a fully pinned reference keeps its sheet.
    if r.sheet == source_sheet && !(r.col_abs && r.row_abs) {
        r.sheet = to_sheet;
    }
    true
}

/// Copy-on-write fork: rebuilds the tree with the invalidated reference
/// nodes replaced by Error(ref) literals. Only called when at least one
/// reference dangles, so shared templates stay shared in the common case.
pub(crate) fn replace_invalidated_refs(
    expr: &Expression,
    invalidated: &HashSet<usize>,
) -> Expression {
    match expr {
        Expression::CellReference { operand } | Expression::RangeReference { operand }
            if invalidated.contains(operand) =>
        {
            Expression::Error(AstError::Ref)
        }
        Expression::BinaryOp { left, op, right } => Expression::BinaryOp {
            left: Box::new(replace_invalidated_refs(left, invalidated)),
            op: *op,
            right: Box::new(replace_invalidated_refs(right, invalidated)),
        },
        Expression::UnaryOp { op, operand } => Expression::UnaryOp {
            op: *op,
            operand: Box::new(replace_invalidated_refs(operand, invalidated)),
        },
        Expression::FunctionCall { name, args } => Expression::FunctionCall {
            name: name.clone(),
            args: args
                .iter()
                .map(|arg| replace_invalidated_refs(arg, invalidated))
                .collect(),
        },
        other => other.clone(),
    }
}
