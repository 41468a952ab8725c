//! FILENAME: core/engine/src/vertex.rs
//! PURPOSE: Vertex identities and payloads for the dependency graph.
//! CONTEXT: The graph owns an arena of vertices addressed by stable integer
//! ids; cell and range vertices share the id space, and edges are stored as
//! id pairs. Changing a cell from one variant to another replaces the
//! payload at the same id, which is what preserves incoming edges across
//! content changes.

use crate::address::{CellAddress, CellRange, SheetId};
use crate::value::CellValue;
use parser::{Expression, Operand, RefAddress};
use std::sync::Arc;

/// Stable identity of a vertex in the graph arena.
#[derive(Debug, Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct VertexId(pub(crate) u32);

impl VertexId {
    pub(crate) fn new(id: u32) -> Self {
        Self(id)
    }

    pub(crate) fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// A reference operand bound against its anchor: absolute coordinates plus
/// the per-axis relative/absolute kind the formula was written with. The
/// kinds drive structural rewrites; the coordinates drive resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundRef {
    pub sheet: SheetId,
    pub col: u32,
    pub row: u32,
    pub col_abs: bool,
    pub row_abs: bool,
}

impl BoundRef {
    pub fn address(&self) -> CellAddress {
        CellAddress::new(self.sheet, self.col, self.row)
    }
}

/// One bound operand of a formula. Slots are never removed, so the AST's
/// operand indices stay valid across structural rewrites; a reference whose
/// target was deleted keeps its slot as `Invalid` while the tree node
/// becomes an Error(ref) literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundOperand {
    Cell(BoundRef),
    /// Corners normalized so the first is top-left; both on `sheet` of the
    /// first corner.
    Range(BoundRef, BoundRef),
    /// Invalidated by a structural change.
    Invalid,
}

impl BoundOperand {
    /// The rectangle a range operand covers.
    pub fn range(&self) -> Option<CellRange> {
        match self {
            BoundOperand::Range(start, end) => Some(CellRange::new(
                start.sheet,
                (start.col, start.row),
                (end.col, end.row),
            )),
            _ => None,
        }
    }
}

/// Binds a parsed operand against an anchor sheet: resolves the implicit
/// sheet qualifier and extracts the per-axis kinds. Returns None when the
/// operand names a sheet the resolver does not know.
pub fn bind_operand<F>(
    operand: &Operand,
    anchor_sheet: SheetId,
    resolve_sheet: F,
) -> Option<BoundOperand>
where
    F: Fn(&str) -> Option<SheetId>,
{
    let bind_ref = |address: &RefAddress, default_sheet: SheetId| -> Option<BoundRef> {
        let sheet = match &address.sheet {
            Some(name) => resolve_sheet(name)?,
            None => default_sheet,
        };
        Some(BoundRef {
            sheet,
            col: address.col.index(),
            row: address.row.index(),
            col_abs: address.col.is_absolute(),
            row_abs: address.row.is_absolute(),
        })
    };

    match operand {
        Operand::Cell(address) => Some(BoundOperand::Cell(bind_ref(address, anchor_sheet)?)),
        Operand::Range(first, second) => {
            let start = bind_ref(first, anchor_sheet)?;
            // The first corner's sheet qualifier covers the rectangle.
            let end = bind_ref(second, start.sheet)?;
            let (mut a, mut b) = (start, end);
            // Normalize per-axis so a is the top-left corner; the kind
            // markers travel with their coordinates.
            if a.col > b.col {
                std::mem::swap(&mut a.col, &mut b.col);
                std::mem::swap(&mut a.col_abs, &mut b.col_abs);
            }
            if a.row > b.row {
                std::mem::swap(&mut a.row, &mut b.row);
                std::mem::swap(&mut a.row_abs, &mut b.row_abs);
            }
            Some(BoundOperand::Range(a, b))
        }
    }
}

/// A formula cell vertex. The template tree is shared through the parser
/// cache; everything cell-specific (operands, anchor, cached value) lives
/// here. `version` is the lazy-transform watermark: records newer than it
/// must be applied before the vertex is evaluated.
#[derive(Debug, Clone)]
pub struct FormulaVertex {
    pub ast: Arc<Expression>,
    pub operands: Vec<BoundOperand>,
    pub address: CellAddress,
    pub version: u64,
    pub volatile: bool,
    pub structure_sensitive: bool,
    pub cached: Option<CellValue>,
}

/// Payload of a matrix vertex: either an array formula with its result
/// cache, or a dense numeric block produced by matrix detection.
#[derive(Debug, Clone)]
pub enum MatrixPayload {
    Formula {
        ast: Arc<Expression>,
        operands: Vec<BoundOperand>,
        version: u64,
        cache: Option<Vec<Vec<CellValue>>>,
    },
    Numeric {
        /// Row-major values, dimensions matching the vertex rectangle.
        rows: Vec<Vec<f64>>,
    },
}

/// A matrix vertex owns a rectangular block of the sheet. Exactly one
/// matrix vertex covers each cell inside its rectangle.
#[derive(Debug, Clone)]
pub struct MatrixVertex {
    pub range: CellRange,
    pub payload: MatrixPayload,
}

impl MatrixVertex {
    /// Value of one covered cell. Rows/cols are absolute sheet coordinates.
    pub fn value_at(&self, col: u32, row: u32) -> CellValue {
        debug_assert!(self.range.contains(CellAddress::new(self.range.sheet, col, row)));
        let r = (row - self.range.start_row) as usize;
        let c = (col - self.range.start_col) as usize;
        match &self.payload {
            MatrixPayload::Numeric { rows } => rows
                .get(r)
                .and_then(|cells| cells.get(c))
                .map(|n| CellValue::Number(*n))
                .unwrap_or(CellValue::Empty),
            MatrixPayload::Formula { cache, .. } => cache
                .as_ref()
                .and_then(|rows| rows.get(r))
                .and_then(|cells| cells.get(c))
                .cloned()
                .unwrap_or(CellValue::Empty),
        }
    }
}

/// An interned range vertex: at most one exists per (sheet, corners).
/// It fans in from every covered cell so a formula referencing the range
/// needs a single edge.
#[derive(Debug, Clone)]
pub struct RangeVertex {
    pub range: CellRange,
}

/// A vertex of the dependency graph.
#[derive(Debug, Clone)]
pub enum Vertex {
    /// The absence of a value; kept only while depended upon.
    Empty,
    /// A literal value.
    Value(CellValue),
    /// A formula cell.
    Formula(FormulaVertex),
    /// A rectangular array formula or numeric block.
    Matrix(MatrixVertex),
    /// An interned rectangular range.
    Range(RangeVertex),
}

impl Vertex {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Vertex::Empty => "empty",
            Vertex::Value(_) => "value",
            Vertex::Formula(_) => "formula",
            Vertex::Matrix(_) => "matrix",
            Vertex::Range(_) => "range",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parser::Axis as PAxis;

    fn raw(col: PAxis, row: PAxis) -> RefAddress {
        RefAddress {
            sheet: None,
            col,
            row,
        }
    }

    #[test]
    fn binds_cell_operand_to_anchor_sheet() {
        let operand = Operand::Cell(raw(PAxis::Relative(1), PAxis::Absolute(2)));
        let bound = bind_operand(&operand, 3, |_| None).unwrap();
        assert_eq!(
            bound,
            BoundOperand::Cell(BoundRef {
                sheet: 3,
                col: 1,
                row: 2,
                col_abs: false,
                row_abs: true,
            })
        );
    }

    #[test]
    fn binds_sheet_qualified_operand() {
        let operand = Operand::Cell(RefAddress {
            sheet: Some("DATA".to_string()),
            col: PAxis::Relative(0),
            row: PAxis::Relative(0),
        });
        let bound = bind_operand(&operand, 0, |name| (name == "DATA").then_some(7));
        match bound {
            Some(BoundOperand::Cell(r)) => assert_eq!(r.sheet, 7),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(bind_operand(&operand, 0, |_| None).is_none());
    }

    #[test]
    fn range_operand_normalizes_corners() {
        let operand = Operand::Range(
            raw(PAxis::Relative(3), PAxis::Relative(4)),
            raw(PAxis::Absolute(1), PAxis::Relative(2)),
        );
        match bind_operand(&operand, 0, |_| None).unwrap() {
            BoundOperand::Range(start, end) => {
                assert_eq!((start.col, start.row), (1, 2));
                assert_eq!((end.col, end.row), (3, 4));
                assert!(start.col_abs);
                assert!(!end.col_abs);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn matrix_value_lookup() {
        let matrix = MatrixVertex {
            range: CellRange::new(0, (2, 1), (3, 2)),
            payload: MatrixPayload::Numeric {
                rows: vec![vec![1.0, 2.0], vec![3.0, 4.0]],
            },
        };
        assert_eq!(matrix.value_at(2, 1), CellValue::Number(1.0));
        assert_eq!(matrix.value_at(3, 2), CellValue::Number(4.0));
    }
}
