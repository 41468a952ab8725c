//! FILENAME: core/engine/src/error.rs

use crate::address::{CellRange, SheetId};
use thiserror::Error;

/// Failures of engine operations. These reject fail-fast: when an operation
/// returns an error, the engine state is observably unchanged.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("operation would split the matrix at {0}")]
    MatrixNonSplittable(CellRange),

    #[error("rectangle {0} overlaps an existing matrix or non-empty cells")]
    MatrixOverlap(CellRange),

    #[error("cannot modify a single cell of the array formula at {0}")]
    PartialMatrixEdit(CellRange),

    #[error("move source or target overlaps a matrix")]
    MoveOverlapsMatrix,

    #[error("unknown sheet: {0}")]
    UnknownSheet(String),

    #[error("unknown sheet id: {0}")]
    UnknownSheetId(SheetId),

    #[error("invalid cell address: {0}")]
    InvalidAddress(String),

    #[error("move target out of sheet bounds")]
    TargetOutOfBounds,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
