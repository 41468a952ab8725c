//! FILENAME: core/engine/src/range_mapping.rs
//! PURPOSE: Interned descriptors of rectangular ranges.
//! CONTEXT: Repeated references to the same rectangle must share one range
//! vertex, so a formula referencing A1:C100 costs a single edge no matter
//! how many formulas reference it. Lookup is by (sheet, corners); the
//! structural transformers rewrite keys when rectangles shift or shrink.

use crate::address::{CellRange, SheetId};
use crate::vertex::VertexId;
use std::collections::HashMap;

/// Interning table from rectangle to its unique range vertex.
#[derive(Debug, Default)]
pub struct RangeMapping {
    ranges: HashMap<CellRange, VertexId>,
}

impl RangeMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// The interned vertex for a rectangle, if one exists.
    pub fn get(&self, range: &CellRange) -> Option<VertexId> {
        self.ranges.get(range).copied()
    }

    /// Interns a rectangle under the given vertex. At most one vertex may
    /// ever exist per rectangle; installing a duplicate is a programmer error.
    pub fn insert(&mut self, range: CellRange, id: VertexId) {
        let previous = self.ranges.insert(range, id);
        assert!(
            previous.is_none() || previous == Some(id),
            "range {} interned twice",
            range
        );
    }

    /// Drops the entry for a rectangle, returning its vertex.
    pub fn remove(&mut self, range: &CellRange) -> Option<VertexId> {
        self.ranges.remove(range)
    }

    /// Rekeys a range vertex after a structural change moved or resized its
    /// rectangle.
    pub fn rekey(&mut self, old: &CellRange, new: CellRange) {
        if let Some(id) = self.ranges.remove(old) {
            self.ranges.insert(new, id);
        }
    }

    /// All interned rectangles on one sheet, with their vertices.
    pub fn ranges_in_sheet(&self, sheet: SheetId) -> Vec<(CellRange, VertexId)> {
        let mut result: Vec<(CellRange, VertexId)> = self
            .ranges
            .iter()
            .filter(|(range, _)| range.sheet == sheet)
            .map(|(range, &id)| (*range, id))
            .collect();
        result.sort_unstable_by_key(|(range, _)| {
            (range.start_col, range.start_row, range.end_col, range.end_row)
        });
        result
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
