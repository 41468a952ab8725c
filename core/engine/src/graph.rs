//! FILENAME: core/engine/src/graph.rs
//! PURPOSE: The dependency graph at the heart of the recalculation engine.
//! CONTEXT: Tracks which vertices use the values of which other vertices
//! (consumer -> producer edges), so an edit recomputes exactly the affected
//! part of the workbook. Vertices live in an arena addressed by stable ids;
//! cell, range, and matrix vertices share the id space. Changing a cell's
//! content replaces the vertex payload at the same id, preserving the edges
//! of everything that depends on it.
//!
//! TERMINOLOGY (directions follow the consumer's point of view):
//! - Precedents: producers a vertex reads. If A3 = A1 + A2, then A1 and A2
//!   are precedents of A3.
//! - Dependents: consumers of a vertex's value (reverse lookup).
//!
//! Cycles are representable; they are detected during evaluation, never at
//! edge installation time.

use crate::address::{CellAddress, CellRange, SheetId};
use crate::address_mapping::AddressMapping;
use crate::error::EngineError;
use crate::matrix_mapping::MatrixMapping;
use crate::range_mapping::RangeMapping;
use crate::sheet_mapping::SheetMapping;
use crate::value::CellValue;
use crate::vertex::{
    BoundOperand, FormulaVertex, MatrixPayload, MatrixVertex, RangeVertex, Vertex, VertexId,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The dependency graph. Owns all vertices; the address, range, and matrix
/// mappings hold non-owning lookups into the arena.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Vertex arena; slots of removed vertices are tombstoned.
    vertices: Vec<Option<Vertex>>,

    /// For each consumer, the set of producers it reads.
    precedents: HashMap<VertexId, HashSet<VertexId>>,

    /// For each producer, the set of consumers reading it.
    dependents: HashMap<VertexId, HashSet<VertexId>>,

    pub(crate) addresses: AddressMapping,
    pub(crate) ranges: RangeMapping,
    pub(crate) matrices: MatrixMapping,
    pub(crate) sheets: SheetMapping,

    /// Seeds of the next recomputation: vertices whose value or topology
    /// changed since the last evaluator run.
    dirty: HashSet<VertexId>,

    /// Vertices recomputed on every cycle regardless of edits.
    pub(crate) volatile_ids: HashSet<VertexId>,

    /// Vertices recomputed after every structural change.
    pub(crate) structure_sensitive_ids: HashSet<VertexId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Arena
    // ------------------------------------------------------------------

    pub(crate) fn alloc(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId::new(self.vertices.len() as u32);
        self.vertices.push(Some(vertex));
        id
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.as_index())?.as_ref()
    }

    pub(crate) fn vertex_mut(&mut self, id: VertexId) -> Option<&mut Vertex> {
        self.vertices.get_mut(id.as_index())?.as_mut()
    }

    /// Drops a vertex and every edge touching it.
    pub(crate) fn remove_vertex(&mut self, id: VertexId) {
        self.clear_outgoing_edges(id);
        if let Some(consumers) = self.dependents.remove(&id) {
            for consumer in consumers {
                if let Some(precs) = self.precedents.get_mut(&consumer) {
                    precs.remove(&id);
                    if precs.is_empty() {
                        self.precedents.remove(&consumer);
                    }
                }
            }
        }
        self.volatile_ids.remove(&id);
        self.structure_sensitive_ids.remove(&id);
        self.dirty.remove(&id);
        if let Some(slot) = self.vertices.get_mut(id.as_index()) {
            *slot = None;
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.iter().filter(|slot| slot.is_some()).count()
    }

    /// Ids of all live vertices, in id order.
    pub(crate) fn live_vertex_ids(&self) -> Vec<VertexId> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| VertexId::new(index as u32))
            .collect()
    }

    // ------------------------------------------------------------------
    // Edges
    // ------------------------------------------------------------------

    /// Installs one consumer -> producer edge. Idempotent.
    pub(crate) fn add_edge(&mut self, consumer: VertexId, producer: VertexId) {
        self.precedents.entry(consumer).or_default().insert(producer);
        self.dependents.entry(producer).or_default().insert(consumer);
    }

    /// Drops every edge out of `consumer` (the producers it was reading).
    /// Edges into it are preserved.
    pub(crate) fn clear_outgoing_edges(&mut self, consumer: VertexId) {
        if let Some(producers) = self.precedents.remove(&consumer) {
            for producer in producers {
                if let Some(deps) = self.dependents.get_mut(&producer) {
                    deps.remove(&consumer);
                    if deps.is_empty() {
                        self.dependents.remove(&producer);
                    }
                }
            }
        }
    }

    /// Moves every consumer edge of `from` onto `to`. Used when a vertex is
    /// overwritten in place by another vertex (block moves).
    pub(crate) fn transfer_consumers(&mut self, from: VertexId, to: VertexId) {
        if let Some(consumers) = self.dependents.remove(&from) {
            for consumer in consumers {
                if let Some(precs) = self.precedents.get_mut(&consumer) {
                    precs.remove(&from);
                    precs.insert(to);
                }
                self.dependents.entry(to).or_default().insert(consumer);
            }
        }
    }

    /// Direct consumers of a vertex.
    pub fn consumers_of(&self, id: VertexId) -> Option<&HashSet<VertexId>> {
        self.dependents.get(&id)
    }

    /// Direct producers of a vertex.
    pub fn producers_of(&self, id: VertexId) -> Option<&HashSet<VertexId>> {
        self.precedents.get(&id)
    }

    pub fn edge_count(&self) -> usize {
        self.precedents.values().map(|producers| producers.len()).sum()
    }

    // ------------------------------------------------------------------
    // Dirty set
    // ------------------------------------------------------------------

    pub(crate) fn mark_dirty(&mut self, id: VertexId) {
        self.dirty.insert(id);
    }

    pub(crate) fn mark_consumers_dirty(&mut self, id: VertexId) {
        if let Some(consumers) = self.dependents.get(&id) {
            for &consumer in consumers {
                self.dirty.insert(consumer);
            }
        }
    }

    pub(crate) fn mark_structure_sensitive_dirty(&mut self) {
        let sensitive: Vec<VertexId> = self.structure_sensitive_ids.iter().copied().collect();
        for id in sensitive {
            self.dirty.insert(id);
        }
    }

    /// Snapshot of the dirty set, in id order for determinism.
    pub fn vertices_to_recompute(&self) -> Vec<VertexId> {
        let mut seeds: Vec<VertexId> = self.dirty.iter().copied().collect();
        seeds.sort_unstable();
        seeds
    }

    /// Resets the dirty set. Idempotent: calling it when no vertex is dirty
    /// is a no-op.
    pub fn clear_recently_changed_vertices(&mut self) {
        self.dirty.clear();
    }

    pub fn has_dirty_vertices(&self) -> bool {
        !self.dirty.is_empty()
    }

    // ------------------------------------------------------------------
    // Cell lookup and creation
    // ------------------------------------------------------------------

    /// The vertex at an address, materializing an Empty vertex if the
    /// address is unoccupied. Cells covered by a matrix resolve to the
    /// owning matrix vertex.
    pub(crate) fn fetch_or_create_cell(&mut self, addr: CellAddress) -> VertexId {
        if let Some(id) = self.addresses.get(addr) {
            return id;
        }
        let id = self.alloc(Vertex::Empty);
        self.addresses.set(addr, id);
        id
    }

    /// The interned range vertex for a rectangle, creating and wiring it on
    /// first reference: the new vertex gains an edge from every covered
    /// cell, materializing Empty vertices where needed so later writes
    /// propagate through the range.
    pub(crate) fn fetch_or_create_range(&mut self, range: CellRange) -> VertexId {
        if let Some(id) = self.ranges.get(&range) {
            return id;
        }
        let id = self.alloc(Vertex::Range(RangeVertex { range }));
        self.ranges.insert(range, id);
        self.ensure_range_edges(id);
        id
    }

    /// (Re)installs the fan-in edges of a range vertex from every cell its
    /// rectangle currently covers. Idempotent.
    pub(crate) fn ensure_range_edges(&mut self, id: VertexId) {
        let range = match self.vertex(id) {
            Some(Vertex::Range(r)) => r.range,
            _ => return,
        };
        let addrs: Vec<CellAddress> = range.iter().collect();
        for addr in addrs {
            let cell = self.fetch_or_create_cell(addr);
            self.add_edge(id, cell);
        }
    }

    /// Last computed value of the cell at `addr`. Consistent once the
    /// evaluator has drained the dirty set containing the address.
    pub fn get_cell_value(&self, addr: CellAddress) -> CellValue {
        match self.addresses.get(addr).and_then(|id| self.vertex(id)) {
            None | Some(Vertex::Empty) => CellValue::Empty,
            Some(Vertex::Value(value)) => value.clone(),
            Some(Vertex::Formula(formula)) => {
                formula.cached.clone().unwrap_or(CellValue::Empty)
            }
            Some(Vertex::Matrix(matrix)) => matrix.value_at(addr.col, addr.row),
            Some(Vertex::Range(_)) => CellValue::Empty,
        }
    }

    // ------------------------------------------------------------------
    // Public mutation operations
    // ------------------------------------------------------------------

    /// Converts the vertex at `addr` into a Value vertex. Existing edges
    /// out of the vertex are dropped; edges into it are preserved, and its
    /// consumers are marked for recomputation.
    pub fn set_value_to_cell(
        &mut self,
        addr: CellAddress,
        value: CellValue,
    ) -> Result<VertexId, EngineError> {
        if let Some((rect, matrix_id)) = self.matrices.matrix_at(addr.sheet, addr.col, addr.row) {
            let mut absorbed = false;
            if let Some(Vertex::Matrix(matrix)) = self.vertex_mut(matrix_id) {
                if let (MatrixPayload::Numeric { rows }, CellValue::Number(n)) =
                    (&mut matrix.payload, &value)
                {
                    // Numeric matrices absorb numeric writes in place.
                    let r = (addr.row - rect.start_row) as usize;
                    let c = (addr.col - rect.start_col) as usize;
                    rows[r][c] = *n;
                    absorbed = true;
                }
            }
            if absorbed {
                self.mark_dirty(matrix_id);
                return Ok(matrix_id);
            }
            // Any other write splits a numeric matrix back into cells, and
            // is rejected outright for array formulas.
            self.break_matrix_to_cells(matrix_id)?;
        }

        let id = self.fetch_or_create_cell(addr);
        self.retire_formula_registration(id);
        self.clear_outgoing_edges(id);
        if let Some(slot) = self.vertex_mut(id) {
            *slot = Vertex::Value(value);
        }
        self.mark_dirty(id);
        Ok(id)
    }

    /// Converts the vertex at `addr` into a Formula vertex, rebuilding its
    /// outgoing edges from the bound operand list.
    pub fn set_formula_to_cell(
        &mut self,
        addr: CellAddress,
        formula: FormulaVertex,
    ) -> Result<VertexId, EngineError> {
        if let Some((_, matrix_id)) = self.matrices.matrix_at(addr.sheet, addr.col, addr.row) {
            self.break_matrix_to_cells(matrix_id)?;
        }

        let id = self.fetch_or_create_cell(addr);
        self.retire_formula_registration(id);
        self.clear_outgoing_edges(id);

        if formula.volatile {
            self.volatile_ids.insert(id);
        }
        if formula.structure_sensitive {
            self.structure_sensitive_ids.insert(id);
        }
        let operands = formula.operands.clone();
        if let Some(slot) = self.vertex_mut(id) {
            *slot = Vertex::Formula(formula);
        }
        self.process_cell_dependencies(&operands, id);
        self.mark_dirty(id);
        Ok(id)
    }

    /// Converts the vertex at `addr` to Empty. The vertex survives only
    /// while something depends on it; otherwise the slot is reclaimed.
    pub fn set_cell_empty(&mut self, addr: CellAddress) -> Result<(), EngineError> {
        if let Some((_, matrix_id)) = self.matrices.matrix_at(addr.sheet, addr.col, addr.row) {
            self.break_matrix_to_cells(matrix_id)?;
        }

        let Some(id) = self.addresses.get(addr) else {
            return Ok(());
        };
        self.retire_formula_registration(id);
        self.clear_outgoing_edges(id);
        self.mark_consumers_dirty(id);

        let depended_upon = self
            .dependents
            .get(&id)
            .map(|consumers| !consumers.is_empty())
            .unwrap_or(false);
        if depended_upon {
            if let Some(slot) = self.vertex_mut(id) {
                *slot = Vertex::Empty;
            }
            self.mark_dirty(id);
        } else {
            self.addresses.remove(addr);
            self.remove_vertex(id);
        }
        Ok(())
    }

    /// Installs a matrix vertex. Rejects rectangles that overlap an
    /// existing matrix or any non-empty cell; Empty vertices inside the
    /// rectangle hand their consumers over to the matrix.
    pub fn add_new_matrix_vertex(
        &mut self,
        matrix: MatrixVertex,
        volatile: bool,
        structure_sensitive: bool,
    ) -> Result<VertexId, EngineError> {
        let rect = matrix.range;
        assert!(
            rect.width() >= 1 && rect.height() >= 1,
            "matrix vertex with degenerate rectangle {}",
            rect
        );
        if self.matrices.intersects(&rect) {
            return Err(EngineError::MatrixOverlap(rect));
        }
        for addr in rect.iter() {
            if let Some(existing) = self.addresses.get(addr) {
                if !matches!(self.vertex(existing), Some(Vertex::Empty)) {
                    return Err(EngineError::MatrixOverlap(rect));
                }
            }
        }

        let operands = match &matrix.payload {
            MatrixPayload::Formula { operands, .. } => operands.clone(),
            MatrixPayload::Numeric { .. } => Vec::new(),
        };

        let id = self.alloc(Vertex::Matrix(matrix));
        let addrs: Vec<CellAddress> = rect.iter().collect();
        for addr in addrs {
            if let Some(existing) = self.addresses.get(addr) {
                if existing != id {
                    self.transfer_consumers(existing, id);
                    self.remove_vertex(existing);
                }
            }
            self.addresses.set(addr, id);
        }
        self.matrices.insert(rect, id);
        if volatile {
            self.volatile_ids.insert(id);
        }
        if structure_sensitive {
            self.structure_sensitive_ids.insert(id);
        }
        self.process_cell_dependencies(&operands, id);
        self.mark_dirty(id);
        debug!(rect = %rect, "installed matrix vertex");
        Ok(id)
    }

    /// Installs the edges a consumer needs for its bound operands,
    /// creating and interning range vertices as required. Idempotent.
    pub fn process_cell_dependencies(&mut self, operands: &[BoundOperand], consumer: VertexId) {
        for operand in operands {
            match operand {
                BoundOperand::Cell(r) => {
                    let producer = self.fetch_or_create_cell(r.address());
                    self.add_edge(consumer, producer);
                }
                BoundOperand::Range(..) => {
                    let range = operand.range().expect("range operand");
                    let producer = self.fetch_or_create_range(range);
                    self.add_edge(consumer, producer);
                }
                BoundOperand::Invalid => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Matrix splitting
    // ------------------------------------------------------------------

    /// Splits a numeric matrix back into per-cell Value vertices. Array
    /// formulas reject partial edits instead.
    pub(crate) fn break_matrix_to_cells(&mut self, matrix_id: VertexId) -> Result<(), EngineError> {
        let (rect, rows) = match self.vertex(matrix_id) {
            Some(Vertex::Matrix(matrix)) => match &matrix.payload {
                MatrixPayload::Numeric { rows } => (matrix.range, rows.clone()),
                MatrixPayload::Formula { .. } => {
                    return Err(EngineError::PartialMatrixEdit(matrix.range))
                }
            },
            _ => return Ok(()),
        };

        // Consumers must be rewired from the matrix to the new cells.
        let consumers: Vec<VertexId> = self
            .dependents
            .get(&matrix_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        self.matrices.remove(&rect);
        for addr in rect.iter() {
            self.addresses.remove(addr);
        }
        self.remove_vertex(matrix_id);

        for addr in rect.iter() {
            let r = (addr.row - rect.start_row) as usize;
            let c = (addr.col - rect.start_col) as usize;
            let id = self.alloc(Vertex::Value(CellValue::Number(rows[r][c])));
            self.addresses.set(addr, id);
        }

        for consumer in consumers {
            self.rewire_consumer(consumer);
            self.mark_dirty(consumer);
        }
        debug!(rect = %rect, "split numeric matrix into cells");
        Ok(())
    }

    /// Reinstalls a consumer's edges after its producers were replaced.
    /// Formula consumers rebuild from their operand lists; range consumers
    /// re-materialize their rectangle fan-in.
    pub(crate) fn rewire_consumer(&mut self, consumer: VertexId) {
        match self.vertex(consumer) {
            Some(Vertex::Formula(formula)) => {
                let operands = formula.operands.clone();
                self.clear_outgoing_edges(consumer);
                self.process_cell_dependencies(&operands, consumer);
            }
            Some(Vertex::Matrix(MatrixVertex {
                payload: MatrixPayload::Formula { operands, .. },
                ..
            })) => {
                let operands = operands.clone();
                self.clear_outgoing_edges(consumer);
                self.process_cell_dependencies(&operands, consumer);
            }
            Some(Vertex::Range(_)) => {
                self.ensure_range_edges(consumer);
            }
            _ => {}
        }
    }

    fn retire_formula_registration(&mut self, id: VertexId) {
        self.volatile_ids.remove(&id);
        self.structure_sensitive_ids.remove(&id);
    }
}
