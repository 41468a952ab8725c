//! FILENAME: core/engine/src/evaluator.rs
//! PURPOSE: Incremental recomputation of the dirty part of the graph.
//! CONTEXT: `partial_run` takes the dirty seeds (plus every volatile
//! vertex), expands them to their transitive consumer closure, and
//! recomputes that closure in topological order, producers before
//! consumers, tie-broken by (sheet, col, row) so identical inputs always
//! produce identical runs. Right before a formula or array formula is
//! consumed, its pending structural transformations are applied. Vertices
//! on dependency cycles are tagged with Error(cycle) and marked clean;
//! their downstream consumers then evaluate normally and see that error
//! as an ordinary value.

use crate::address::CellAddress;
use crate::config::EngineConfig;
use crate::graph::DependencyGraph;
use crate::interpreter::{apply_precision, EvalValue, FormulaContext, Interpreter};
use crate::lazy_transform::LazyTransformService;
use crate::value::{CellValue, ErrorKind};
use crate::vertex::{MatrixPayload, Vertex, VertexId};
use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Counters from one evaluator pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStatistics {
    /// Vertices whose value was recomputed (including cycle-tagged ones).
    pub evaluated: usize,
    /// Vertices tagged with Error(cycle).
    pub cycle_members: usize,
}

/// Recomputes the transitive consumer closure of the dirty set. Clears the
/// dirty set afterwards; clearing an empty set is a no-op by design.
pub fn partial_run(
    graph: &mut DependencyGraph,
    lazy: &LazyTransformService,
    config: &EngineConfig,
    rand_state: &Cell<u64>,
) -> RunStatistics {
    let mut seeds: HashSet<VertexId> = graph.vertices_to_recompute().into_iter().collect();
    // Volatile vertices join every recomputation cycle.
    seeds.extend(graph.volatile_ids.iter().copied());

    if seeds.is_empty() {
        graph.clear_recently_changed_vertices();
        return RunStatistics::default();
    }

    // Reachable subgraph under consumer edges.
    let mut closure: HashSet<VertexId> = HashSet::new();
    let mut queue: VecDeque<VertexId> = seeds.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !closure.insert(id) {
            continue;
        }
        if let Some(consumers) = graph.consumers_of(id) {
            for &consumer in consumers {
                if !closure.contains(&consumer) {
                    queue.push_back(consumer);
                }
            }
        }
    }

    // In-degrees counting only producers inside the closure.
    let mut in_degree: HashMap<VertexId, usize> = HashMap::new();
    for &id in &closure {
        let degree = graph
            .producers_of(id)
            .map(|producers| producers.iter().filter(|p| closure.contains(p)).count())
            .unwrap_or(0);
        in_degree.insert(id, degree);
    }

    let mut ready: BinaryHeap<Reverse<(CellAddress, VertexId)>> = BinaryHeap::new();
    for (&id, &degree) in &in_degree {
        if degree == 0 {
            ready.push(Reverse((schedule_key(graph, id), id)));
        }
    }

    let mut stats = RunStatistics::default();
    let mut emitted: HashSet<VertexId> = HashSet::new();

    loop {
        while let Some(Reverse((_, id))) = ready.pop() {
            if !emitted.insert(id) {
                continue;
            }
            evaluate_vertex(graph, lazy, config, rand_state, id, &mut stats);
            release_consumers(graph, &closure, &mut in_degree, &mut ready, &emitted, id);
        }

        if emitted.len() == closure.len() {
            break;
        }

        // Whatever is left is blocked behind at least one strongly
        // connected component. Tag the cyclic members and release them so
        // their downstream consumers can evaluate against the error.
        let remaining: Vec<VertexId> = {
            let mut rest: Vec<VertexId> = closure
                .iter()
                .filter(|id| !emitted.contains(id))
                .copied()
                .collect();
            rest.sort_unstable();
            rest
        };
        let cyclic = cyclic_vertices(graph, &remaining);
        debug_assert!(!cyclic.is_empty(), "blocked evaluation without a cycle");
        if cyclic.is_empty() {
            // Defensive: avoid an infinite loop on a broken graph.
            break;
        }
        for id in cyclic {
            if !emitted.insert(id) {
                continue;
            }
            write_cycle_error(graph, id);
            stats.evaluated += 1;
            stats.cycle_members += 1;
            release_consumers(graph, &closure, &mut in_degree, &mut ready, &emitted, id);
        }
    }

    graph.clear_recently_changed_vertices();
    debug!(
        evaluated = stats.evaluated,
        cycles = stats.cycle_members,
        "partial run finished"
    );
    stats
}

/// Deterministic scheduling key: cell vertices by their address, range and
/// matrix vertices by their rectangle's top-left corner.
fn schedule_key(graph: &DependencyGraph, id: VertexId) -> CellAddress {
    match graph.vertex(id) {
        Some(Vertex::Range(range)) => range.range.top_left(),
        Some(Vertex::Matrix(matrix)) => matrix.range.top_left(),
        _ => graph
            .addresses
            .address_of(id)
            .unwrap_or(CellAddress::new(u32::MAX, u32::MAX, u32::MAX)),
    }
}

fn release_consumers(
    graph: &DependencyGraph,
    closure: &HashSet<VertexId>,
    in_degree: &mut HashMap<VertexId, usize>,
    ready: &mut BinaryHeap<Reverse<(CellAddress, VertexId)>>,
    emitted: &HashSet<VertexId>,
    id: VertexId,
) {
    if let Some(consumers) = graph.consumers_of(id) {
        for &consumer in consumers {
            if !closure.contains(&consumer) || emitted.contains(&consumer) {
                continue;
            }
            if let Some(degree) = in_degree.get_mut(&consumer) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    ready.push(Reverse((schedule_key(graph, consumer), consumer)));
                }
            }
        }
    }
}

/// Recomputes one vertex: catches its formula up with pending structural
/// transformations, interprets it, and writes the value back before any
/// consumer is visited.
fn evaluate_vertex(
    graph: &mut DependencyGraph,
    lazy: &LazyTransformService,
    config: &EngineConfig,
    rand_state: &Cell<u64>,
    id: VertexId,
    stats: &mut RunStatistics,
) {
    match graph.vertex(id) {
        Some(Vertex::Formula(_)) => {
            apply_pending_to_formula(graph, lazy, id);
            let (ast, operands, anchor) = match graph.vertex(id) {
                Some(Vertex::Formula(formula)) => (
                    formula.ast.clone(),
                    formula.operands.clone(),
                    formula.address,
                ),
                _ => return,
            };
            let interpreter = Interpreter::new(FormulaContext {
                graph,
                config,
                operands: &operands,
                anchor,
                rand_state,
            });
            let value = apply_precision(config, interpreter.evaluate(&ast).into_scalar());
            if let Some(Vertex::Formula(formula)) = graph.vertex_mut(id) {
                formula.cached = Some(value);
            }
            stats.evaluated += 1;
        }
        Some(Vertex::Matrix(matrix)) => {
            if matches!(matrix.payload, MatrixPayload::Numeric { .. }) {
                return;
            }
            apply_pending_to_matrix(graph, lazy, id);
            let (ast, operands, rect) = match graph.vertex(id) {
                Some(Vertex::Matrix(matrix)) => match &matrix.payload {
                    MatrixPayload::Formula { ast, operands, .. } => {
                        (ast.clone(), operands.clone(), matrix.range)
                    }
                    MatrixPayload::Numeric { .. } => return,
                },
                _ => return,
            };
            let interpreter = Interpreter::new(FormulaContext {
                graph,
                config,
                operands: &operands,
                anchor: rect.top_left(),
                rand_state,
            });
            let result = interpreter.evaluate(&ast);
            let cache = shape_matrix_result(config, result, rect.width(), rect.height());
            if let Some(Vertex::Matrix(matrix)) = graph.vertex_mut(id) {
                if let MatrixPayload::Formula { cache: slot, .. } = &mut matrix.payload {
                    *slot = Some(cache);
                }
            }
            stats.evaluated += 1;
        }
        // Values, empties, and range vertices carry no computation.
        _ => {}
    }
}

pub(crate) fn apply_pending_to_formula(
    graph: &mut DependencyGraph,
    lazy: &LazyTransformService,
    id: VertexId,
) {
    let Some(Vertex::Formula(formula)) = graph.vertex(id) else {
        return;
    };
    let Some(applied) = lazy.apply_pending(
        &formula.ast,
        &formula.operands,
        formula.address,
        formula.version,
    ) else {
        return;
    };
    if let Some(Vertex::Formula(formula)) = graph.vertex_mut(id) {
        formula.ast = applied.ast;
        formula.operands = applied.operands;
        formula.address = applied.address;
        formula.version = applied.version;
    }
}

pub(crate) fn apply_pending_to_matrix(
    graph: &mut DependencyGraph,
    lazy: &LazyTransformService,
    id: VertexId,
) {
    let Some(Vertex::Matrix(matrix)) = graph.vertex(id) else {
        return;
    };
    let rect = matrix.range;
    let MatrixPayload::Formula {
        ast,
        operands,
        version,
        ..
    } = &matrix.payload
    else {
        return;
    };
    // The rectangle is maintained eagerly and moves never carry matrices,
    // so only the reference rewrites apply here.
    let Some(applied) = lazy.apply_pending(ast, operands, rect.top_left(), *version) else {
        return;
    };
    if let Some(Vertex::Matrix(matrix)) = graph.vertex_mut(id) {
        if let MatrixPayload::Formula {
            ast,
            operands,
            version,
            ..
        } = &mut matrix.payload
        {
            *ast = applied.ast;
            *operands = applied.operands;
            *version = applied.version;
        }
    }
}

/// Fits an evaluation result into a matrix rectangle: arrays pad with #N/A
/// where too small, scalars broadcast, scalar errors flood the rectangle.
fn shape_matrix_result(
    config: &EngineConfig,
    result: EvalValue,
    width: u32,
    height: u32,
) -> Vec<Vec<CellValue>> {
    let (width, height) = (width as usize, height as usize);
    match result {
        EvalValue::Array(rows) => {
            let mut shaped = Vec::with_capacity(height);
            for r in 0..height {
                let mut row = Vec::with_capacity(width);
                for c in 0..width {
                    let value = rows
                        .get(r)
                        .and_then(|cells| cells.get(c))
                        .cloned()
                        .unwrap_or(CellValue::Error(ErrorKind::Na));
                    row.push(apply_precision(config, value));
                }
                shaped.push(row);
            }
            shaped
        }
        EvalValue::Scalar(value) => {
            let value = apply_precision(config, value);
            vec![vec![value; width]; height]
        }
    }
}

fn write_cycle_error(graph: &mut DependencyGraph, id: VertexId) {
    match graph.vertex_mut(id) {
        Some(Vertex::Formula(formula)) => {
            formula.cached = Some(CellValue::Error(ErrorKind::Cycle));
        }
        Some(Vertex::Matrix(matrix)) => {
            let (width, height) = (matrix.range.width() as usize, matrix.range.height() as usize);
            if let MatrixPayload::Formula { cache, .. } = &mut matrix.payload {
                *cache = Some(vec![vec![CellValue::Error(ErrorKind::Cycle); width]; height]);
            }
        }
        _ => {}
    }
}

/// Members of cyclic strongly connected components within `scope`
/// (size > 1, or a vertex with a self-edge). Iterative Tarjan, so deep
/// dependency chains cannot overflow the stack.
fn cyclic_vertices(graph: &DependencyGraph, scope: &[VertexId]) -> Vec<VertexId> {
    let in_scope: HashSet<VertexId> = scope.iter().copied().collect();

    #[derive(Default)]
    struct State {
        index: HashMap<VertexId, usize>,
        lowlink: HashMap<VertexId, usize>,
        on_stack: HashSet<VertexId>,
        stack: Vec<VertexId>,
        next_index: usize,
        cyclic: Vec<VertexId>,
    }
    let mut state = State::default();

    enum Frame {
        Enter(VertexId),
        Resume(VertexId, Vec<VertexId>, usize),
    }

    for &root in scope {
        if state.index.contains_key(&root) {
            continue;
        }
        let mut work = vec![Frame::Enter(root)];
        while let Some(frame) = work.pop() {
            match frame {
                Frame::Enter(v) => {
                    if state.index.contains_key(&v) {
                        continue;
                    }
                    state.index.insert(v, state.next_index);
                    state.lowlink.insert(v, state.next_index);
                    state.next_index += 1;
                    state.stack.push(v);
                    state.on_stack.insert(v);

                    let successors: Vec<VertexId> = graph
                        .consumers_of(v)
                        .map(|consumers| {
                            let mut list: Vec<VertexId> = consumers
                                .iter()
                                .filter(|c| in_scope.contains(c))
                                .copied()
                                .collect();
                            list.sort_unstable();
                            list
                        })
                        .unwrap_or_default();
                    work.push(Frame::Resume(v, successors, 0));
                }
                Frame::Resume(v, successors, mut next) => {
                    let mut descended = false;
                    while next < successors.len() {
                        let w = successors[next];
                        next += 1;
                        if !state.index.contains_key(&w) {
                            work.push(Frame::Resume(v, successors.clone(), next));
                            work.push(Frame::Enter(w));
                            descended = true;
                            break;
                        }
                        if state.on_stack.contains(&w) {
                            let low = state.lowlink[&v].min(state.index[&w]);
                            state.lowlink.insert(v, low);
                        }
                    }
                    if descended {
                        continue;
                    }

                    // All successors done: close the SCC if v is its root.
                    if state.lowlink[&v] == state.index[&v] {
                        let mut component = Vec::new();
                        while let Some(w) = state.stack.pop() {
                            state.on_stack.remove(&w);
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        let self_loop = component.len() == 1
                            && graph
                                .consumers_of(component[0])
                                .map(|consumers| consumers.contains(&component[0]))
                                .unwrap_or(false);
                        if component.len() > 1 || self_loop {
                            state.cyclic.extend(component);
                        }
                    }

                    // Propagate the lowlink to the parent frame.
                    if let Some(Frame::Resume(parent, _, _)) = work.last() {
                        let low = state.lowlink[parent].min(state.lowlink[&v]);
                        state.lowlink.insert(*parent, low);
                    }
                }
            }
        }
    }

    state.cyclic.sort_unstable();
    state.cyclic
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::{BoundOperand, BoundRef, FormulaVertex};
    use parser::Expression;
    use std::sync::Arc;

    fn addr(col: u32, row: u32) -> CellAddress {
        CellAddress::new(0, col, row)
    }

    fn cell_op(col: u32, row: u32) -> BoundOperand {
        BoundOperand::Cell(BoundRef {
            sheet: 0,
            col,
            row,
            col_abs: false,
            row_abs: false,
        })
    }

    /// "=<ref> + <constant>" with the reference as operand 0.
    fn ref_plus(constant: f64) -> Arc<Expression> {
        Arc::new(Expression::BinaryOp {
            left: Box::new(Expression::CellReference { operand: 0 }),
            op: parser::BinaryOperator::Add,
            right: Box::new(Expression::Number(constant)),
        })
    }

    fn formula(at: CellAddress, ast: Arc<Expression>, operands: Vec<BoundOperand>) -> FormulaVertex {
        FormulaVertex {
            ast,
            operands,
            address: at,
            version: 0,
            volatile: false,
            structure_sensitive: false,
            cached: None,
        }
    }

    fn run(graph: &mut DependencyGraph, lazy: &LazyTransformService) -> RunStatistics {
        partial_run(graph, lazy, &EngineConfig::default(), &Cell::new(1))
    }

    #[test]
    fn chain_recomputes_in_order() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        graph.set_value_to_cell(addr(0, 0), CellValue::Number(1.0)).unwrap();
        graph
            .set_formula_to_cell(addr(1, 0), formula(addr(1, 0), ref_plus(1.0), vec![cell_op(0, 0)]))
            .unwrap();
        graph
            .set_formula_to_cell(addr(2, 0), formula(addr(2, 0), ref_plus(1.0), vec![cell_op(1, 0)]))
            .unwrap();

        run(&mut graph, &lazy);
        assert_eq!(graph.get_cell_value(addr(1, 0)), CellValue::Number(2.0));
        assert_eq!(graph.get_cell_value(addr(2, 0)), CellValue::Number(3.0));
        assert!(!graph.has_dirty_vertices());

        // Edit the root; only the chain recomputes, in producer order.
        graph.set_value_to_cell(addr(0, 0), CellValue::Number(10.0)).unwrap();
        let stats = run(&mut graph, &lazy);
        assert_eq!(graph.get_cell_value(addr(2, 0)), CellValue::Number(12.0));
        // Only the two formula cells carry computation.
        assert_eq!(stats.evaluated, 2);
    }

    #[test]
    fn unrelated_cells_are_not_recomputed() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        graph.set_value_to_cell(addr(0, 0), CellValue::Number(1.0)).unwrap();
        graph
            .set_formula_to_cell(addr(1, 0), formula(addr(1, 0), ref_plus(1.0), vec![cell_op(0, 0)]))
            .unwrap();
        graph.set_value_to_cell(addr(0, 5), CellValue::Number(100.0)).unwrap();
        graph
            .set_formula_to_cell(addr(1, 5), formula(addr(1, 5), ref_plus(1.0), vec![cell_op(0, 5)]))
            .unwrap();
        run(&mut graph, &lazy);

        graph.set_value_to_cell(addr(0, 0), CellValue::Number(2.0)).unwrap();
        let stats = run(&mut graph, &lazy);
        assert_eq!(stats.evaluated, 1);
        assert_eq!(graph.get_cell_value(addr(1, 5)), CellValue::Number(101.0));
    }

    #[test]
    fn two_cell_cycle_resolves_to_cycle_errors() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        // A1 = B1, B1 = A1.
        graph
            .set_formula_to_cell(addr(0, 0), formula(addr(0, 0), ref_plus(0.0), vec![cell_op(1, 0)]))
            .unwrap();
        graph
            .set_formula_to_cell(addr(1, 0), formula(addr(1, 0), ref_plus(0.0), vec![cell_op(0, 0)]))
            .unwrap();

        let stats = run(&mut graph, &lazy);
        assert_eq!(stats.cycle_members, 2);
        assert_eq!(
            graph.get_cell_value(addr(0, 0)),
            CellValue::Error(ErrorKind::Cycle)
        );
        assert_eq!(
            graph.get_cell_value(addr(1, 0)),
            CellValue::Error(ErrorKind::Cycle)
        );
        assert!(!graph.has_dirty_vertices());
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        graph
            .set_formula_to_cell(addr(0, 0), formula(addr(0, 0), ref_plus(1.0), vec![cell_op(0, 0)]))
            .unwrap();

        let stats = run(&mut graph, &lazy);
        assert_eq!(stats.cycle_members, 1);
        assert_eq!(
            graph.get_cell_value(addr(0, 0)),
            CellValue::Error(ErrorKind::Cycle)
        );
    }

    #[test]
    fn downstream_of_cycle_evaluates_normally() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        // A1 = B1, B1 = A1, C1 = ISERROR(A1).
        graph
            .set_formula_to_cell(addr(0, 0), formula(addr(0, 0), ref_plus(0.0), vec![cell_op(1, 0)]))
            .unwrap();
        graph
            .set_formula_to_cell(addr(1, 0), formula(addr(1, 0), ref_plus(0.0), vec![cell_op(0, 0)]))
            .unwrap();
        let is_error = Arc::new(Expression::FunctionCall {
            name: "ISERROR".to_string(),
            args: vec![Expression::CellReference { operand: 0 }],
        });
        graph
            .set_formula_to_cell(addr(2, 0), formula(addr(2, 0), is_error, vec![cell_op(0, 0)]))
            .unwrap();

        run(&mut graph, &lazy);
        // The downstream consumer is not tagged; it observes the error.
        assert_eq!(graph.get_cell_value(addr(2, 0)), CellValue::Boolean(true));
    }

    #[test]
    fn volatile_vertices_recompute_every_run() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();

        let rand = Arc::new(Expression::FunctionCall {
            name: "RAND".to_string(),
            args: vec![],
        });
        let mut vertex = formula(addr(0, 0), rand, vec![]);
        vertex.volatile = true;
        graph.set_formula_to_cell(addr(0, 0), vertex).unwrap();

        // One shared RAND state across runs, like the engine holds it.
        let rand_state = Cell::new(1);
        let config = EngineConfig::default();
        partial_run(&mut graph, &lazy, &config, &rand_state);
        let first = graph.get_cell_value(addr(0, 0));

        // No edit at all, but the volatile cell still recomputes.
        let stats = partial_run(&mut graph, &lazy, &config, &rand_state);
        assert_eq!(stats.evaluated, 1);
        let second = graph.get_cell_value(addr(0, 0));
        assert_ne!(first, second);
    }

    #[test]
    fn empty_run_is_idempotent() {
        let mut graph = DependencyGraph::new();
        let lazy = LazyTransformService::new();
        let stats = run(&mut graph, &lazy);
        assert_eq!(stats, RunStatistics::default());
        let stats = run(&mut graph, &lazy);
        assert_eq!(stats, RunStatistics::default());
    }
}
