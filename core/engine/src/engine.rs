//! FILENAME: core/engine/src/engine.rs
//! PURPOSE: The public engine facade.
//! CONTEXT: Owns the dependency graph, the caching parser, the lazy
//! transform queue, and the configuration. Every mutating call finishes
//! with the affected dirty closure recomputed, so queries made afterwards
//! always observe consistent values; the structural family batches its
//! recomputation behind `recompute_if_needed`, invoked before returning.

use crate::address::{parse_a1, CellAddress, CellRange, SheetId};
use crate::config::EngineConfig;
use crate::content::{parse_cell_content, CellContent};
use crate::error::EngineError;
use crate::evaluator::{
    apply_pending_to_formula, apply_pending_to_matrix, partial_run, RunStatistics,
};
use crate::graph::DependencyGraph;
use crate::interpreter::apply_precision;
use crate::lazy_transform::{replace_invalidated_refs, LazyTransformService};
use crate::value::CellValue;
use crate::vertex::{
    bind_operand, BoundOperand, FormulaVertex, MatrixPayload, MatrixVertex, Vertex,
};
use parser::{CachingParser, Expression, ParsedFormula};
use std::cell::Cell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// The in-memory spreadsheet calculation engine.
pub struct Engine {
    graph: DependencyGraph,
    parser: CachingParser,
    lazy: LazyTransformService,
    config: EngineConfig,
    /// Deterministic state behind RAND(); advances once per call.
    rand_state: Cell<u64>,
    numeric_matrices_enabled: bool,
}

impl Engine {
    // ------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------

    /// An empty engine with default options and no sheets.
    pub fn empty() -> Self {
        Self::empty_with_config(EngineConfig::default()).expect("default config is valid")
    }

    /// An empty engine with explicit options.
    pub fn empty_with_config(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let parser = CachingParser::new(config.function_arg_separator);
        Ok(Engine {
            graph: DependencyGraph::new(),
            parser,
            lazy: LazyTransformService::new(),
            config,
            rand_state: Cell::new(0x5eed_cafe_f00d_u64),
            numeric_matrices_enabled: true,
        })
    }

    /// Builds a one-sheet engine ("Sheet1") from a 2D array of cell strings.
    pub fn from_sheet(rows: Vec<Vec<String>>) -> Result<Self, EngineError> {
        Self::from_sheets_with_config(vec![("Sheet1".to_string(), rows)], EngineConfig::default())
    }

    /// Builds a one-sheet engine with explicit options.
    pub fn from_sheet_with_config(
        rows: Vec<Vec<String>>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::from_sheets_with_config(vec![("Sheet1".to_string(), rows)], config)
    }

    /// Builds an engine from (sheet name, 2D array) pairs.
    pub fn from_sheets(sheets: Vec<(String, Vec<Vec<String>>)>) -> Result<Self, EngineError> {
        Self::from_sheets_with_config(sheets, EngineConfig::default())
    }

    pub fn from_sheets_with_config(
        sheets: Vec<(String, Vec<Vec<String>>)>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let mut engine = Self::empty_with_config(config)?;

        for (name, _) in &sheets {
            engine.graph.sheets.add(name);
        }

        for (name, rows) in &sheets {
            let sheet = engine.graph.sheets.fetch(name).expect("sheet registered");
            engine.load_sheet(sheet, rows)?;
        }

        engine.recompute_if_needed();
        Ok(engine)
    }

    /// Ingests one sheet's cells, coalescing numeric blocks into matrix
    /// vertices when matrix detection is on.
    fn load_sheet(&mut self, sheet: SheetId, rows: &[Vec<String>]) -> Result<(), EngineError> {
        let contents: Vec<Vec<CellContent>> = rows
            .iter()
            .map(|row| row.iter().map(|raw| parse_cell_content(raw)).collect())
            .collect();

        let mut covered: HashSet<(u32, u32)> = HashSet::new();
        if self.config.matrix_detection && self.numeric_matrices_enabled {
            for block in detect_numeric_blocks(&contents, self.config.matrix_detection_threshold) {
                let rect = CellRange::new(
                    sheet,
                    (block.col_start, block.row_start),
                    (
                        block.col_start + block.values[0].len() as u32 - 1,
                        block.row_start + block.values.len() as u32 - 1,
                    ),
                );
                for addr in rect.iter() {
                    covered.insert((addr.col, addr.row));
                }
                self.graph.add_new_matrix_vertex(
                    MatrixVertex {
                        range: rect,
                        payload: MatrixPayload::Numeric { rows: block.values },
                    },
                    false,
                    false,
                )?;
            }
        }

        for (r, row) in contents.iter().enumerate() {
            for (c, content) in row.iter().enumerate() {
                let (col, row_index) = (c as u32, r as u32);
                if covered.contains(&(col, row_index)) {
                    continue;
                }
                if matches!(content, CellContent::Empty) {
                    continue;
                }
                let addr = CellAddress::new(sheet, col, row_index);
                self.apply_content(addr, content.clone())?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The computed value of a cell given in A1 notation, optionally
    /// sheet-qualified ("Sheet2!B3"). Unqualified addresses resolve against
    /// the first sheet.
    pub fn cell_value(&self, address: &str) -> Result<CellValue, EngineError> {
        let addr = self.parse_address(address)?;
        Ok(self.graph.get_cell_value(addr))
    }

    /// The computed value at an absolute address.
    pub fn cell_value_at(&self, addr: CellAddress) -> CellValue {
        self.graph.get_cell_value(addr)
    }

    /// All computed values of one sheet, row-major, sized to the sheet's
    /// dimensions.
    pub fn values(&self, sheet: SheetId) -> Result<Vec<Vec<CellValue>>, EngineError> {
        if !self.graph.sheets.has(sheet) {
            return Err(EngineError::UnknownSheetId(sheet));
        }
        let (width, height) = self.dimensions_of(sheet);
        let mut rows = Vec::with_capacity(height as usize);
        for row in 0..height {
            let mut cells = Vec::with_capacity(width as usize);
            for col in 0..width {
                cells.push(self.graph.get_cell_value(CellAddress::new(sheet, col, row)));
            }
            rows.push(cells);
        }
        Ok(rows)
    }

    /// (width, height) of one sheet's occupied area.
    pub fn sheet_dimensions(&self, sheet: SheetId) -> Result<(u32, u32), EngineError> {
        if !self.graph.sheets.has(sheet) {
            return Err(EngineError::UnknownSheetId(sheet));
        }
        Ok(self.dimensions_of(sheet))
    }

    /// Dimensions of every sheet, in sheet-id order.
    pub fn sheets_dimensions(&self) -> Vec<(String, (u32, u32))> {
        self.graph
            .sheets
            .names()
            .iter()
            .enumerate()
            .map(|(id, name)| (name.clone(), self.dimensions_of(id as SheetId)))
            .collect()
    }

    pub fn sheet_id(&self, name: &str) -> Option<SheetId> {
        self.graph.sheets.fetch(name)
    }

    pub fn sheet_name(&self, id: SheetId) -> Option<&str> {
        self.graph.sheets.name(id)
    }

    pub fn sheet_names(&self) -> &[String] {
        self.graph.sheets.names()
    }

    /// Read-only view of the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn dimensions_of(&self, sheet: SheetId) -> (u32, u32) {
        let (cells_w, cells_h) = self.graph.addresses.sheet_extent(sheet);
        let (matrix_w, matrix_h) = self.graph.matrices.sheet_extent(sheet);
        (cells_w.max(matrix_w), cells_h.max(matrix_h))
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Registers a new, empty sheet and returns its id.
    pub fn add_sheet(&mut self, name: &str) -> SheetId {
        self.graph.sheets.add(name)
    }

    /// Sets one cell's content from raw text and recomputes the affected
    /// closure before returning.
    pub fn set_cell_content(&mut self, addr: CellAddress, text: &str) -> Result<(), EngineError> {
        if !self.graph.sheets.has(addr.sheet) {
            return Err(EngineError::UnknownSheetId(addr.sheet));
        }
        self.apply_content(addr, parse_cell_content(text))?;
        self.recompute_if_needed();
        Ok(())
    }

    /// Inserts `count` empty rows before `row`.
    pub fn add_rows(&mut self, sheet: SheetId, row: u32, count: u32) -> Result<(), EngineError> {
        self.check_sheet(sheet)?;
        self.graph.add_rows(sheet, row, count, &mut self.lazy)?;
        self.recompute_if_needed();
        Ok(())
    }

    /// Removes the inclusive row span [row_start, row_end].
    pub fn remove_rows(
        &mut self,
        sheet: SheetId,
        row_start: u32,
        row_end: u32,
    ) -> Result<(), EngineError> {
        self.check_sheet(sheet)?;
        self.graph.remove_rows(sheet, row_start, row_end, &mut self.lazy)?;
        self.recompute_if_needed();
        Ok(())
    }

    /// Inserts `count` empty columns before `col`.
    pub fn add_columns(&mut self, sheet: SheetId, col: u32, count: u32) -> Result<(), EngineError> {
        self.check_sheet(sheet)?;
        self.graph.add_columns(sheet, col, count, &mut self.lazy)?;
        self.recompute_if_needed();
        Ok(())
    }

    /// Removes the inclusive column span [col_start, col_end].
    pub fn remove_columns(
        &mut self,
        sheet: SheetId,
        col_start: u32,
        col_end: u32,
    ) -> Result<(), EngineError> {
        self.check_sheet(sheet)?;
        self.graph
            .remove_columns(sheet, col_start, col_end, &mut self.lazy)?;
        self.recompute_if_needed();
        Ok(())
    }

    /// Moves the `source` rectangle so its top-left corner lands on `dest`.
    pub fn move_cells(&mut self, source: CellRange, dest: CellAddress) -> Result<(), EngineError> {
        self.check_sheet(source.sheet)?;
        self.check_sheet(dest.sheet)?;
        let d_col = dest.col as i64 - source.start_col as i64;
        let d_row = dest.row as i64 - source.start_row as i64;
        self.graph
            .move_cells(source, d_col, d_row, dest.sheet, &mut self.lazy)?;
        self.recompute_if_needed();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Runs the evaluator if anything is dirty. The structural operations
    /// call this before returning; it is also safe to call at any time.
    pub fn recompute_if_needed(&mut self) -> RunStatistics {
        if !self.graph.has_dirty_vertices() {
            // Idempotent clear: a structural no-op leaves nothing behind.
            self.graph.clear_recently_changed_vertices();
            return RunStatistics::default();
        }
        partial_run(&mut self.graph, &self.lazy, &self.config, &self.rand_state)
    }

    /// Applies every queued structural transformation to every cached
    /// formula now, instead of on next evaluation.
    pub fn force_apply_postponed_transformations(&mut self) {
        for id in self.graph.live_vertex_ids() {
            match self.graph.vertex(id) {
                Some(Vertex::Formula(_)) => apply_pending_to_formula(&mut self.graph, &self.lazy, id),
                Some(Vertex::Matrix(_)) => apply_pending_to_matrix(&mut self.graph, &self.lazy, id),
                _ => {}
            }
        }
        debug!(version = self.lazy.version(), "applied postponed transformations");
    }

    /// Splits every numeric matrix back into plain value cells and stops
    /// representing numeric blocks as matrices from now on.
    pub fn disable_numeric_matrices(&mut self) {
        self.numeric_matrices_enabled = false;
        for sheet in 0..self.graph.sheets.count() as SheetId {
            for (_, id) in self.graph.matrices.matrices_in_sheet(sheet) {
                let numeric = matches!(
                    self.graph.vertex(id),
                    Some(Vertex::Matrix(MatrixVertex {
                        payload: MatrixPayload::Numeric { .. },
                        ..
                    }))
                );
                if numeric {
                    self.graph
                        .break_matrix_to_cells(id)
                        .expect("numeric matrices always split");
                }
            }
        }
        self.recompute_if_needed();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn check_sheet(&self, sheet: SheetId) -> Result<(), EngineError> {
        if self.graph.sheets.has(sheet) {
            Ok(())
        } else {
            Err(EngineError::UnknownSheetId(sheet))
        }
    }

    /// Routes classified content into the graph.
    fn apply_content(&mut self, addr: CellAddress, content: CellContent) -> Result<(), EngineError> {
        match content {
            CellContent::Empty => self.graph.set_cell_empty(addr),
            CellContent::Number(n) => {
                let value = apply_precision(&self.config, CellValue::Number(n));
                self.graph.set_value_to_cell(addr, value).map(|_| ())
            }
            CellContent::Text(s) => self
                .graph
                .set_value_to_cell(addr, CellValue::Text(s))
                .map(|_| ()),
            CellContent::Formula(text) => {
                let parsed = self.parser.parse(&text);
                let vertex = self.build_formula_vertex(addr, &parsed);
                self.graph.set_formula_to_cell(addr, vertex).map(|_| ())
            }
            CellContent::MatrixFormula(text) => {
                let parsed = self.parser.parse(&text);
                let vertex = self.build_formula_vertex(addr, &parsed);
                let (width, height) = infer_matrix_size(&vertex.ast, &vertex.operands);
                let rect = CellRange::new(
                    addr.sheet,
                    (addr.col, addr.row),
                    (addr.col + width - 1, addr.row + height - 1),
                );
                self.graph
                    .add_new_matrix_vertex(
                        MatrixVertex {
                            range: rect,
                            payload: MatrixPayload::Formula {
                                ast: vertex.ast,
                                operands: vertex.operands,
                                version: vertex.version,
                                cache: None,
                            },
                        },
                        parsed.volatile,
                        parsed.structure_sensitive,
                    )
                    .map(|_| ())
            }
        }
    }

    /// Binds a parsed formula against its anchor: operands resolve their
    /// sheet qualifiers, references to unknown sheets dangle immediately.
    fn build_formula_vertex(&self, addr: CellAddress, parsed: &ParsedFormula) -> FormulaVertex {
        let mut operands = Vec::with_capacity(parsed.operands.len());
        let mut invalid: HashSet<usize> = HashSet::new();
        for (index, operand) in parsed.operands.iter().enumerate() {
            match bind_operand(operand, addr.sheet, |name| self.graph.sheets.fetch(name)) {
                Some(bound) => operands.push(bound),
                None => {
                    operands.push(BoundOperand::Invalid);
                    invalid.insert(index);
                }
            }
        }
        let ast: Arc<Expression> = if invalid.is_empty() {
            Arc::clone(&parsed.ast)
        } else {
            Arc::new(replace_invalidated_refs(&parsed.ast, &invalid))
        };
        FormulaVertex {
            ast,
            operands,
            address: addr,
            version: self.lazy.version(),
            volatile: parsed.volatile,
            structure_sensitive: parsed.structure_sensitive,
            cached: None,
        }
    }

    /// Parses "B3" or "Sheet2!B3" into an absolute address. Unqualified
    /// references land on sheet 0.
    pub fn parse_address(&self, text: &str) -> Result<CellAddress, EngineError> {
        let (sheet, cell_part) = match text.rsplit_once('!') {
            Some((sheet_name, cell_part)) => {
                let trimmed = sheet_name.trim().trim_matches('\'');
                let sheet = self
                    .graph
                    .sheets
                    .fetch(trimmed)
                    .ok_or_else(|| EngineError::UnknownSheet(trimmed.to_string()))?;
                (sheet, cell_part)
            }
            None => (0, text),
        };
        let (col, row) =
            parse_a1(cell_part).ok_or_else(|| EngineError::InvalidAddress(text.to_string()))?;
        Ok(CellAddress::new(sheet, col, row))
    }
}

/// One detected rectangular block of numeric cells.
struct NumericBlock {
    col_start: u32,
    row_start: u32,
    /// Row-major values, all rows the same width.
    values: Vec<Vec<f64>>,
}

/// Finds maximal same-span vertical stacks of horizontal numeric runs.
/// A block qualifies when both its width and height reach `threshold`.
fn detect_numeric_blocks(grid: &[Vec<CellContent>], threshold: u32) -> Vec<NumericBlock> {
    // (col_start, col_end_exclusive) -> accumulated rows.
    struct Active {
        col_start: u32,
        col_end: u32,
        row_start: u32,
        values: Vec<Vec<f64>>,
    }

    let mut active: Vec<Active> = Vec::new();
    let mut blocks: Vec<NumericBlock> = Vec::new();

    let close = |entry: Active, blocks: &mut Vec<NumericBlock>| {
        let width = entry.col_end - entry.col_start;
        let height = entry.values.len() as u32;
        if width >= threshold && height >= threshold {
            blocks.push(NumericBlock {
                col_start: entry.col_start,
                row_start: entry.row_start,
                values: entry.values,
            });
        }
    };

    for (r, row) in grid.iter().enumerate() {
        // Horizontal numeric runs in this row.
        let mut runs: Vec<(u32, u32, Vec<f64>)> = Vec::new();
        let mut c = 0usize;
        while c < row.len() {
            if let CellContent::Number(first) = &row[c] {
                let start = c as u32;
                let mut numbers = vec![*first];
                c += 1;
                while c < row.len() {
                    if let CellContent::Number(n) = &row[c] {
                        numbers.push(*n);
                        c += 1;
                    } else {
                        break;
                    }
                }
                runs.push((start, c as u32, numbers));
            } else {
                c += 1;
            }
        }

        // Continue matching stacks, close the rest.
        let mut next_active: Vec<Active> = Vec::new();
        for entry in active.drain(..) {
            if let Some(run) = runs
                .iter_mut()
                .find(|(start, end, _)| *start == entry.col_start && *end == entry.col_end)
            {
                let mut entry = entry;
                entry.values.push(std::mem::take(&mut run.2));
                run.0 = u32::MAX; // consumed
                next_active.push(entry);
            } else {
                close(entry, &mut blocks);
            }
        }
        for (start, end, numbers) in runs {
            if start == u32::MAX {
                continue;
            }
            next_active.push(Active {
                col_start: start,
                col_end: end,
                row_start: r as u32,
                values: vec![numbers],
            });
        }
        active = next_active;
    }
    for entry in active {
        close(entry, &mut blocks);
    }

    blocks.sort_by_key(|block| (block.row_start, block.col_start));
    blocks
}

/// Static size of an array formula's result rectangle, derived from the
/// template shape: bare ranges take their own dimensions, MMULT takes
/// (rows of A) x (columns of B), TRANSPOSE swaps. Anything else is 1x1.
fn infer_matrix_size(ast: &Expression, operands: &[BoundOperand]) -> (u32, u32) {
    fn arg_dims(arg: &Expression, operands: &[BoundOperand]) -> (u32, u32) {
        match arg {
            Expression::RangeReference { operand } => operands
                .get(*operand)
                .and_then(|op| op.range())
                .map(|rect| (rect.width(), rect.height()))
                .unwrap_or((1, 1)),
            other => infer_matrix_size(other, operands),
        }
    }

    match ast {
        Expression::RangeReference { .. } => arg_dims(ast, operands),
        Expression::FunctionCall { name, args } => match (name.as_str(), args.as_slice()) {
            ("MMULT", [a, b]) => {
                let (_, rows) = arg_dims(a, operands);
                let (cols, _) = arg_dims(b, operands);
                (cols, rows)
            }
            ("TRANSPOSE", [a]) => {
                let (width, height) = arg_dims(a, operands);
                (height, width)
            }
            _ => (1, 1),
        },
        _ => (1, 1),
    }
}
