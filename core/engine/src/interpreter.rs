//! FILENAME: core/engine/src/interpreter.rs
//! PURPOSE: Resolves AST expressions to values (the built-in function library).
//! CONTEXT: The evaluator hands each recomputed vertex's template tree to
//! this module together with the vertex's bound operands and a read-only
//! view of the graph. Reference nodes resolve through the operand list;
//! everything else is a straightforward tree walk. Errors are values and
//! propagate: the first error among a function's arguments wins.
//!
//! SUPPORTED FEATURES:
//! - Literal evaluation: Numbers, Strings, Booleans
//! - Cell and range resolution through the dependency graph
//! - Binary operations: +, -, *, /, ^, &, =, <>, <, >, <=, >=
//! - Unary sign operators
//! - Functions: SUM, AVERAGE, MIN, MAX, COUNT, COUNTA, MEDIAN, IF, AND, OR,
//!              NOT, TRUE, FALSE, ABS, ROUND, SQRT, POWER, MOD, LEN, UPPER,
//!              LOWER, TRIM, CONCATENATE, ISERROR, ISBLANK,
//!              MMULT, TRANSPOSE (array results),
//!              RAND, NOW, TODAY (volatile), ROW, COLUMN, ROWS, COLUMNS
//! - Comparison honoring the case-sensitivity and smart-rounding options

use crate::address::CellAddress;
use crate::config::EngineConfig;
use crate::graph::DependencyGraph;
use crate::value::{CellValue, ErrorKind};
use crate::vertex::BoundOperand;
use chrono::Utc;
use parser::{AstError, BinaryOperator, Expression, UnaryOperator};
use std::cell::Cell;

/// Relative tolerance used by smart rounding when comparing numbers.
const SMART_EPSILON: f64 = 1e-13;

/// The result of evaluating an expression: a single value, or a rectangle
/// of values for range references and array functions.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Scalar(CellValue),
    Array(Vec<Vec<CellValue>>),
}

impl EvalValue {
    fn error(kind: ErrorKind) -> Self {
        EvalValue::Scalar(CellValue::Error(kind))
    }

    /// Collapses to a single cell value: 1x1 arrays unwrap, larger arrays
    /// are a type mismatch for a scalar consumer.
    pub fn into_scalar(self) -> CellValue {
        match self {
            EvalValue::Scalar(value) => value,
            EvalValue::Array(rows) => {
                if rows.len() == 1 && rows[0].len() == 1 {
                    rows.into_iter().next().unwrap().into_iter().next().unwrap()
                } else {
                    CellValue::Error(ErrorKind::Value)
                }
            }
        }
    }

    /// Flattens to the sequence of contained values.
    fn flatten(self) -> Vec<CellValue> {
        match self {
            EvalValue::Scalar(value) => vec![value],
            EvalValue::Array(rows) => rows.into_iter().flatten().collect(),
        }
    }
}

/// Everything one formula needs to resolve: the graph for cell values, the
/// engine options, its own operand list, and its anchor address.
pub struct FormulaContext<'a> {
    pub graph: &'a DependencyGraph,
    pub config: &'a EngineConfig,
    pub operands: &'a [BoundOperand],
    pub anchor: CellAddress,
    /// Deterministic RAND state, owned by the engine and advanced per call.
    pub rand_state: &'a Cell<u64>,
}

/// The formula interpreter; one instance per evaluated vertex.
pub struct Interpreter<'a> {
    ctx: FormulaContext<'a>,
}

impl<'a> Interpreter<'a> {
    pub fn new(ctx: FormulaContext<'a>) -> Self {
        Interpreter { ctx }
    }

    /// Evaluates an AST expression and returns the result.
    pub fn evaluate(&self, expr: &Expression) -> EvalValue {
        match expr {
            Expression::Number(n) => EvalValue::Scalar(CellValue::Number(*n)),
            Expression::String(s) => EvalValue::Scalar(CellValue::Text(s.clone())),
            Expression::Boolean(b) => EvalValue::Scalar(CellValue::Boolean(*b)),
            Expression::EmptyArg => EvalValue::Scalar(CellValue::Empty),
            Expression::Error(AstError::Parse) => EvalValue::error(ErrorKind::Parse),
            Expression::Error(AstError::Ref) => EvalValue::error(ErrorKind::Ref),
            Expression::CellReference { operand } => self.eval_cell_reference(*operand),
            Expression::RangeReference { operand } => self.eval_range_reference(*operand),
            Expression::BinaryOp { left, op, right } => self.eval_binary_op(left, *op, right),
            Expression::UnaryOp { op, operand } => self.eval_unary_op(*op, operand),
            Expression::FunctionCall { name, args } => self.eval_function(name, args),
        }
    }

    fn eval_cell_reference(&self, operand: usize) -> EvalValue {
        match self.ctx.operands.get(operand) {
            Some(BoundOperand::Cell(r)) => {
                EvalValue::Scalar(self.ctx.graph.get_cell_value(r.address()))
            }
            Some(BoundOperand::Invalid) | None => EvalValue::error(ErrorKind::Ref),
            Some(BoundOperand::Range(..)) => EvalValue::error(ErrorKind::Value),
        }
    }

    fn eval_range_reference(&self, operand: usize) -> EvalValue {
        match self.ctx.operands.get(operand) {
            Some(op @ BoundOperand::Range(..)) => {
                let rect = op.range().expect("range operand");
                let mut rows = Vec::with_capacity(rect.height() as usize);
                for row in rect.start_row..=rect.end_row {
                    let mut cells = Vec::with_capacity(rect.width() as usize);
                    for col in rect.start_col..=rect.end_col {
                        cells.push(
                            self.ctx
                                .graph
                                .get_cell_value(CellAddress::new(rect.sheet, col, row)),
                        );
                    }
                    rows.push(cells);
                }
                EvalValue::Array(rows)
            }
            Some(BoundOperand::Invalid) | None => EvalValue::error(ErrorKind::Ref),
            Some(BoundOperand::Cell(_)) => EvalValue::error(ErrorKind::Value),
        }
    }

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    fn eval_binary_op(
        &self,
        left: &Expression,
        op: BinaryOperator,
        right: &Expression,
    ) -> EvalValue {
        let lhs = self.evaluate(left).into_scalar();
        if let CellValue::Error(kind) = lhs {
            return EvalValue::error(kind);
        }
        let rhs = self.evaluate(right).into_scalar();
        if let CellValue::Error(kind) = rhs {
            return EvalValue::error(kind);
        }

        match op {
            BinaryOperator::Add => self.numeric_op(&lhs, &rhs, |a, b| Ok(a + b)),
            BinaryOperator::Subtract => self.numeric_op(&lhs, &rhs, |a, b| Ok(a - b)),
            BinaryOperator::Multiply => self.numeric_op(&lhs, &rhs, |a, b| Ok(a * b)),
            BinaryOperator::Divide => self.numeric_op(&lhs, &rhs, |a, b| {
                if b == 0.0 {
                    Err(ErrorKind::DivZero)
                } else {
                    Ok(a / b)
                }
            }),
            BinaryOperator::Power => self.numeric_op(&lhs, &rhs, |a, b| {
                let result = a.powf(b);
                if result.is_finite() {
                    Ok(result)
                } else {
                    Err(ErrorKind::Num)
                }
            }),
            BinaryOperator::Concat => EvalValue::Scalar(CellValue::Text(format!(
                "{}{}",
                lhs.as_text(),
                rhs.as_text()
            ))),
            BinaryOperator::Equal => {
                EvalValue::Scalar(CellValue::Boolean(self.values_equal(&lhs, &rhs)))
            }
            BinaryOperator::NotEqual => {
                EvalValue::Scalar(CellValue::Boolean(!self.values_equal(&lhs, &rhs)))
            }
            BinaryOperator::LessThan => self.ordering_op(&lhs, &rhs, |ord| ord.is_lt()),
            BinaryOperator::GreaterThan => self.ordering_op(&lhs, &rhs, |ord| ord.is_gt()),
            BinaryOperator::LessEqual => self.ordering_op(&lhs, &rhs, |ord| ord.is_le()),
            BinaryOperator::GreaterEqual => self.ordering_op(&lhs, &rhs, |ord| ord.is_ge()),
        }
    }

    fn eval_unary_op(&self, op: UnaryOperator, operand: &Expression) -> EvalValue {
        let value = self.evaluate(operand).into_scalar();
        if let CellValue::Error(kind) = value {
            return EvalValue::error(kind);
        }
        let Some(n) = value.as_number() else {
            return EvalValue::error(ErrorKind::Value);
        };
        match op {
            UnaryOperator::Negate => EvalValue::Scalar(CellValue::Number(-n)),
            UnaryOperator::Plus => EvalValue::Scalar(CellValue::Number(n)),
        }
    }

    fn numeric_op<F>(&self, lhs: &CellValue, rhs: &CellValue, f: F) -> EvalValue
    where
        F: Fn(f64, f64) -> Result<f64, ErrorKind>,
    {
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            return EvalValue::error(ErrorKind::Value);
        };
        match f(a, b) {
            Ok(n) => EvalValue::Scalar(CellValue::Number(n)),
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn ordering_op<F>(&self, lhs: &CellValue, rhs: &CellValue, accept: F) -> EvalValue
    where
        F: Fn(std::cmp::Ordering) -> bool,
    {
        match self.compare_values(lhs, rhs) {
            Some(ordering) => EvalValue::Scalar(CellValue::Boolean(accept(ordering))),
            None => EvalValue::error(ErrorKind::Value),
        }
    }

    /// Equality with the configured string case handling and numeric
    /// epsilon. Empty coerces to the other side's zero value.
    fn values_equal(&self, lhs: &CellValue, rhs: &CellValue) -> bool {
        match (lhs, rhs) {
            (CellValue::Number(a), CellValue::Number(b)) => self.numbers_equal(*a, *b),
            (CellValue::Text(a), CellValue::Text(b)) => {
                if self.ctx.config.case_sensitive {
                    a == b
                } else {
                    a.to_uppercase() == b.to_uppercase()
                }
            }
            (CellValue::Boolean(a), CellValue::Boolean(b)) => a == b,
            (CellValue::Empty, CellValue::Empty) => true,
            (CellValue::Empty, other) | (other, CellValue::Empty) => match other {
                CellValue::Number(n) => self.numbers_equal(*n, 0.0),
                CellValue::Text(s) => s.is_empty(),
                CellValue::Boolean(b) => !b,
                _ => false,
            },
            _ => false,
        }
    }

    fn numbers_equal(&self, a: f64, b: f64) -> bool {
        if !self.ctx.config.smart_rounding {
            return a == b;
        }
        if a == b {
            return true;
        }
        let scale = a.abs().max(b.abs());
        (a - b).abs() <= SMART_EPSILON * scale.max(1.0)
    }

    /// Ordering across the value domain: numbers sort below text, text
    /// below booleans (the spreadsheet convention). Empty compares as 0 /
    /// the empty string.
    fn compare_values(&self, lhs: &CellValue, rhs: &CellValue) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;

        fn class(value: &CellValue) -> u8 {
            match value {
                CellValue::Empty | CellValue::Number(_) => 0,
                CellValue::Text(_) => 1,
                CellValue::Boolean(_) => 2,
                CellValue::Error(_) => 3,
            }
        }

        if matches!(lhs, CellValue::Error(_)) || matches!(rhs, CellValue::Error(_)) {
            return None;
        }
        let (cl, cr) = (class(lhs), class(rhs));
        if cl != cr {
            return Some(cl.cmp(&cr));
        }
        match (lhs, rhs) {
            (CellValue::Text(a), CellValue::Text(b)) => {
                if self.ctx.config.case_sensitive {
                    Some(a.cmp(b))
                } else {
                    Some(a.to_uppercase().cmp(&b.to_uppercase()))
                }
            }
            (CellValue::Boolean(a), CellValue::Boolean(b)) => Some(a.cmp(b)),
            _ => {
                let a = lhs.as_number().unwrap_or(0.0);
                let b = rhs.as_number().unwrap_or(0.0);
                if self.numbers_equal(a, b) {
                    Some(Ordering::Equal)
                } else {
                    a.partial_cmp(&b)
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    fn eval_function(&self, name: &str, args: &[Expression]) -> EvalValue {
        match name {
            "SUM" => self.fold_numbers(args, 0.0, |acc, n| acc + n),
            "AVERAGE" => self.eval_average(args),
            "MIN" => self.eval_min_max(args, true),
            "MAX" => self.eval_min_max(args, false),
            "COUNT" => self.eval_count(args, false),
            "COUNTA" => self.eval_count(args, true),
            "MEDIAN" => self.eval_median(args),
            "IF" => self.eval_if(args),
            "AND" => self.eval_and_or(args, true),
            "OR" => self.eval_and_or(args, false),
            "NOT" => self.eval_not(args),
            "TRUE" => EvalValue::Scalar(CellValue::Boolean(true)),
            "FALSE" => EvalValue::Scalar(CellValue::Boolean(false)),
            "ABS" => self.unary_numeric(args, |n| Ok(n.abs())),
            "SQRT" => self.unary_numeric(args, |n| {
                if n < 0.0 {
                    Err(ErrorKind::Num)
                } else {
                    Ok(n.sqrt())
                }
            }),
            "ROUND" => self.eval_round(args),
            "POWER" => self.binary_numeric(args, |a, b| {
                let result = a.powf(b);
                if result.is_finite() {
                    Ok(result)
                } else {
                    Err(ErrorKind::Num)
                }
            }),
            "MOD" => self.binary_numeric(args, |a, b| {
                if b == 0.0 {
                    Err(ErrorKind::DivZero)
                } else {
                    Ok(a - b * (a / b).floor())
                }
            }),
            "LEN" => self.unary_text(args, |s| CellValue::Number(s.chars().count() as f64)),
            "UPPER" => self.unary_text(args, |s| CellValue::Text(s.to_uppercase())),
            "LOWER" => self.unary_text(args, |s| CellValue::Text(s.to_lowercase())),
            "TRIM" => self.unary_text(args, |s| CellValue::Text(s.trim().to_string())),
            "CONCATENATE" => self.eval_concatenate(args),
            "ISERROR" => self.eval_is_error(args),
            "ISBLANK" => self.eval_is_blank(args),
            "MMULT" => self.eval_mmult(args),
            "TRANSPOSE" => self.eval_transpose(args),
            "RAND" => self.eval_rand(args),
            "NOW" => EvalValue::Scalar(CellValue::Number(now_serial())),
            "TODAY" => EvalValue::Scalar(CellValue::Number(now_serial().floor())),
            "ROW" => self.eval_row_col(args, true),
            "COLUMN" => self.eval_row_col(args, false),
            "ROWS" => self.eval_dims(args, true),
            "COLUMNS" => self.eval_dims(args, false),
            _ => EvalValue::error(ErrorKind::Name),
        }
    }

    /// Collects the numeric contents of arguments the way aggregate
    /// functions see them: range cells contribute only numbers, direct
    /// arguments are coerced, errors propagate.
    fn collect_numbers(&self, args: &[Expression]) -> Result<Vec<f64>, ErrorKind> {
        let mut numbers = Vec::new();
        for arg in args {
            if matches!(arg, Expression::EmptyArg) {
                continue;
            }
            match self.evaluate(arg) {
                EvalValue::Array(rows) => {
                    for value in rows.into_iter().flatten() {
                        match value {
                            CellValue::Number(n) => numbers.push(n),
                            CellValue::Error(kind) => return Err(kind),
                            _ => {}
                        }
                    }
                }
                EvalValue::Scalar(value) => match value {
                    CellValue::Error(kind) => return Err(kind),
                    CellValue::Empty => {}
                    other => match other.as_number() {
                        Some(n) => numbers.push(n),
                        None => return Err(ErrorKind::Value),
                    },
                },
            }
        }
        Ok(numbers)
    }

    fn fold_numbers<F>(&self, args: &[Expression], init: f64, f: F) -> EvalValue
    where
        F: Fn(f64, f64) -> f64,
    {
        match self.collect_numbers(args) {
            Ok(numbers) => {
                EvalValue::Scalar(CellValue::Number(numbers.into_iter().fold(init, f)))
            }
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn eval_average(&self, args: &[Expression]) -> EvalValue {
        match self.collect_numbers(args) {
            Ok(numbers) if numbers.is_empty() => EvalValue::error(ErrorKind::DivZero),
            Ok(numbers) => {
                let count = numbers.len() as f64;
                let sum: f64 = numbers.into_iter().sum();
                EvalValue::Scalar(CellValue::Number(sum / count))
            }
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn eval_min_max(&self, args: &[Expression], minimum: bool) -> EvalValue {
        match self.collect_numbers(args) {
            Ok(numbers) => {
                let result = numbers
                    .into_iter()
                    .reduce(|a, b| if minimum { a.min(b) } else { a.max(b) })
                    .unwrap_or(0.0);
                EvalValue::Scalar(CellValue::Number(result))
            }
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn eval_median(&self, args: &[Expression]) -> EvalValue {
        match self.collect_numbers(args) {
            Ok(numbers) if numbers.is_empty() => EvalValue::error(ErrorKind::Num),
            Ok(mut numbers) => {
                numbers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = numbers.len() / 2;
                let median = if numbers.len() % 2 == 1 {
                    numbers[mid]
                } else {
                    (numbers[mid - 1] + numbers[mid]) / 2.0
                };
                EvalValue::Scalar(CellValue::Number(median))
            }
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn eval_count(&self, args: &[Expression], count_any: bool) -> EvalValue {
        let mut count = 0u32;
        for arg in args {
            if matches!(arg, Expression::EmptyArg) {
                continue;
            }
            for value in self.evaluate(arg).flatten() {
                let counted = if count_any {
                    !value.is_empty()
                } else {
                    matches!(value, CellValue::Number(_))
                };
                if counted {
                    count += 1;
                }
            }
        }
        EvalValue::Scalar(CellValue::Number(count as f64))
    }

    fn eval_if(&self, args: &[Expression]) -> EvalValue {
        if args.is_empty() || args.len() > 3 {
            return EvalValue::error(ErrorKind::Value);
        }
        let condition = self.evaluate(&args[0]).into_scalar();
        let truthy = match condition {
            CellValue::Error(kind) => return EvalValue::error(kind),
            CellValue::Boolean(b) => b,
            CellValue::Number(n) => n != 0.0,
            CellValue::Empty => false,
            CellValue::Text(_) => return EvalValue::error(ErrorKind::Value),
        };
        if truthy {
            match args.get(1) {
                Some(expr) => self.evaluate(expr),
                None => EvalValue::Scalar(CellValue::Boolean(true)),
            }
        } else {
            match args.get(2) {
                Some(expr) => self.evaluate(expr),
                None => EvalValue::Scalar(CellValue::Boolean(false)),
            }
        }
    }

    fn eval_and_or(&self, args: &[Expression], conjunction: bool) -> EvalValue {
        let mut seen = false;
        let mut acc = conjunction;
        for arg in args {
            if matches!(arg, Expression::EmptyArg) {
                continue;
            }
            for value in self.evaluate(arg).flatten() {
                let truthy = match value {
                    CellValue::Error(kind) => return EvalValue::error(kind),
                    CellValue::Boolean(b) => b,
                    CellValue::Number(n) => n != 0.0,
                    CellValue::Empty => continue,
                    CellValue::Text(_) => return EvalValue::error(ErrorKind::Value),
                };
                seen = true;
                if conjunction {
                    acc = acc && truthy;
                } else {
                    acc = acc || truthy;
                }
            }
        }
        if !seen {
            return EvalValue::error(ErrorKind::Value);
        }
        EvalValue::Scalar(CellValue::Boolean(acc))
    }

    fn eval_not(&self, args: &[Expression]) -> EvalValue {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        match self.evaluate(&args[0]).into_scalar() {
            CellValue::Error(kind) => EvalValue::error(kind),
            CellValue::Boolean(b) => EvalValue::Scalar(CellValue::Boolean(!b)),
            CellValue::Number(n) => EvalValue::Scalar(CellValue::Boolean(n == 0.0)),
            CellValue::Empty => EvalValue::Scalar(CellValue::Boolean(true)),
            CellValue::Text(_) => EvalValue::error(ErrorKind::Value),
        }
    }

    fn unary_numeric<F>(&self, args: &[Expression], f: F) -> EvalValue
    where
        F: Fn(f64) -> Result<f64, ErrorKind>,
    {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        let value = self.evaluate(&args[0]).into_scalar();
        if let CellValue::Error(kind) = value {
            return EvalValue::error(kind);
        }
        let Some(n) = value.as_number() else {
            return EvalValue::error(ErrorKind::Value);
        };
        match f(n) {
            Ok(result) => EvalValue::Scalar(CellValue::Number(result)),
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn binary_numeric<F>(&self, args: &[Expression], f: F) -> EvalValue
    where
        F: Fn(f64, f64) -> Result<f64, ErrorKind>,
    {
        if args.len() != 2 {
            return EvalValue::error(ErrorKind::Value);
        }
        let lhs = self.evaluate(&args[0]).into_scalar();
        if let CellValue::Error(kind) = lhs {
            return EvalValue::error(kind);
        }
        let rhs = self.evaluate(&args[1]).into_scalar();
        if let CellValue::Error(kind) = rhs {
            return EvalValue::error(kind);
        }
        let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) else {
            return EvalValue::error(ErrorKind::Value);
        };
        match f(a, b) {
            Ok(result) => EvalValue::Scalar(CellValue::Number(result)),
            Err(kind) => EvalValue::error(kind),
        }
    }

    fn eval_round(&self, args: &[Expression]) -> EvalValue {
        if args.is_empty() || args.len() > 2 {
            return EvalValue::error(ErrorKind::Value);
        }
        let value = self.evaluate(&args[0]).into_scalar();
        if let CellValue::Error(kind) = value {
            return EvalValue::error(kind);
        }
        let Some(n) = value.as_number() else {
            return EvalValue::error(ErrorKind::Value);
        };
        let digits = match args.get(1) {
            None | Some(Expression::EmptyArg) => 0.0,
            Some(expr) => {
                let value = self.evaluate(expr).into_scalar();
                if let CellValue::Error(kind) = value {
                    return EvalValue::error(kind);
                }
                match value.as_number() {
                    Some(d) => d.trunc(),
                    None => return EvalValue::error(ErrorKind::Value),
                }
            }
        };
        let factor = 10f64.powi(digits as i32);
        EvalValue::Scalar(CellValue::Number((n * factor).round() / factor))
    }

    fn unary_text<F>(&self, args: &[Expression], f: F) -> EvalValue
    where
        F: Fn(&str) -> CellValue,
    {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        let value = self.evaluate(&args[0]).into_scalar();
        if let CellValue::Error(kind) = value {
            return EvalValue::error(kind);
        }
        EvalValue::Scalar(f(&value.as_text()))
    }

    fn eval_concatenate(&self, args: &[Expression]) -> EvalValue {
        let mut result = String::new();
        for arg in args {
            if matches!(arg, Expression::EmptyArg) {
                continue;
            }
            for value in self.evaluate(arg).flatten() {
                if let CellValue::Error(kind) = value {
                    return EvalValue::error(kind);
                }
                result.push_str(&value.as_text());
            }
        }
        EvalValue::Scalar(CellValue::Text(result))
    }

    fn eval_is_error(&self, args: &[Expression]) -> EvalValue {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        let is_error = self.evaluate(&args[0]).into_scalar().is_error();
        EvalValue::Scalar(CellValue::Boolean(is_error))
    }

    fn eval_is_blank(&self, args: &[Expression]) -> EvalValue {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        let is_blank = self.evaluate(&args[0]).into_scalar().is_empty();
        EvalValue::Scalar(CellValue::Boolean(is_blank))
    }

    // ------------------------------------------------------------------
    // Array functions
    // ------------------------------------------------------------------

    /// Shapes an argument into a numeric matrix for MMULT/TRANSPOSE.
    fn numeric_matrix(&self, arg: &Expression) -> Result<Vec<Vec<f64>>, ErrorKind> {
        let rows = match self.evaluate(arg) {
            EvalValue::Array(rows) => rows,
            EvalValue::Scalar(value) => vec![vec![value]],
        };
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let mut numbers = Vec::with_capacity(row.len());
            for value in row {
                match value {
                    CellValue::Error(kind) => return Err(kind),
                    other => match other.as_number() {
                        Some(n) => numbers.push(n),
                        None => return Err(ErrorKind::Value),
                    },
                }
            }
            result.push(numbers);
        }
        Ok(result)
    }

    fn eval_mmult(&self, args: &[Expression]) -> EvalValue {
        if args.len() != 2 {
            return EvalValue::error(ErrorKind::Value);
        }
        let a = match self.numeric_matrix(&args[0]) {
            Ok(matrix) => matrix,
            Err(kind) => return EvalValue::error(kind),
        };
        let b = match self.numeric_matrix(&args[1]) {
            Ok(matrix) => matrix,
            Err(kind) => return EvalValue::error(kind),
        };
        let inner = a.first().map(|row| row.len()).unwrap_or(0);
        if inner == 0 || b.len() != inner || a.iter().any(|row| row.len() != inner) {
            return EvalValue::error(ErrorKind::Value);
        }
        let width = b.first().map(|row| row.len()).unwrap_or(0);
        if width == 0 || b.iter().any(|row| row.len() != width) {
            return EvalValue::error(ErrorKind::Value);
        }

        let mut result = vec![vec![CellValue::Empty; width]; a.len()];
        for (i, row) in a.iter().enumerate() {
            for j in 0..width {
                let mut sum = 0.0;
                for (k, &value) in row.iter().enumerate() {
                    sum += value * b[k][j];
                }
                result[i][j] = CellValue::Number(sum);
            }
        }
        EvalValue::Array(result)
    }

    fn eval_transpose(&self, args: &[Expression]) -> EvalValue {
        if args.len() != 1 {
            return EvalValue::error(ErrorKind::Value);
        }
        let rows = match self.evaluate(&args[0]) {
            EvalValue::Array(rows) => rows,
            EvalValue::Scalar(value) => vec![vec![value]],
        };
        let height = rows.len();
        let width = rows.first().map(|row| row.len()).unwrap_or(0);
        if width == 0 || rows.iter().any(|row| row.len() != width) {
            return EvalValue::error(ErrorKind::Value);
        }
        let mut result = vec![vec![CellValue::Empty; height]; width];
        for (r, row) in rows.into_iter().enumerate() {
            for (c, value) in row.into_iter().enumerate() {
                result[c][r] = value;
            }
        }
        EvalValue::Array(result)
    }

    // ------------------------------------------------------------------
    // Volatile and structure-sensitive functions
    // ------------------------------------------------------------------

    fn eval_rand(&self, args: &[Expression]) -> EvalValue {
        if !args.is_empty() {
            return EvalValue::error(ErrorKind::Value);
        }
        // Deterministic LCG over engine-owned state: identical edit
        // sequences reproduce identical values.
        let state = self
            .ctx
            .rand_state
            .get()
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.ctx.rand_state.set(state);
        let fraction = (state >> 11) as f64 / (1u64 << 53) as f64;
        EvalValue::Scalar(CellValue::Number(fraction))
    }

    fn eval_row_col(&self, args: &[Expression], row: bool) -> EvalValue {
        let index = match args {
            [] => {
                if row {
                    self.ctx.anchor.row
                } else {
                    self.ctx.anchor.col
                }
            }
            [Expression::CellReference { operand }] => match self.ctx.operands.get(*operand) {
                Some(BoundOperand::Cell(r)) => {
                    if row {
                        r.row
                    } else {
                        r.col
                    }
                }
                _ => return EvalValue::error(ErrorKind::Ref),
            },
            [Expression::RangeReference { operand }] => match self.ctx.operands.get(*operand) {
                Some(op @ BoundOperand::Range(..)) => {
                    let rect = op.range().expect("range operand");
                    if row {
                        rect.start_row
                    } else {
                        rect.start_col
                    }
                }
                _ => return EvalValue::error(ErrorKind::Ref),
            },
            _ => return EvalValue::error(ErrorKind::Value),
        };
        // Written coordinates are 1-based.
        EvalValue::Scalar(CellValue::Number(index as f64 + 1.0))
    }

    fn eval_dims(&self, args: &[Expression], rows: bool) -> EvalValue {
        match args {
            [Expression::RangeReference { operand }] => match self.ctx.operands.get(*operand) {
                Some(op @ BoundOperand::Range(..)) => {
                    let rect = op.range().expect("range operand");
                    let dim = if rows { rect.height() } else { rect.width() };
                    EvalValue::Scalar(CellValue::Number(dim as f64))
                }
                _ => EvalValue::error(ErrorKind::Ref),
            },
            [Expression::CellReference { .. }] => EvalValue::Scalar(CellValue::Number(1.0)),
            _ => EvalValue::error(ErrorKind::Value),
        }
    }
}

/// Spreadsheet date serial for the current instant: days since 1899-12-30.
fn now_serial() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 / 86_400.0 + 25_569.0
}

/// Rounds near-integer write-back values to the configured decimal places.
pub fn apply_precision(config: &EngineConfig, value: CellValue) -> CellValue {
    match value {
        CellValue::Number(n) if n.is_finite() && n.abs() < 1e15 => {
            let factor = 10f64.powi(config.precision_rounding as i32);
            CellValue::Number((n * factor).round() / factor)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vertex::BoundRef;

    fn scalar(value: &EvalValue) -> CellValue {
        value.clone().into_scalar()
    }

    struct Fixture {
        graph: DependencyGraph,
        config: EngineConfig,
        operands: Vec<BoundOperand>,
        rand_state: Cell<u64>,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                graph: DependencyGraph::new(),
                config: EngineConfig::default(),
                operands: Vec::new(),
                rand_state: Cell::new(42),
            }
        }

        fn with_cells(cells: &[((u32, u32), CellValue)]) -> Self {
            let mut fixture = Self::new();
            for ((col, row), value) in cells {
                fixture
                    .graph
                    .set_value_to_cell(CellAddress::new(0, *col, *row), value.clone())
                    .unwrap();
            }
            fixture
        }

        fn cell_operand(&mut self, col: u32, row: u32) -> usize {
            self.operands.push(BoundOperand::Cell(BoundRef {
                sheet: 0,
                col,
                row,
                col_abs: false,
                row_abs: false,
            }));
            self.operands.len() - 1
        }

        fn range_operand(&mut self, c1: u32, r1: u32, c2: u32, r2: u32) -> usize {
            self.operands.push(BoundOperand::Range(
                BoundRef {
                    sheet: 0,
                    col: c1,
                    row: r1,
                    col_abs: false,
                    row_abs: false,
                },
                BoundRef {
                    sheet: 0,
                    col: c2,
                    row: r2,
                    col_abs: false,
                    row_abs: false,
                },
            ));
            self.operands.len() - 1
        }

        fn eval(&self, expr: &Expression) -> EvalValue {
            let interpreter = Interpreter::new(FormulaContext {
                graph: &self.graph,
                config: &self.config,
                operands: &self.operands,
                anchor: CellAddress::new(0, 0, 0),
                rand_state: &self.rand_state,
            });
            interpreter.evaluate(expr)
        }
    }

    fn call(name: &str, args: Vec<Expression>) -> Expression {
        Expression::FunctionCall {
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn arithmetic_and_coercion() {
        let fixture = Fixture::new();
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::Number(1.0)),
            op: BinaryOperator::Add,
            right: Box::new(Expression::String("2".to_string())),
        };
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Number(3.0));
    }

    #[test]
    fn division_by_zero_is_an_error_value() {
        let fixture = Fixture::new();
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::Number(1.0)),
            op: BinaryOperator::Divide,
            right: Box::new(Expression::Number(0.0)),
        };
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::DivZero)
        );
    }

    #[test]
    fn empty_cell_is_zero_in_arithmetic() {
        let mut fixture = Fixture::new();
        let operand = fixture.cell_operand(0, 5);
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::CellReference { operand }),
            op: BinaryOperator::Add,
            right: Box::new(Expression::Number(2.0)),
        };
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Number(2.0));
    }

    #[test]
    fn empty_cell_is_empty_string_in_concat() {
        let mut fixture = Fixture::new();
        let operand = fixture.cell_operand(0, 5);
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::CellReference { operand }),
            op: BinaryOperator::Concat,
            right: Box::new(Expression::String("x".to_string())),
        };
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Text("x".to_string())
        );
    }

    #[test]
    fn sum_over_range_skips_text() {
        let mut fixture = Fixture::with_cells(&[
            ((0, 0), CellValue::Number(1.0)),
            ((0, 1), CellValue::Text("skip".to_string())),
            ((0, 2), CellValue::Number(2.5)),
        ]);
        let operand = fixture.range_operand(0, 0, 0, 2);
        let expr = call("SUM", vec![Expression::RangeReference { operand }]);
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Number(3.5));
    }

    #[test]
    fn sum_propagates_errors_from_range() {
        let mut fixture = Fixture::with_cells(&[
            ((0, 0), CellValue::Number(1.0)),
            ((0, 1), CellValue::Error(ErrorKind::Ref)),
        ]);
        let operand = fixture.range_operand(0, 0, 0, 1);
        let expr = call("SUM", vec![Expression::RangeReference { operand }]);
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::Ref)
        );
    }

    #[test]
    fn average_of_nothing_is_div_zero() {
        let fixture = Fixture::new();
        let expr = call("AVERAGE", vec![]);
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::DivZero)
        );
    }

    #[test]
    fn if_with_defaults() {
        let fixture = Fixture::new();
        let expr = call(
            "IF",
            vec![
                Expression::Boolean(true),
                Expression::String("yes".to_string()),
                Expression::String("no".to_string()),
            ],
        );
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Text("yes".to_string())
        );

        let expr = call("IF", vec![Expression::Boolean(false)]);
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Boolean(false));
    }

    #[test]
    fn unknown_function_is_name_error() {
        let fixture = Fixture::new();
        let expr = call("FROBNICATE", vec![Expression::Number(1.0)]);
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::Name)
        );
    }

    #[test]
    fn sqrt_of_negative_is_num_error() {
        let fixture = Fixture::new();
        let expr = call(
            "SQRT",
            vec![Expression::UnaryOp {
                op: UnaryOperator::Negate,
                operand: Box::new(Expression::Number(1.0)),
            }],
        );
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::Num)
        );
    }

    #[test]
    fn string_equality_honors_case_config() {
        let mut fixture = Fixture::new();
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::String("abc".to_string())),
            op: BinaryOperator::Equal,
            right: Box::new(Expression::String("ABC".to_string())),
        };
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Boolean(true));

        fixture.config.case_sensitive = true;
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Boolean(false));
    }

    #[test]
    fn smart_rounding_compares_with_epsilon() {
        let mut fixture = Fixture::new();
        let expr = Expression::BinaryOp {
            left: Box::new(Expression::BinaryOp {
                left: Box::new(Expression::Number(0.1)),
                op: BinaryOperator::Add,
                right: Box::new(Expression::Number(0.2)),
            }),
            op: BinaryOperator::Equal,
            right: Box::new(Expression::Number(0.3)),
        };
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Boolean(true));

        fixture.config.smart_rounding = false;
        assert_eq!(scalar(&fixture.eval(&expr)), CellValue::Boolean(false));
    }

    #[test]
    fn mmult_produces_shaped_array() {
        let mut fixture = Fixture::with_cells(&[
            ((0, 0), CellValue::Number(1.0)),
            ((1, 0), CellValue::Number(2.0)),
            ((0, 1), CellValue::Number(3.0)),
            ((1, 1), CellValue::Number(4.0)),
            ((2, 0), CellValue::Number(1.0)),
            ((3, 0), CellValue::Number(0.0)),
            ((2, 1), CellValue::Number(0.0)),
            ((3, 1), CellValue::Number(1.0)),
        ]);
        let a = fixture.range_operand(0, 0, 1, 1);
        let b = fixture.range_operand(2, 0, 3, 1);
        let expr = call(
            "MMULT",
            vec![
                Expression::RangeReference { operand: a },
                Expression::RangeReference { operand: b },
            ],
        );
        assert_eq!(
            fixture.eval(&expr),
            EvalValue::Array(vec![
                vec![CellValue::Number(1.0), CellValue::Number(2.0)],
                vec![CellValue::Number(3.0), CellValue::Number(4.0)],
            ])
        );
    }

    #[test]
    fn mmult_dimension_mismatch_is_value_error() {
        let mut fixture = Fixture::with_cells(&[
            ((0, 0), CellValue::Number(1.0)),
            ((0, 1), CellValue::Number(2.0)),
            ((1, 0), CellValue::Number(3.0)),
            ((1, 1), CellValue::Number(4.0)),
            ((2, 0), CellValue::Number(5.0)),
        ]);
        let a = fixture.range_operand(0, 0, 1, 1); // 2x2
        let b = fixture.range_operand(2, 0, 2, 0); // 1x1
        let expr = call(
            "MMULT",
            vec![
                Expression::RangeReference { operand: a },
                Expression::RangeReference { operand: b },
            ],
        );
        assert_eq!(
            scalar(&fixture.eval(&expr)),
            CellValue::Error(ErrorKind::Value)
        );
    }

    #[test]
    fn transpose_flips_dimensions() {
        let mut fixture = Fixture::with_cells(&[
            ((0, 0), CellValue::Number(1.0)),
            ((1, 0), CellValue::Number(2.0)),
        ]);
        let operand = fixture.range_operand(0, 0, 1, 0);
        let expr = call("TRANSPOSE", vec![Expression::RangeReference { operand }]);
        assert_eq!(
            fixture.eval(&expr),
            EvalValue::Array(vec![
                vec![CellValue::Number(1.0)],
                vec![CellValue::Number(2.0)],
            ])
        );
    }

    #[test]
    fn rand_is_deterministic_per_state() {
        let fixture = Fixture::new();
        let expr = call("RAND", vec![]);
        let first = scalar(&fixture.eval(&expr));
        let second = scalar(&fixture.eval(&expr));
        assert_ne!(first, second);
        match (first, second) {
            (CellValue::Number(a), CellValue::Number(b)) => {
                assert!((0.0..1.0).contains(&a));
                assert!((0.0..1.0).contains(&b));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Same seed, same sequence.
        let replay = Fixture::new();
        let replay_first = scalar(&replay.eval(&expr));
        assert_eq!(
            replay_first,
            scalar(&Fixture::new().eval(&expr))
        );
    }

    #[test]
    fn row_and_column_report_one_based_coordinates() {
        let mut fixture = Fixture::new();
        let operand = fixture.cell_operand(3, 7);
        assert_eq!(
            scalar(&fixture.eval(&call("ROW", vec![Expression::CellReference { operand }]))),
            CellValue::Number(8.0)
        );
        assert_eq!(
            scalar(&fixture.eval(&call("COLUMN", vec![Expression::CellReference { operand }]))),
            CellValue::Number(4.0)
        );
        // Without arguments they report the anchor (A1 in the fixture).
        assert_eq!(
            scalar(&fixture.eval(&call("ROW", vec![]))),
            CellValue::Number(1.0)
        );
    }

    #[test]
    fn precision_rounding_write_back() {
        let config = EngineConfig::default();
        match apply_precision(&config, CellValue::Number(0.1 + 0.2)) {
            CellValue::Number(n) => assert_eq!(n, 0.3),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parse_error_node_resolves_to_parse_error() {
        let fixture = Fixture::new();
        assert_eq!(
            scalar(&fixture.eval(&Expression::Error(AstError::Parse))),
            CellValue::Error(ErrorKind::Parse)
        );
        assert_eq!(
            scalar(&fixture.eval(&Expression::Error(AstError::Ref))),
            CellValue::Error(ErrorKind::Ref)
        );
    }
}
