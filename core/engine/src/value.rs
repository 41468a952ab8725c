//! FILENAME: core/engine/src/value.rs
//! PURPOSE: Defines the value domain of the engine.
//! CONTEXT: Every cell resolves to a CellValue. Errors are values, never
//! thrown signals: a formula that divides by zero stores Error(DivZero) in
//! its cell like any other result, and consumers see that value.

use serde::{Deserialize, Serialize};

/// Typed error values a cell can hold (e.g. #DIV/0!).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Division by zero.
    DivZero,
    /// Unknown function or named range.
    Name,
    /// Argument type mismatch in a function.
    Value,
    /// Reference dangles (a structural operation removed its target).
    Ref,
    /// Numeric domain error (e.g. square root of a negative number).
    Num,
    /// Explicit "no value".
    Na,
    /// The cell sits on a detected dependency cycle.
    Cycle,
    /// The formula did not tokenize or parse.
    Parse,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            ErrorKind::DivZero => "#DIV/0!",
            ErrorKind::Name => "#NAME?",
            ErrorKind::Value => "#VALUE!",
            ErrorKind::Ref => "#REF!",
            ErrorKind::Num => "#NUM!",
            ErrorKind::Na => "#N/A",
            ErrorKind::Cycle => "#CYCLE!",
            ErrorKind::Parse => "#ERROR!",
        };
        write!(f, "{}", code)
    }
}

/// The calculated result or raw data within a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
    Boolean(bool),
    Error(ErrorKind),
}

impl CellValue {
    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, CellValue::Error(_))
    }

    /// Returns true for the empty value.
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Attempts to coerce the value to a number.
    /// Empty counts as 0; booleans as 0/1; text parses if numeric.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Empty => Some(0.0),
            CellValue::Number(n) => Some(*n),
            CellValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            CellValue::Text(s) => s.trim().parse::<f64>().ok(),
            CellValue::Error(_) => None,
        }
    }

    /// Converts the value to its display text.
    pub fn as_text(&self) -> String {
        match self {
            CellValue::Empty => String::new(),
            CellValue::Number(n) => {
                // Format without unnecessary decimal places
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    format!("{}", n)
                }
            }
            CellValue::Text(s) => s.clone(),
            CellValue::Boolean(b) => {
                if *b {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            CellValue::Error(e) => e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_display() {
        assert_eq!(CellValue::Error(ErrorKind::DivZero).as_text(), "#DIV/0!");
        assert_eq!(CellValue::Error(ErrorKind::Cycle).as_text(), "#CYCLE!");
        assert_eq!(CellValue::Error(ErrorKind::Ref).as_text(), "#REF!");
    }

    #[test]
    fn number_coercion() {
        assert_eq!(CellValue::Empty.as_number(), Some(0.0));
        assert_eq!(CellValue::Boolean(true).as_number(), Some(1.0));
        assert_eq!(CellValue::Text(" 4.5 ".to_string()).as_number(), Some(4.5));
        assert_eq!(CellValue::Text("abc".to_string()).as_number(), None);
        assert_eq!(CellValue::Error(ErrorKind::Value).as_number(), None);
    }

    #[test]
    fn text_rendering_trims_integer_decimals() {
        assert_eq!(CellValue::Number(44.0).as_text(), "44");
        assert_eq!(CellValue::Number(4.25).as_text(), "4.25");
    }
}
