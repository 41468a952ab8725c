//! FILENAME: core/engine/src/content.rs
//! PURPOSE: Classifies raw cell text at ingestion.
//! CONTEXT: A string starting with '=' is a formula; "{=...}" is an array
//! formula; otherwise-numeric text becomes a numeric value; the empty
//! string deletes the cell; everything else is a string value.

/// The interpretation of one raw cell string.
#[derive(Debug, Clone, PartialEq)]
pub enum CellContent {
    /// Empty input: delete the cell.
    Empty,
    Number(f64),
    Text(String),
    /// Formula text including the leading '='.
    Formula(String),
    /// The inner formula of an array formula, '=' included, braces stripped.
    MatrixFormula(String),
}

/// Applies the ingestion grammar to one cell string.
pub fn parse_cell_content(raw: &str) -> CellContent {
    if raw.is_empty() {
        return CellContent::Empty;
    }

    if let Some(inner) = raw.strip_prefix("{=").and_then(|rest| rest.strip_suffix('}')) {
        return CellContent::MatrixFormula(format!("={}", inner));
    }

    if raw.starts_with('=') {
        return CellContent::Formula(raw.to_string());
    }

    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        if let Ok(number) = trimmed.parse::<f64>() {
            // "inf"/"NaN" parse as floats but are not numeric cell text.
            if number.is_finite()
                && trimmed
                    .chars()
                    .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
            {
                return CellContent::Number(number);
            }
        }
    }

    CellContent::Text(raw.to_string())
}
