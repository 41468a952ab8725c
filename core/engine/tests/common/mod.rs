//! FILENAME: tests/common/mod.rs
//! Test harness and fixtures for engine integration tests.

// Each integration binary compiles its own copy of this module and uses a
// different subset of the helpers.
#![allow(dead_code)]

use engine::{CellAddress, CellValue, Engine};

/// Builds a one-sheet engine from string rows.
pub fn build(rows: &[&[&str]]) -> Engine {
    Engine::from_sheet(to_rows(rows)).expect("engine builds")
}

/// Converts borrowed test fixtures into owned sheet rows.
pub fn to_rows(rows: &[&[&str]]) -> Vec<Vec<String>> {
    rows.iter()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect()
}

/// The numeric value at an A1 address; panics on anything else.
pub fn num(engine: &Engine, address: &str) -> f64 {
    match engine.cell_value(address).expect("valid address") {
        CellValue::Number(n) => n,
        other => panic!("{} is not a number: {:?}", address, other),
    }
}

/// Sets a cell by A1 address on sheet 0.
pub fn set(engine: &mut Engine, address: &str, content: &str) {
    let addr = engine.parse_address(address).expect("valid address");
    engine.set_cell_content(addr, content).expect("content applies");
}

/// Shorthand for building absolute addresses in assertions.
pub fn addr(sheet: u32, col: u32, row: u32) -> CellAddress {
    CellAddress::new(sheet, col, row)
}
