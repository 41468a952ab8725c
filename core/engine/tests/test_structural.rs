//! FILENAME: tests/test_structural.rs
//! Structural operations through the public surface: row/column
//! insertion and removal, block moves, and the lazy transformation queue.

mod common;

use common::{addr, build, num, set};
use engine::{CellRange, CellValue, ErrorKind};
use pretty_assertions::assert_eq;

#[test]
fn add_rows_keeps_values_consistent() {
    let mut engine = build(&[
        &["1", "=A1*10"],
        &["2", "=A2*10"],
        &["=A1+A2", "=SUM(B1:B2)"],
    ]);
    assert_eq!(num(&engine, "A3"), 3.0);
    assert_eq!(num(&engine, "B3"), 30.0);

    engine.add_rows(0, 2, 3).unwrap();
    // The summary row moved down; every value survives unchanged.
    assert_eq!(num(&engine, "A6"), 3.0);
    assert_eq!(num(&engine, "B6"), 30.0);

    // Edits through the stretched layout still propagate.
    set(&mut engine, "A1", "5");
    assert_eq!(num(&engine, "A6"), 7.0);
    assert_eq!(num(&engine, "B6"), 70.0);
}

#[test]
fn remove_rows_rewires_references_below() {
    let mut engine = build(&[&["1"], &["2"], &["3"], &["=A3"]]);
    assert_eq!(num(&engine, "A4"), 3.0);

    // Removing row 2 shifts A3 up to A2; the reference follows.
    engine.remove_rows(0, 1, 1).unwrap();
    assert_eq!(num(&engine, "A3"), 3.0);
    set(&mut engine, "A2", "30");
    assert_eq!(num(&engine, "A3"), 30.0);
}

#[test]
fn remove_rows_inside_referenced_range_shrinks_it() {
    let mut engine = build(&[&["1"], &["2"], &["3"], &["4"], &["=SUM(A1:A4)"]]);
    assert_eq!(num(&engine, "A5"), 10.0);

    engine.remove_rows(0, 1, 2).unwrap();
    // A1:A4 shrank to A1:A2 holding 1 and 4.
    assert_eq!(num(&engine, "A3"), 5.0);
}

#[test]
fn remove_all_rows_of_a_range_gives_ref_error() {
    let mut engine = build(&[&["", "=SUM(A2:A3)"], &["1"], &["2"]]);
    assert_eq!(num(&engine, "B1"), 3.0);

    engine.remove_rows(0, 1, 2).unwrap();
    assert_eq!(
        engine.cell_value("B1").unwrap(),
        CellValue::Error(ErrorKind::Ref)
    );
}

#[test]
fn add_then_remove_rows_restores_every_formula() {
    let rows: &[&[&str]] = &[
        &["1", "=A1+A3", "=SUM(A1:A3)"],
        &["2", "=$A$2*2", "=B1&\"!\""],
        &["3", "=A1", "=SUM($A$1:$A$2)"],
    ];
    let mut engine = build(rows);
    let twin = build(rows);

    // Net no-op in row space.
    engine.add_rows(0, 1, 1).unwrap();
    engine.remove_rows(0, 1, 1).unwrap();
    engine.force_apply_postponed_transformations();

    assert_eq!(engine.values(0).unwrap(), twin.values(0).unwrap());

    // The graphs behave identically under further edits too.
    let mut twin = twin;
    for target in ["A1", "A2", "A3"] {
        set(&mut engine, target, "9");
        set(&mut twin, target, "9");
    }
    assert_eq!(engine.values(0).unwrap(), twin.values(0).unwrap());
}

#[test]
fn absolute_references_shift_with_their_targets() {
    let mut engine = build(&[&["7", "=$A$1+1"]]);
    engine.add_rows(0, 0, 1).unwrap();
    // Both the cell and its pinned reference moved to row 2.
    assert_eq!(num(&engine, "B2"), 8.0);
    set(&mut engine, "A2", "9");
    assert_eq!(num(&engine, "B2"), 10.0);
}

#[test]
fn add_columns_grows_straddled_row_span() {
    let mut engine = build(&[&["1", "2", "=SUM(A1:B1)"]]);
    assert_eq!(num(&engine, "C1"), 3.0);

    engine.add_columns(0, 1, 1).unwrap();
    assert_eq!(num(&engine, "D1"), 3.0);
    set(&mut engine, "B1", "10");
    assert_eq!(num(&engine, "D1"), 13.0);
}

#[test]
fn structure_sensitive_formulas_recompute_on_structural_change() {
    let mut engine = build(&[&["=ROW()"], &["hello"]]);
    assert_eq!(num(&engine, "A1"), 1.0);

    engine.add_rows(0, 0, 2).unwrap();
    // The formula slid down and must report its new row.
    assert_eq!(num(&engine, "A3"), 3.0);
}

#[test]
fn move_cells_repoints_outside_references() {
    let mut engine = build(&[&["5", "", "=A1"]]);
    assert_eq!(num(&engine, "C1"), 5.0);

    // Move A1 to B1; C1 keeps following the traveling value.
    engine
        .move_cells(CellRange::new(0, (0, 0), (0, 0)), addr(0, 1, 0))
        .unwrap();
    assert_eq!(engine.cell_value("A1").unwrap(), CellValue::Empty);
    assert_eq!(num(&engine, "B1"), 5.0);
    assert_eq!(num(&engine, "C1"), 5.0);

    set(&mut engine, "B1", "6");
    assert_eq!(num(&engine, "C1"), 6.0);
}

#[test]
fn moved_formulas_follow_relative_and_keep_absolute_references() {
    let mut engine = build(&[
        &["10", "=A1+$A$3"],
        &["20"],
        &["100"],
    ]);
    assert_eq!(num(&engine, "B1"), 110.0);

    // Move the formula one row down: the relative A1 follows to A2, the
    // pinned $A$3 stays.
    engine
        .move_cells(CellRange::new(0, (1, 0), (1, 0)), addr(0, 1, 1))
        .unwrap();
    assert_eq!(engine.cell_value("B1").unwrap(), CellValue::Empty);
    assert_eq!(num(&engine, "B2"), 120.0);

    // The rewired dependency tracks the new target, not the old one.
    set(&mut engine, "A2", "25");
    assert_eq!(num(&engine, "B2"), 125.0);
    set(&mut engine, "A1", "0");
    assert_eq!(num(&engine, "B2"), 125.0);
}

#[test]
fn references_into_move_destination_read_the_arrived_value() {
    let mut engine = build(&[&["1", "2", "=B1"]]);
    assert_eq!(num(&engine, "C1"), 2.0);

    // Move A1 onto B1. C1's reference is not retargeted; it now reads the
    // moved-in value.
    engine
        .move_cells(CellRange::new(0, (0, 0), (0, 0)), addr(0, 1, 0))
        .unwrap();
    assert_eq!(num(&engine, "C1"), 1.0);
}

#[test]
fn move_block_with_internal_references() {
    let mut engine = build(&[&["3", "=A1*2"]]);
    assert_eq!(num(&engine, "B1"), 6.0);

    // Move the pair two rows down: the internal reference travels along.
    engine
        .move_cells(CellRange::new(0, (0, 0), (1, 0)), addr(0, 0, 2))
        .unwrap();
    assert_eq!(num(&engine, "A3"), 3.0);
    assert_eq!(num(&engine, "B3"), 6.0);
    set(&mut engine, "A3", "4");
    assert_eq!(num(&engine, "B3"), 8.0);
}

#[test]
fn postponed_transformations_apply_without_evaluation() {
    let mut engine = build(&[&["1"], &["2"], &["=SUM(A1:A2)"]]);
    engine.add_rows(0, 1, 1).unwrap();

    // Forcing the queue through must leave values untouched.
    engine.force_apply_postponed_transformations();
    assert_eq!(num(&engine, "A4"), 3.0);

    set(&mut engine, "A2", "5");
    assert_eq!(num(&engine, "A4"), 8.0);
}

#[test]
fn structural_noop_with_no_dirty_vertices_is_fine() {
    let mut engine = build(&[&["1"]]);
    // No formulas anywhere: the operation dirties nothing, and the
    // unconditional clear afterwards is an explicit no-op.
    engine.add_rows(0, 5, 1).unwrap();
    engine.add_rows(0, 5, 1).unwrap();
    assert_eq!(num(&engine, "A1"), 1.0);
}

#[test]
fn cross_sheet_structural_isolation() {
    let mut engine = engine::Engine::from_sheets(vec![
        ("One".to_string(), vec![vec!["1".to_string()]]),
        (
            "Two".to_string(),
            vec![vec!["=One!A1+1".to_string()]],
        ),
    ])
    .unwrap();
    assert_eq!(engine.cell_value("Two!A1").unwrap(), CellValue::Number(2.0));

    // Inserting rows on sheet Two does not disturb the reference to One.
    let two = engine.sheet_id("Two").unwrap();
    engine.add_rows(two, 0, 4).unwrap();
    assert_eq!(engine.cell_value("Two!A5").unwrap(), CellValue::Number(2.0));
}
