//! FILENAME: core/parser/src/tests.rs
//! PURPOSE: Consolidated unit tests for the parser crate.

use crate::ast::{
    AstError, Axis, BinaryOperator, Expression, Operand, RefAddress, UnaryOperator,
};
use crate::cache::CachingParser;
use crate::hash::{hash_from_text, hash_from_tokens, scan_formula};
use crate::lexer::Lexer;
use crate::parser::parse;
use crate::token::Token;
use std::sync::Arc;

fn rel(col: u32, row: u32) -> RefAddress {
    RefAddress {
        sheet: None,
        col: Axis::Relative(col),
        row: Axis::Relative(row),
    }
}

// ========================================
// LEXER TESTS
// ========================================

#[test]
fn lexer_tokenizes_simple_math() {
    let mut lexer = Lexer::new("=1 + 2");

    assert_eq!(lexer.next_token(), Token::Equals);
    assert_eq!(lexer.next_token(), Token::Number(1.0));
    assert_eq!(lexer.next_token(), Token::Plus);
    assert_eq!(lexer.next_token(), Token::Number(2.0));
    assert_eq!(lexer.next_token(), Token::EOF);
}

#[test]
fn lexer_tokenizes_functions() {
    let mut lexer = Lexer::new("SUM(A1, 10)");

    assert_eq!(lexer.next_token(), Token::Identifier("SUM".to_string()));
    assert_eq!(lexer.next_token(), Token::LParen);
    assert_eq!(lexer.next_token(), Token::Identifier("A1".to_string()));
    assert_eq!(lexer.next_token(), Token::ArgSeparator);
    assert_eq!(lexer.next_token(), Token::Number(10.0));
    assert_eq!(lexer.next_token(), Token::RParen);
    assert_eq!(lexer.next_token(), Token::EOF);
}

#[test]
fn lexer_custom_argument_separator() {
    let mut lexer = Lexer::with_separator("SUM(A1; 10)", ';');

    assert_eq!(lexer.next_token(), Token::Identifier("SUM".to_string()));
    assert_eq!(lexer.next_token(), Token::LParen);
    assert_eq!(lexer.next_token(), Token::Identifier("A1".to_string()));
    assert_eq!(lexer.next_token(), Token::ArgSeparator);
    assert_eq!(lexer.next_token(), Token::Number(10.0));
}

#[test]
fn lexer_tokenizes_comparison_operators() {
    let mut lexer = Lexer::new("<= >= <> < >");

    assert_eq!(lexer.next_token(), Token::LessEqual);
    assert_eq!(lexer.next_token(), Token::GreaterEqual);
    assert_eq!(lexer.next_token(), Token::NotEqual);
    assert_eq!(lexer.next_token(), Token::LessThan);
    assert_eq!(lexer.next_token(), Token::GreaterThan);
}

#[test]
fn lexer_exclamation_token() {
    let mut lexer = Lexer::new("Sheet1!A1");
    assert_eq!(lexer.next_token(), Token::Identifier("SHEET1".to_string()));
    assert_eq!(lexer.next_token(), Token::Exclamation);
    assert_eq!(lexer.next_token(), Token::Identifier("A1".to_string()));
}

#[test]
fn lexer_quoted_identifier() {
    let mut lexer = Lexer::new("'My Sheet'!A1");
    assert_eq!(
        lexer.next_token(),
        Token::QuotedIdentifier("My Sheet".to_string())
    );
    assert_eq!(lexer.next_token(), Token::Exclamation);
    assert_eq!(lexer.next_token(), Token::Identifier("A1".to_string()));
}

#[test]
fn lexer_quoted_identifier_with_escaped_quote() {
    let mut lexer = Lexer::new("'John''s Sheet'!A1");
    assert_eq!(
        lexer.next_token(),
        Token::QuotedIdentifier("John's Sheet".to_string())
    );
    assert_eq!(lexer.next_token(), Token::Exclamation);
}

#[test]
fn lexer_string_literal() {
    let mut lexer = Lexer::new("\"hello world\"");
    assert_eq!(lexer.next_token(), Token::String("hello world".to_string()));
}

#[test]
fn lexer_string_backslash_continues_before_closing_quote() {
    // "a\"b" is one string containing a double quote.
    let mut lexer = Lexer::new(r#""a\"b""#);
    assert_eq!(lexer.next_token(), Token::String("a\"b".to_string()));
    assert_eq!(lexer.next_token(), Token::EOF);
}

#[test]
fn lexer_string_plain_backslash_is_content() {
    let mut lexer = Lexer::new(r#""a\b""#);
    assert_eq!(lexer.next_token(), Token::String("a\\b".to_string()));
}

#[test]
fn lexer_records_token_images() {
    let mut lexer = Lexer::new("= a1 + 1.50");
    lexer.next_token();
    assert_eq!(lexer.image(), "=");
    lexer.next_token();
    assert_eq!(lexer.image(), "a1");
    lexer.next_token();
    assert_eq!(lexer.image(), "+");
    lexer.next_token();
    assert_eq!(lexer.image(), "1.50");
}

#[test]
fn lexer_boolean_literals() {
    let mut lexer = Lexer::new("TRUE false");
    assert_eq!(lexer.next_token(), Token::Boolean(true));
    assert_eq!(lexer.next_token(), Token::Boolean(false));
}

// ========================================
// PARSER TESTS
// ========================================

#[test]
fn parses_number_addition() {
    let body = parse("=1+2", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::BinaryOp {
            left: Box::new(Expression::Number(1.0)),
            op: BinaryOperator::Add,
            right: Box::new(Expression::Number(2.0)),
        }
    );
    assert!(body.operands.is_empty());
}

#[test]
fn parses_cell_reference_into_operand() {
    let body = parse("=A1+2", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::BinaryOp {
            left: Box::new(Expression::CellReference { operand: 0 }),
            op: BinaryOperator::Add,
            right: Box::new(Expression::Number(2.0)),
        }
    );
    assert_eq!(body.operands, vec![Operand::Cell(rel(0, 0))]);
}

#[test]
fn parses_absolute_and_mixed_references() {
    let body = parse("=$A$1+A$2+$B3", ',').unwrap();
    assert_eq!(
        body.operands,
        vec![
            Operand::Cell(RefAddress {
                sheet: None,
                col: Axis::Absolute(0),
                row: Axis::Absolute(0),
            }),
            Operand::Cell(RefAddress {
                sheet: None,
                col: Axis::Relative(0),
                row: Axis::Absolute(1),
            }),
            Operand::Cell(RefAddress {
                sheet: None,
                col: Axis::Absolute(1),
                row: Axis::Relative(2),
            }),
        ]
    );
}

#[test]
fn parses_range_reference() {
    let body = parse("=SUM(A1:B10)", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::FunctionCall {
            name: "SUM".to_string(),
            args: vec![Expression::RangeReference { operand: 0 }],
        }
    );
    assert_eq!(body.operands, vec![Operand::Range(rel(0, 0), rel(1, 9))]);
}

#[test]
fn parses_sheet_qualified_reference() {
    let body = parse("=Sheet2!B3", ',').unwrap();
    assert_eq!(
        body.operands,
        vec![Operand::Cell(RefAddress {
            sheet: Some("SHEET2".to_string()),
            col: Axis::Relative(1),
            row: Axis::Relative(2),
        })]
    );
}

#[test]
fn parses_quoted_sheet_reference() {
    let body = parse("='My Sheet'!A1:A5", ',').unwrap();
    match &body.operands[0] {
        Operand::Range(start, end) => {
            assert_eq!(start.sheet, Some("My Sheet".to_string()));
            assert_eq!(end.sheet, None);
        }
        other => panic!("expected range operand, got {:?}", other),
    }
}

#[test]
fn parses_nested_functions_and_operand_order() {
    let body = parse("=SUM(B2:B4,MAX(C1,A1))", ',').unwrap();
    // Operands are extracted in source order.
    assert_eq!(
        body.operands,
        vec![
            Operand::Range(rel(1, 1), rel(1, 3)),
            Operand::Cell(rel(2, 0)),
            Operand::Cell(rel(0, 0)),
        ]
    );
}

#[test]
fn parses_empty_arguments() {
    let body = parse("=SUM(A1,,B1)", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::FunctionCall {
            name: "SUM".to_string(),
            args: vec![
                Expression::CellReference { operand: 0 },
                Expression::EmptyArg,
                Expression::CellReference { operand: 1 },
            ],
        }
    );
}

#[test]
fn parses_function_without_arguments() {
    let body = parse("=RAND()", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::FunctionCall {
            name: "RAND".to_string(),
            args: vec![],
        }
    );
}

#[test]
fn parses_unary_sign_chain() {
    let body = parse("=--3", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::UnaryOp {
            op: UnaryOperator::Negate,
            operand: Box::new(Expression::UnaryOp {
                op: UnaryOperator::Negate,
                operand: Box::new(Expression::Number(3.0)),
            }),
        }
    );
}

#[test]
fn power_is_right_associative_with_unary() {
    // 2^-3 parses as 2^(-3)
    let body = parse("=2^-3", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::BinaryOp {
            left: Box::new(Expression::Number(2.0)),
            op: BinaryOperator::Power,
            right: Box::new(Expression::UnaryOp {
                op: UnaryOperator::Negate,
                operand: Box::new(Expression::Number(3.0)),
            }),
        }
    );
}

#[test]
fn precedence_multiplication_over_addition() {
    let body = parse("=1+2*3", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::BinaryOp {
            left: Box::new(Expression::Number(1.0)),
            op: BinaryOperator::Add,
            right: Box::new(Expression::BinaryOp {
                left: Box::new(Expression::Number(2.0)),
                op: BinaryOperator::Multiply,
                right: Box::new(Expression::Number(3.0)),
            }),
        }
    );
}

#[test]
fn parenthesized_expression_unwraps() {
    let body = parse("=(1+2)*3", ',').unwrap();
    assert_eq!(
        body.root,
        Expression::BinaryOp {
            left: Box::new(Expression::BinaryOp {
                left: Box::new(Expression::Number(1.0)),
                op: BinaryOperator::Add,
                right: Box::new(Expression::Number(2.0)),
            }),
            op: BinaryOperator::Multiply,
            right: Box::new(Expression::Number(3.0)),
        }
    );
}

#[test]
fn rejects_bare_names() {
    assert!(parse("=FOO", ',').is_err());
    assert!(parse("=TaxRate*2", ',').is_err());
}

#[test]
fn rejects_trailing_tokens() {
    assert!(parse("=1 2", ',').is_err());
}

#[test]
fn rejects_empty_input() {
    assert!(parse("=", ',').is_err());
    assert!(parse("", ',').is_err());
}

#[test]
fn rejects_column_beyond_sheet_limit() {
    assert!(parse("=XFE1", ',').is_err());
}

#[test]
fn rejects_fractional_absolute_row() {
    assert!(parse("=A$1.0", ',').is_err());
}

#[test]
fn accepts_last_valid_column() {
    let body = parse("=XFD1", ',').unwrap();
    assert_eq!(body.operands, vec![Operand::Cell(rel(16383, 0))]);
}

// ========================================
// HASH TESTS
// ========================================

/// Both hashing modes must agree on every formula.
fn assert_hash(text: &str, expected: &str) {
    assert_eq!(hash_from_tokens(text), expected, "token mode: {}", text);
    assert_eq!(hash_from_text(text), expected, "regex mode: {}", text);
}

#[test]
fn hash_substitutes_relative_references() {
    assert_hash("=A1+2", "#+2");
    assert_hash("=Z9+2", "#+2");
    assert_hash("=SUM(A1:B2)", "SUM(#:#)");
}

#[test]
fn hash_keeps_absolute_references() {
    assert_hash("=$A$1*2", "$A$1*2");
    assert_hash("=$A$1:$B$2", "$A$1:$B$2");
}

#[test]
fn hash_substitutes_mixed_references() {
    assert_hash("=A$1+$B2", "#+#");
    assert_hash("=$A$1+A$1", "$A$1+#");
}

#[test]
fn hash_strips_whitespace_and_folds_case() {
    assert_hash("= sum( a1 , b2 )", "SUM(#,#)");
}

#[test]
fn hash_preserves_string_content_verbatim() {
    assert_hash("=A1&\"x Y z\"", "#&\"x Y z\"");
    assert_hash(r#"="a\"b""#, r#""a\"b""#);
}

#[test]
fn hash_keeps_sheet_qualifiers() {
    assert_hash("=Sheet1!A1", "SHEET1!#");
    assert_hash("='My Sheet'!A1+2", "'MY SHEET'!#+2");
    // A sheet named like a cell reference is still a qualifier.
    assert_hash("=A1!B2", "A1!#");
}

#[test]
fn hash_does_not_substitute_function_names_shaped_like_references() {
    // A function named like a cell reference stays literal.
    assert_hash("=a1(2)", "A1(2)");
}

#[test]
fn hash_escapes_literal_placeholder_characters() {
    // A formula containing a literal '#' can never collide with a
    // reference placeholder.
    assert_hash("=#", "##");
    assert_ne!(hash_from_tokens("=#"), hash_from_tokens("=A1"));
}

#[test]
fn hash_modes_agree_on_awkward_inputs() {
    for text in [
        "=A1B",
        "=_A1",
        "=A1.5",
        "=1.50+A1",
        "=\"unterminated",
        "=A1:",
        "=$A$1(",
        "=XFE1",
        "=A0",
        "=TRUE&A1",
        "=#",
        "=A1#",
        "=A$1.0",
    ] {
        assert_eq!(
            hash_from_tokens(text),
            hash_from_text(text),
            "modes disagree on {}",
            text
        );
    }
}

#[test]
fn scan_extracts_operands_in_source_order() {
    let scan = scan_formula("=B2+Sheet2!C3*SUM($A$1:A2)");
    assert_eq!(scan.operands.len(), 3);
    assert_eq!(scan.operands[0], Operand::Cell(rel(1, 1)));
    match &scan.operands[1] {
        Operand::Cell(addr) => assert_eq!(addr.sheet, Some("SHEET2".to_string())),
        other => panic!("expected cell operand, got {:?}", other),
    }
    match &scan.operands[2] {
        Operand::Range(start, end) => {
            assert!(start.col.is_absolute() && start.row.is_absolute());
            assert!(!end.col.is_absolute() && !end.row.is_absolute());
        }
        other => panic!("expected range operand, got {:?}", other),
    }
}

#[test]
fn scan_and_parser_extract_identical_operands() {
    for text in [
        "=A1+B2",
        "=SUM(A1:B10,C3)",
        "=$A$1+A$2+$B3",
        "=Sheet2!B3&'My Sheet'!C4",
        "=IF(A1>0,B1,C1)",
    ] {
        let scan = scan_formula(text);
        let body = parse(text, ',').unwrap();
        assert_eq!(scan.operands, body.operands, "operand mismatch for {}", text);
    }
}

// ========================================
// CACHE TESTS
// ========================================

#[test]
fn cache_shares_template_across_relative_variants() {
    let mut parser = CachingParser::new(',');
    let first = parser.parse("=A1+2");
    let second = parser.parse("=Z9+2");

    assert_eq!(first.hash, second.hash);
    assert!(Arc::ptr_eq(&first.ast, &second.ast));
    assert_eq!(parser.cached_count(), 1);

    // The operands still distinguish the two formulas.
    assert_eq!(first.operands, vec![Operand::Cell(rel(0, 0))]);
    assert_eq!(second.operands, vec![Operand::Cell(rel(25, 8))]);
}

#[test]
fn cache_distinguishes_absolute_references() {
    let mut parser = CachingParser::new(',');
    let first = parser.parse("=$A$1+2");
    let second = parser.parse("=$B$2+2");

    assert_ne!(first.hash, second.hash);
    assert_eq!(parser.cached_count(), 2);
}

#[test]
fn cache_stores_parse_errors() {
    let mut parser = CachingParser::new(',');
    let first = parser.parse("=1+");
    assert!(first.is_parse_error());
    assert!(first.operands.is_empty());

    let second = parser.parse("=1+");
    assert!(second.is_parse_error());
    assert_eq!(parser.cached_count(), 1);
}

#[test]
fn cache_flags_volatile_and_structure_sensitive() {
    let mut parser = CachingParser::new(',');
    let volatile = parser.parse("=RAND()*10");
    assert!(volatile.volatile);
    assert!(!volatile.structure_sensitive);

    let sensitive = parser.parse("=COLUMN(A1)");
    assert!(sensitive.structure_sensitive);
    assert!(!sensitive.volatile);

    let plain = parser.parse("=SUM(A1:A3)");
    assert!(!plain.volatile);
    assert!(!plain.structure_sensitive);

    let error = parser.parse("=#");
    assert!(error.is_parse_error());
    assert!(!error.volatile);
}

#[test]
fn cache_respects_argument_separator() {
    let mut parser = CachingParser::new(';');
    let parsed = parser.parse("=SUM(A1;B1)");
    assert!(!parsed.is_parse_error());
    assert_eq!(parsed.operands.len(), 2);
}
