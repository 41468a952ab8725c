//! FILENAME: core/parser/src/parser.rs
//! PURPOSE: Recursive descent parser that converts a stream of Tokens into a template AST.
//! CONTEXT: This is the second stage of the parsing pipeline. It takes tokens
//! from the Lexer and builds an Expression tree. Cell and range references are
//! pulled out into an operand list as they are encountered (source order);
//! the tree nodes carry only the operand index. The caller binds the operand
//! list against the formula's anchor cell.
//!
//! GRAMMAR:
//!   expression     --> comparison
//!   comparison     --> concatenation ( ("=" | "<>" | "<" | ">" | "<=" | ">=") concatenation )*
//!   concatenation  --> additive ( "&" additive )*
//!   additive       --> multiplicative ( ("+" | "-") multiplicative )*
//!   multiplicative --> unary ( ("*" | "/") unary )*
//!   unary          --> ("-" | "+") unary | power
//!   power          --> primary ( "^" unary )?
//!   primary        --> NUMBER | STRING | BOOLEAN | reference | function_call | "(" expression ")"
//!   reference      --> [sheet_prefix] cell_ref (":" cell_ref)?
//!   sheet_prefix   --> (IDENTIFIER | QUOTED_IDENTIFIER) "!"
//!   cell_ref       --> "$"? COLUMN "$"? ROW
//!   function_call  --> IDENTIFIER "(" arguments? ")"
//!   arguments      --> argument (SEPARATOR argument)*
//!   argument       --> expression | <empty>

use crate::ast::{Axis, BinaryOperator, Expression, Operand, RefAddress, UnaryOperator};
use crate::lexer::Lexer;
use crate::token::Token;

/// Parser errors with descriptive messages.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub message: String,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        ParseError {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Parse error: {}", self.message)
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

/// The template tree and its extracted reference operands, in source order.
#[derive(Debug, PartialEq, Clone)]
pub struct ParsedBody {
    pub root: Expression,
    pub operands: Vec<Operand>,
}

/// Parses a formula body (leading '=' optional) into a template AST and
/// operand list. `arg_separator` is the function-argument separator.
pub fn parse(input: &str, arg_separator: char) -> ParseResult<ParsedBody> {
    let mut parser = Parser::new(input, arg_separator);
    parser.parse()
}

/// The Parser struct holds the lexer and current token state.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    current_token: Token,
    operands: Vec<Operand>,
}

impl<'a> Parser<'a> {
    /// Creates a new parser from an input string.
    /// Automatically advances to the first token.
    pub fn new(input: &'a str, arg_separator: char) -> Self {
        let mut lexer = Lexer::with_separator(input, arg_separator);
        let current_token = lexer.next_token();
        Parser {
            lexer,
            current_token,
            operands: Vec::new(),
        }
    }

    /// Parses the entire input and returns the template body.
    /// Handles the optional leading '=' that indicates a formula.
    pub fn parse(&mut self) -> ParseResult<ParsedBody> {
        // Skip the leading '=' if present (formula indicator)
        if self.current_token == Token::Equals {
            self.advance();
        }

        // Handle empty formula
        if self.current_token == Token::EOF {
            return Err(ParseError::new("Empty expression"));
        }

        let root = self.parse_expression()?;

        // Ensure we consumed all tokens
        if self.current_token != Token::EOF {
            return Err(ParseError::new(format!(
                "Unexpected token after expression: {:?}",
                self.current_token
            )));
        }

        Ok(ParsedBody {
            root,
            operands: std::mem::take(&mut self.operands),
        })
    }

    /// Advances to the next token.
    fn advance(&mut self) {
        self.current_token = self.lexer.next_token();
    }

    /// Checks if the current token matches the expected token.
    /// If it matches, advances and returns Ok. Otherwise returns an error.
    fn expect(&mut self, expected: Token) -> ParseResult<()> {
        if self.current_token == expected {
            self.advance();
            Ok(())
        } else {
            Err(ParseError::new(format!(
                "Expected {:?}, found {:?}",
                expected, self.current_token
            )))
        }
    }

    /// Entry point for expression parsing.
    fn parse_expression(&mut self) -> ParseResult<Expression> {
        self.parse_comparison()
    }

    /// Parses comparison expressions (=, <>, <, >, <=, >=).
    fn parse_comparison(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_concatenation()?;

        loop {
            let op = match &self.current_token {
                Token::Equals => BinaryOperator::Equal,
                Token::NotEqual => BinaryOperator::NotEqual,
                Token::LessThan => BinaryOperator::LessThan,
                Token::GreaterThan => BinaryOperator::GreaterThan,
                Token::LessEqual => BinaryOperator::LessEqual,
                Token::GreaterEqual => BinaryOperator::GreaterEqual,
                _ => break,
            };

            self.advance();
            let right = self.parse_concatenation()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses concatenation expressions (&).
    fn parse_concatenation(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_additive()?;

        while self.current_token == Token::Ampersand {
            self.advance();
            let right = self.parse_additive()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Concat,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses additive expressions (+ and -).
    fn parse_additive(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match &self.current_token {
                Token::Plus => BinaryOperator::Add,
                Token::Minus => BinaryOperator::Subtract,
                _ => break,
            };

            self.advance();
            let right = self.parse_multiplicative()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses multiplicative expressions (* and /).
    fn parse_multiplicative(&mut self) -> ParseResult<Expression> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match &self.current_token {
                Token::Asterisk => BinaryOperator::Multiply,
                Token::Slash => BinaryOperator::Divide,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;

            left = Expression::BinaryOp {
                left: Box::new(left),
                op,
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    /// Parses unary expressions (sign).
    fn parse_unary(&mut self) -> ParseResult<Expression> {
        if self.current_token == Token::Minus {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::UnaryOp {
                op: UnaryOperator::Negate,
                operand: Box::new(operand),
            });
        }
        if self.current_token == Token::Plus {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expression::UnaryOp {
                op: UnaryOperator::Plus,
                operand: Box::new(operand),
            });
        }

        self.parse_power()
    }

    /// Parses power/exponentiation expressions (^).
    fn parse_power(&mut self) -> ParseResult<Expression> {
        let left = self.parse_primary()?;

        if self.current_token == Token::Caret {
            self.advance();
            let right = self.parse_unary()?;

            return Ok(Expression::BinaryOp {
                left: Box::new(left),
                op: BinaryOperator::Power,
                right: Box::new(right),
            });
        }

        Ok(left)
    }

    /// Parses primary expressions (literals, references, function calls, parentheses).
    fn parse_primary(&mut self) -> ParseResult<Expression> {
        match self.current_token.clone() {
            // Dollar sign - start of an absolute reference like $A1 or $A$1
            Token::Dollar => {
                self.advance();
                let first = self.parse_dollar_corner(None)?;
                self.finish_reference(first)
            }

            // Number literal
            Token::Number(n) => {
                self.advance();
                Ok(Expression::Number(n))
            }

            // String literal
            Token::String(s) => {
                self.advance();
                Ok(Expression::String(s))
            }

            // Boolean literal
            Token::Boolean(b) => {
                self.advance();
                Ok(Expression::Boolean(b))
            }

            // Quoted identifier - must be a sheet reference
            Token::QuotedIdentifier(sheet_name) => {
                self.advance();
                self.expect(Token::Exclamation)?;
                let first = self.parse_corner(Some(sheet_name))?;
                self.finish_reference(first)
            }

            // Identifier: could be a cell reference, range, function call,
            // or sheet reference prefix
            Token::Identifier(name) => {
                self.advance();

                // Check if it's a sheet reference (followed by '!')
                if self.current_token == Token::Exclamation {
                    self.advance();
                    let first = self.parse_corner(Some(name))?;
                    return self.finish_reference(first);
                }

                // Check if it's a function call (followed by '(')
                if self.current_token == Token::LParen {
                    return self.parse_function_call(name);
                }

                let first = self.corner_from_identifier(None, name, false)?;
                self.finish_reference(first)
            }

            // Parenthesized expression
            Token::LParen => {
                self.advance();
                let expr = self.parse_expression()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }

            other => Err(ParseError::new(format!(
                "Unexpected token: {:?}",
                other
            ))),
        }
    }

    /// Parses a reference corner starting at the current token, with an
    /// optional sheet qualifier already consumed.
    fn parse_corner(&mut self, sheet: Option<String>) -> ParseResult<RefAddress> {
        match self.current_token.clone() {
            Token::Dollar => {
                self.advance();
                self.parse_dollar_corner(sheet)
            }
            Token::Identifier(name) => {
                self.advance();
                self.corner_from_identifier(sheet, name, false)
            }
            other => Err(ParseError::new(format!(
                "Expected cell reference, found {:?}",
                other
            ))),
        }
    }

    /// Parses the remainder of a corner after a leading '$' was consumed.
    /// Accepts "$A1" (lexed as one identifier) and "$A$1" (split by the lexer).
    fn parse_dollar_corner(&mut self, sheet: Option<String>) -> ParseResult<RefAddress> {
        match self.current_token.clone() {
            Token::Identifier(name) => {
                self.advance();
                self.corner_from_identifier(sheet, name, true)
            }
            other => Err(ParseError::new(format!(
                "Expected column letters after '$', found {:?}",
                other
            ))),
        }
    }

    /// Builds a corner from an identifier token. The identifier is either a
    /// complete column+row image ("A1") or bare column letters followed by
    /// '$' and a row number ("A" "$" "1" after lexer splitting).
    fn corner_from_identifier(
        &mut self,
        sheet: Option<String>,
        name: String,
        col_absolute: bool,
    ) -> ParseResult<RefAddress> {
        if let Some((col, row)) = split_cell_identifier(&name) {
            let col_axis = if col_absolute {
                Axis::Absolute(col)
            } else {
                Axis::Relative(col)
            };
            return Ok(RefAddress {
                sheet,
                col: col_axis,
                row: Axis::Relative(row),
            });
        }

        // Bare column letters: the row part must follow as "$" NUMBER.
        // The row image must be pure digits ("A$1.0" is not a reference),
        // matching what the template hasher recognizes.
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_uppercase()) {
            if self.current_token == Token::Dollar {
                self.advance();
                if let Token::Number(n) = self.current_token {
                    if !self.lexer.image().chars().all(|c| c.is_ascii_digit()) {
                        return Err(ParseError::new(format!(
                            "Invalid row number after '$': {}",
                            self.lexer.image()
                        )));
                    }
                    self.advance();
                    let row = row_number_to_index(n)?;
                    let col = column_letters_to_index(&name)?;
                    let col_axis = if col_absolute {
                        Axis::Absolute(col)
                    } else {
                        Axis::Relative(col)
                    };
                    return Ok(RefAddress {
                        sheet,
                        col: col_axis,
                        row: Axis::Absolute(row),
                    });
                }
                return Err(ParseError::new("Expected row number after '$'"));
            }
        }

        Err(ParseError::new(format!("Unknown name: {}", name)))
    }

    /// After the first corner is parsed: either a lone cell reference or,
    /// if a ':' follows, a rectangular range. Pushes the operand and returns
    /// the index-carrying node.
    fn finish_reference(&mut self, first: RefAddress) -> ParseResult<Expression> {
        if self.current_token == Token::Colon {
            self.advance();
            // The sheet qualifier of the first corner covers the rectangle;
            // a second qualifier would make this a 3D reference.
            let second = self.parse_corner(None)?;
            let index = self.operands.len();
            self.operands.push(Operand::Range(first, second));
            return Ok(Expression::RangeReference { operand: index });
        }

        let index = self.operands.len();
        self.operands.push(Operand::Cell(first));
        Ok(Expression::CellReference { operand: index })
    }

    /// Parses a function call. The function name has already been consumed.
    fn parse_function_call(&mut self, name: String) -> ParseResult<Expression> {
        self.expect(Token::LParen)?;

        let mut args = Vec::new();

        if self.current_token == Token::RParen {
            self.advance();
            return Ok(Expression::FunctionCall { name, args });
        }

        loop {
            // An immediately following separator or ')' means an elided argument.
            if self.current_token == Token::ArgSeparator {
                args.push(Expression::EmptyArg);
                self.advance();
                continue;
            }
            if self.current_token == Token::RParen {
                args.push(Expression::EmptyArg);
                break;
            }

            args.push(self.parse_expression()?);

            match self.current_token {
                Token::ArgSeparator => self.advance(),
                Token::RParen => break,
                _ => {
                    return Err(ParseError::new(format!(
                        "Expected argument separator or ')', found {:?}",
                        self.current_token
                    )))
                }
            }
        }

        self.expect(Token::RParen)?;
        Ok(Expression::FunctionCall { name, args })
    }
}

/// Splits a complete cell identifier like "A1" or "AA100" into a 0-based
/// column index and 0-based row index. Returns None if the identifier does
/// not have the column-letters-then-row-digits shape, or if the column part
/// is beyond XFD (16384 columns).
pub fn split_cell_identifier(name: &str) -> Option<(u32, u32)> {
    let letters_end = name.chars().take_while(|c| c.is_ascii_uppercase()).count();
    if letters_end == 0 {
        return None;
    }
    let (letters, digits) = name.split_at(letters_end);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let col = column_letters_to_index(letters).ok()?;
    let row: u32 = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some((col, row - 1))
}

/// Converts column letters to a 0-based index: "A" -> 0, "Z" -> 25, "AA" -> 26.
/// Columns beyond XFD (index 16383) are rejected, which also bounds the
/// accumulator before it can overflow.
fn column_letters_to_index(letters: &str) -> ParseResult<u32> {
    let mut result: u64 = 0;
    for c in letters.chars() {
        if !c.is_ascii_uppercase() {
            return Err(ParseError::new(format!("Invalid column letters: {}", letters)));
        }
        result = result * 26 + (c as u64 - 'A' as u64 + 1);
        if result > 16384 {
            return Err(ParseError::new(format!("Column beyond XFD: {}", letters)));
        }
    }
    if result == 0 {
        return Err(ParseError::new("Empty column letters"));
    }
    Ok(result as u32 - 1)
}

/// Converts a written row number (1-based, from a Number token) to a 0-based index.
fn row_number_to_index(n: f64) -> ParseResult<u32> {
    if n < 1.0 || n.fract() != 0.0 || n > u32::MAX as f64 {
        return Err(ParseError::new(format!("Invalid row number: {}", n)));
    }
    Ok(n as u32 - 1)
}
