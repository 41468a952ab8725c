//! FILENAME: core/parser/src/hash.rs
//! PURPOSE: Template hashing and reference scanning for the parser cache.
//! CONTEXT: Two formulas that differ only in their relative cell operands
//! must share one cached template. The template hash is the formula's token
//! images concatenated in order, uppercased outside string literals, with
//! every relative-or-mixed cell reference replaced by the placeholder '#'.
//! Fully absolute references ($A$1) keep their image: they are part of the
//! template's identity. Two modes produce the hash:
//!
//! - token-driven: `scan_formula` lexes the text, recognizes reference token
//!   sequences, and extracts the reference operands in source order as a
//!   by-product (this is what makes cache hits cheap: no tree build needed).
//! - regex-driven: `hash_from_text` never runs the lexer; it splits the text
//!   around string literals and substitutes references with a regex pass.
//!
//! Both modes MUST produce identical output for every formula; quoted-string
//! content is preserved verbatim in both (a backslash before the closing
//! quote continues the string). A literal '#' outside a string literal is
//! escaped as "##" so it can never masquerade as the placeholder.

use crate::ast::{Axis, Operand, RefAddress};
use crate::lexer::Lexer;
use crate::parser::split_cell_identifier;
use crate::token::Token;
use once_cell::sync::Lazy;
use regex::Regex;

/// The hash placeholder for a relative or mixed cell reference.
const PLACEHOLDER: char = '#';

/// Word-shaped chunks in whitespace-stripped, uppercased formula text.
/// Matches at least every token the lexer would classify as a reference,
/// plus identifier-like text that the classifier then rejects.
static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$?[A-Z_][A-Z0-9_.$]*").expect("word regex"));

/// Result of the token-driven scan: the template hash and the reference
/// operands in source order.
#[derive(Debug, PartialEq, Clone)]
pub struct ScanResult {
    pub hash: String,
    pub operands: Vec<Operand>,
}

/// One recognized reference corner in the token stream.
struct Corner {
    address: RefAddress,
    /// Number of tokens the corner spans.
    consumed: usize,
    /// Fully absolute corners keep their image in the hash.
    image: Option<String>,
}

/// Token-driven mode: lex `text` and produce the template hash together
/// with the extracted operands.
pub fn scan_formula(text: &str) -> ScanResult {
    let mut lexer = Lexer::new(text);
    let mut tokens: Vec<(Token, String)> = Vec::new();
    loop {
        let token = lexer.next_token();
        if token == Token::EOF {
            break;
        }
        tokens.push((token, lexer.image().to_string()));
    }

    let mut hash = String::new();
    let mut operands = Vec::new();
    let mut i = 0;

    // Skip the leading '=' formula marker, like the parser does.
    if matches!(tokens.first(), Some((Token::Equals, _))) {
        i = 1;
    }

    while i < tokens.len() {
        // Sheet qualifier: IDENT '!' or 'Quoted' '!' ahead of a corner.
        let mut sheet = None;
        if i + 1 < tokens.len() && tokens[i + 1].0 == Token::Exclamation {
            match &tokens[i].0 {
                Token::Identifier(name) | Token::QuotedIdentifier(name) => {
                    sheet = Some(name.clone());
                    push_escaped(&mut hash, &tokens[i].1.to_uppercase());
                    hash.push('!');
                    i += 2;
                }
                _ => {}
            }
        }

        if let Some(first) = recognize_corner(&tokens, i) {
            i += first.consumed;
            push_corner_hash(&mut hash, &first);

            // A ':' between two corners makes a rectangular range.
            if i < tokens.len() && tokens[i].0 == Token::Colon {
                if let Some(second) = recognize_corner(&tokens, i + 1) {
                    hash.push(':');
                    i += 1 + second.consumed;
                    push_corner_hash(&mut hash, &second);
                    operands.push(Operand::Range(
                        with_sheet(first.address, sheet),
                        second.address,
                    ));
                    continue;
                }
            }

            operands.push(Operand::Cell(with_sheet(first.address, sheet)));
            continue;
        }

        if sheet.is_some() {
            // A qualifier with no corner behind it; the images are already
            // emitted, nothing to extract.
            continue;
        }

        // Everything else keeps its image; strings stay verbatim.
        match &tokens[i].0 {
            Token::String(_) => hash.push_str(&tokens[i].1),
            _ => push_escaped(&mut hash, &tokens[i].1.to_uppercase()),
        }
        i += 1;
    }

    ScanResult { hash, operands }
}

/// Token-driven hash alone (cache probing without operand interest).
pub fn hash_from_tokens(text: &str) -> String {
    scan_formula(text).hash
}

fn with_sheet(mut address: RefAddress, sheet: Option<String>) -> RefAddress {
    address.sheet = sheet;
    address
}

fn push_corner_hash(hash: &mut String, corner: &Corner) {
    match &corner.image {
        Some(image) => hash.push_str(image),
        None => hash.push(PLACEHOLDER),
    }
}

/// Pushes text outside string literals, escaping literal '#' characters so
/// they stay distinguishable from the reference placeholder.
fn push_escaped(hash: &mut String, text: &str) {
    for c in text.chars() {
        hash.push(c);
        if c == PLACEHOLDER {
            hash.push(PLACEHOLDER);
        }
    }
}

/// Recognizes the reference-corner token patterns the parser accepts:
///   IDENT("A1")                    relative col, relative row
///   IDENT("A") '$' NUMBER          relative col, absolute row
///   '$' IDENT("A1")                absolute col, relative row
///   '$' IDENT("A") '$' NUMBER      absolute col, absolute row
/// An identifier followed by '(' is a function name, never a corner.
fn recognize_corner(tokens: &[(Token, String)], i: usize) -> Option<Corner> {
    match tokens.get(i)?.0.clone() {
        Token::Identifier(name) => {
            if let Some((col, row)) = split_cell_identifier(&name) {
                if matches!(tokens.get(i + 1), Some((Token::LParen, _))) {
                    return None;
                }
                return Some(Corner {
                    address: RefAddress {
                        sheet: None,
                        col: Axis::Relative(col),
                        row: Axis::Relative(row),
                    },
                    consumed: 1,
                    image: None,
                });
            }
            let col = bare_column(&name)?;
            let row = dollar_row(tokens, i + 1)?;
            Some(Corner {
                address: RefAddress {
                    sheet: None,
                    col: Axis::Relative(col),
                    row: Axis::Absolute(row),
                },
                consumed: 3,
                image: None,
            })
        }
        Token::Dollar => match tokens.get(i + 1)?.0.clone() {
            Token::Identifier(name) => {
                if let Some((col, row)) = split_cell_identifier(&name) {
                    if matches!(tokens.get(i + 2), Some((Token::LParen, _))) {
                        return None;
                    }
                    return Some(Corner {
                        address: RefAddress {
                            sheet: None,
                            col: Axis::Absolute(col),
                            row: Axis::Relative(row),
                        },
                        consumed: 2,
                        image: None,
                    });
                }
                let col = bare_column(&name)?;
                let row = dollar_row(tokens, i + 2)?;
                let mut image = String::with_capacity(8);
                for (_, img) in &tokens[i..i + 4] {
                    image.push_str(&img.to_uppercase());
                }
                Some(Corner {
                    address: RefAddress {
                        sheet: None,
                        col: Axis::Absolute(col),
                        row: Axis::Absolute(row),
                    },
                    consumed: 4,
                    image: Some(image),
                })
            }
            _ => None,
        },
        _ => None,
    }
}

/// Letters-only column part of a split reference like "A" in "A$1".
fn bare_column(name: &str) -> Option<u32> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase()) {
        return None;
    }
    let mut result: u64 = 0;
    for c in name.chars() {
        result = result * 26 + (c as u64 - 'A' as u64 + 1);
        if result > 16384 {
            return None;
        }
    }
    Some(result as u32 - 1)
}

/// The "'$' NUMBER" row tail of a mixed/absolute corner. The number image
/// must be pure digits (no decimal point) and at least 1.
fn dollar_row(tokens: &[(Token, String)], i: usize) -> Option<u32> {
    if tokens.get(i)?.0 != Token::Dollar {
        return None;
    }
    let (token, image) = tokens.get(i + 1)?;
    if !matches!(token, Token::Number(_)) {
        return None;
    }
    if image.is_empty() || !image.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let row: u32 = image.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some(row - 1)
}

/// Regex-driven mode: compute the template hash without running the lexer.
/// Used by throughput-sensitive ingestion paths that only need the cache key.
pub fn hash_from_text(text: &str) -> String {
    let mut hash = String::with_capacity(text.len());
    let mut rest = text.strip_prefix('=').unwrap_or(text);

    while !rest.is_empty() {
        // Find the next quoted region; everything before it is plain text.
        let next_quote = rest.find(|c| c == '"' || c == '\'');
        let (plain, tail) = match next_quote {
            Some(pos) => rest.split_at(pos),
            None => (rest, ""),
        };
        hash_plain_segment(plain, &mut hash);

        if tail.is_empty() {
            break;
        }
        let quote = tail.chars().next().unwrap();
        let (segment, remaining) = take_quoted_segment(tail, quote);
        if quote == '"' {
            // String literal content is preserved verbatim.
            hash.push_str(segment);
        } else {
            // Quoted sheet names keep inner whitespace but fold case.
            push_escaped(&mut hash, &segment.to_uppercase());
        }
        rest = remaining;
    }

    hash
}

/// Consumes a quoted segment starting at `text[0] == quote`, honoring the
/// escape convention of each quote kind: backslash-escape inside strings,
/// doubled quotes inside sheet names. Returns (segment incl. quotes, rest).
fn take_quoted_segment(text: &str, quote: char) -> (&str, &str) {
    let bytes = text.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if quote == '"' && c == '\\' {
            if bytes.get(i + 1) == Some(&b'"') {
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if c == quote {
            if quote == '\'' && bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return text.split_at(i + 1);
        }
        i += 1;
    }
    (text, "")
}

/// Hashes a segment outside any quotes: strip whitespace, fold case, then
/// substitute relative and mixed references with the placeholder.
fn hash_plain_segment(segment: &str, hash: &mut String) {
    let stripped: String = segment
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect();

    let mut last = 0;
    for m in WORD_RE.find_iter(&stripped) {
        push_escaped(hash, &stripped[last..m.start()]);
        last = m.end();

        let word = m.as_str();
        // A following '(' makes the word a function name, a following '!'
        // a sheet qualifier; both stay literal like in the token mode.
        let next_char = stripped[m.end()..].chars().next();
        let shadowed = matches!(next_char, Some('(') | Some('!'));
        match classify_word(word) {
            WordKind::RelativeRef if !shadowed => hash.push(PLACEHOLDER),
            _ => hash.push_str(word),
        }
    }
    push_escaped(hash, &stripped[last..]);
}

enum WordKind {
    /// A cell reference with at least one relative component.
    RelativeRef,
    /// A fully absolute reference or any non-reference word.
    Literal,
}

/// Classifies a word chunk the way the token scanner classifies reference
/// token sequences: optional '$', column letters, optional '$', row digits,
/// nothing trailing, with the column within sheet limits and the row >= 1.
fn classify_word(word: &str) -> WordKind {
    let mut rest = word;
    let col_absolute = if let Some(stripped) = rest.strip_prefix('$') {
        rest = stripped;
        true
    } else {
        false
    };

    let letters_len = rest.chars().take_while(|c| c.is_ascii_uppercase()).count();
    if letters_len == 0 {
        return WordKind::Literal;
    }
    let (letters, mut tail) = rest.split_at(letters_len);

    let row_absolute = if let Some(stripped) = tail.strip_prefix('$') {
        tail = stripped;
        true
    } else {
        false
    };

    if tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return WordKind::Literal;
    }

    if bare_column(letters).is_none() {
        return WordKind::Literal;
    }
    match tail.parse::<u32>() {
        Ok(row) if row >= 1 => {}
        _ => return WordKind::Literal,
    }

    if col_absolute && row_absolute {
        WordKind::Literal
    } else {
        WordKind::RelativeRef
    }
}
