//! FILENAME: core/parser/src/cache.rs
//! PURPOSE: The caching front door of the parser crate.
//! CONTEXT: Formula templates are expensive to build and cheap to share.
//! `CachingParser` keys templates by their hash (see hash.rs); a cache hit
//! skips tree construction entirely and pairs the shared template with the
//! operands extracted by the token scan. Parse failures are cached too, as
//! an Error(parse) template, so repeated bad input stays cheap.
//! The cache is unbounded; it is private to one engine instance.

use crate::ast::{AstError, Expression, Operand};
use crate::hash::scan_formula;
use crate::parser;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Functions that must be recomputed on every evaluation cycle.
pub static VOLATILE_FUNCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut volatiles = HashSet::new();
    volatiles.insert("RAND");
    volatiles.insert("NOW");
    volatiles.insert("TODAY");
    volatiles
});

/// Functions whose result depends on sheet layout, not only on cell values.
pub static STRUCTURE_SENSITIVE_FUNCTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    let mut sensitive = HashSet::new();
    sensitive.insert("ROW");
    sensitive.insert("COLUMN");
    sensitive.insert("ROWS");
    sensitive.insert("COLUMNS");
    sensitive
});

/// The outcome of parsing one formula text: a shared template, the
/// reference operands in source order, the cache key, and the function
/// classification flags.
#[derive(Debug, Clone)]
pub struct ParsedFormula {
    pub ast: Arc<Expression>,
    pub operands: Vec<Operand>,
    pub hash: String,
    pub volatile: bool,
    pub structure_sensitive: bool,
}

impl ParsedFormula {
    /// True if the template is a parse-failure marker.
    pub fn is_parse_error(&self) -> bool {
        matches!(*self.ast, Expression::Error(AstError::Parse))
    }
}

struct CachedTemplate {
    ast: Arc<Expression>,
    volatile: bool,
    structure_sensitive: bool,
}

/// Parser with a template cache keyed by the normalized token hash.
pub struct CachingParser {
    cache: HashMap<String, CachedTemplate>,
    arg_separator: char,
}

impl CachingParser {
    pub fn new(arg_separator: char) -> Self {
        CachingParser {
            cache: HashMap::new(),
            arg_separator,
        }
    }

    /// Parses formula text (leading '=' optional). On a cache hit the
    /// template tree is reused; the operand list always comes from the
    /// current text since operands are what distinguish formulas sharing
    /// a template.
    pub fn parse(&mut self, text: &str) -> ParsedFormula {
        let scan = scan_formula(text);

        if let Some(cached) = self.cache.get(&scan.hash) {
            // A cached parse failure carries no meaningful operands.
            let operands = if matches!(*cached.ast, Expression::Error(AstError::Parse)) {
                Vec::new()
            } else {
                scan.operands
            };
            return ParsedFormula {
                ast: Arc::clone(&cached.ast),
                operands,
                hash: scan.hash,
                volatile: cached.volatile,
                structure_sensitive: cached.structure_sensitive,
            };
        }

        let (ast, operands) = match parser::parse(text, self.arg_separator) {
            Ok(body) => (Arc::new(body.root), body.operands),
            Err(_) => (Arc::new(Expression::Error(AstError::Parse)), Vec::new()),
        };

        let volatile = ast.any_function(&|name| VOLATILE_FUNCTIONS.contains(name));
        let structure_sensitive =
            ast.any_function(&|name| STRUCTURE_SENSITIVE_FUNCTIONS.contains(name));

        self.cache.insert(
            scan.hash.clone(),
            CachedTemplate {
                ast: Arc::clone(&ast),
                volatile,
                structure_sensitive,
            },
        );

        ParsedFormula {
            ast,
            operands,
            hash: scan.hash,
            volatile,
            structure_sensitive,
        }
    }

    /// Number of cached templates. Exposed for cache-behavior tests.
    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}
