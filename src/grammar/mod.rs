//! Command grammar for the O kernel.
//!
//! Entities talk to the kernel in a small backslash-prefixed language:
//! `\verb` followed by nodes (`@entity`, `#space`, `?(condition)`,
//! `$( \query--- )`, free text) and closed by `---`. This module turns that
//! text into an immutable [`Command`] tree. It performs only structural
//! validation (name charset, length, nesting depth); whether a verb exists or
//! an entity is real is decided later by the dispatcher and handlers.

/// Command tree, condition expressions, and canonical rendering.
pub mod ast;
/// Recursive-descent parser for the command language.
pub mod parser;

pub use ast::{Arg, Command, ConditionExpr, Node, PredicateCall, is_valid_name};
pub use parser::parse;

use thiserror::Error;

/// Maximum command length in characters.
pub const MAX_COMMAND_LENGTH: usize = 10_000;

/// Maximum nesting depth for conditions, queries, and grouped sub-expressions.
pub const MAX_NESTING_DEPTH: usize = 10;

/// The literal token closing every command.
pub const TERMINATOR: &str = "---";

/// Convenience result alias for parser operations.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

/// Structural error raised while parsing a command.
///
/// The command is rejected wholesale; no partial tree is ever produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at position {position})\n  Near: {snippet}")]
pub struct ParseError {
    /// Human/entity readable description.
    pub message: String,
    /// 1-based character offset of the offending character.
    pub position: usize,
    /// Short excerpt of the input around `position`.
    pub snippet: String,
}

impl ParseError {
    /// Construct a new parse error.
    pub fn new(message: impl Into<String>, position: usize, snippet: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            position,
            snippet: snippet.into(),
        }
    }
}
