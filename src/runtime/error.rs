//! Error types for the O kernel
//!
//! Domain errors use thiserror; the storage boundary uses anyhow and is
//! converted into [`KernelError::Storage`] at the kernel boundary. Nothing in
//! this module is allowed to stop the tick loop on behalf of a single entity:
//! handler, parse and condition failures become log records instead.

use std::io;
use thiserror::Error;

use super::record::Tick;

/// Top-level kernel error
#[derive(Debug, Error)]
pub enum KernelError {
    /// Execution log errors
    #[error("Log error: {0}")]
    Log(#[from] LogError),

    /// Storage-related errors (layout, config persistence)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Storage(format!("{err:#}"))
    }
}

/// Result type using KernelError
pub type KernelResult<T> = std::result::Result<T, KernelError>;

/// Execution log errors
#[derive(Debug, Error)]
pub enum LogError {
    /// Append targeted a tick that has already been sealed
    #[error("Tick {tick} is sealed; appends go to open tick {open}")]
    SealedTick {
        /// Tick the caller tried to append to
        tick: Tick,
        /// Currently open tick
        open: Tick,
    },

    /// Append targeted a tick that is not open yet
    #[error("Tick {tick} is not open yet; appends go to open tick {open}")]
    FutureTick {
        /// Tick the caller tried to append to
        tick: Tick,
        /// Currently open tick
        open: Tick,
    },

    /// Segment was never sealed
    #[error("Segment for tick {0} not found")]
    SegmentNotFound(Tick),

    /// Sealed segments do not form a contiguous run from tick 0
    #[error("Tick gap in log: expected tick {expected}, found {found}")]
    Gap {
        /// Next tick the log expected
        expected: Tick,
        /// Tick actually found
        found: Tick,
    },

    /// Segment contents disagree with their sealed header
    #[error("Corrupted segment for tick {tick}: {detail}")]
    Corrupted {
        /// Affected tick
        tick: Tick,
        /// Description of the corruption
        detail: String,
    },

    /// Encoding error
    #[error("Record encoding failed: {0}")]
    Encoding(String),

    /// Decoding error
    #[error("Record decoding failed: {0}")]
    Decoding(String),

    /// Atomic write helper failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for log operations
pub type LogResult<T> = std::result::Result<T, LogError>;

/// Domain failure reported by a handler.
///
/// Converted to `ERROR: ...` output at the dispatch boundary; never
/// propagated past it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Command is missing something the handler needs
    #[error("{0}")]
    Usage(String),

    /// Handler could not complete the request
    #[error("{0}")]
    Failed(String),
}

/// Convenience result alias for handler execution
pub type HandlerResult = std::result::Result<String, HandlerError>;

/// Wake condition evaluation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    /// Predicate name is not known to the evaluator
    #[error("Unknown predicate '{0}'")]
    UnknownPredicate(String),

    /// Wrong number of arguments
    #[error("Predicate '{predicate}' expects {expected}, got {found} argument(s)")]
    Arity {
        /// Predicate name
        predicate: String,
        /// Human readable expectation
        expected: &'static str,
        /// Number of arguments given
        found: usize,
    },

    /// Argument has the wrong shape or cannot be interpreted
    #[error("Invalid argument to '{predicate}': {detail}")]
    InvalidArgument {
        /// Predicate name
        predicate: String,
        /// Description
        detail: String,
    },

    /// The sealed log could not be read during evaluation
    #[error("Log unavailable during evaluation: {0}")]
    Log(String),
}

/// Convenience result alias for condition evaluation
pub type ConditionResult<T> = std::result::Result<T, ConditionError>;
