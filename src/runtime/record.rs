//! Execution records, identifiers, and deterministic segment hashing
//!
//! An [`ExecutionRecord`] is the unit of history: who ran which command at
//! which tick and what came out. Records are grouped into tick segments whose
//! digests are chained with Blake3, so two logs with equal digests hold the
//! same records in the same order.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::grammar::{Command, is_valid_name};

/// Discrete global time step.
pub type Tick = u64;

/// Output prefix marking a failed execution.
pub const ERROR_PREFIX: &str = "ERROR:";

/// Reserved executor for records written by the kernel itself.
pub const KERNEL_EXECUTOR: &str = "kernel";

/// Digest preceding the first segment of every log.
pub const GENESIS_DIGEST: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Addressable entity name (stored without the `@` sigil).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Parse an entity name, accepting an optional leading `@`.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix('@').unwrap_or(name);
        is_valid_name(name).then(|| Self(name.to_string()))
    }

    /// The reserved kernel identity.
    pub fn kernel() -> Self {
        Self(KERNEL_EXECUTOR.to_string())
    }

    /// Whether this is the reserved kernel identity.
    pub fn is_kernel(&self) -> bool {
        self.0 == KERNEL_EXECUTOR
    }

    /// Name without sigil.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Space identifier: a named space or a composite of entity names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpaceId(String);

impl SpaceId {
    /// A space addressed by name (`#general`).
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Entity-addressed space for a participant set.
    ///
    /// Names are sorted and de-duplicated before joining with `-`, so the
    /// same set always maps to the same id no matter who computes it.
    pub fn composite<'a>(members: impl IntoIterator<Item = &'a EntityId>) -> Self {
        let mut names: Vec<&str> = members.into_iter().map(EntityId::as_str).collect();
        names.sort_unstable();
        names.dedup();
        Self(names.join("-"))
    }

    /// Identifier without sigil.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Location of a record: its tick and its index within the tick segment.
///
/// Ordering follows log order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordPosition {
    /// Tick of the segment
    pub tick: Tick,
    /// Index within the segment
    pub index: usize,
}

impl RecordPosition {
    /// Create a position.
    pub fn new(tick: Tick, index: usize) -> Self {
        Self { tick, index }
    }
}

impl fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tick, self.index)
    }
}

impl FromStr for RecordPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tick, index) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <tick>:<index>, got '{s}'"))?;
        let tick = tick
            .parse()
            .map_err(|_| format!("invalid tick in '{s}'"))?;
        let index = index
            .parse()
            .map_err(|_| format!("invalid index in '{s}'"))?;
        Ok(Self { tick, index })
    }
}

/// A single command execution.
///
/// Once its tick is sealed a record is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Tick the command ran in
    pub tick: Tick,
    /// Entity that ran it
    pub executor: EntityId,
    /// Parsed command
    pub command: Command,
    /// Handler output (or `ERROR: ...`)
    pub output: String,
    /// Wall-clock time of execution
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Create a new record.
    pub fn new(
        tick: Tick,
        executor: EntityId,
        command: Command,
        output: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            tick,
            executor,
            command,
            output: output.into(),
            timestamp,
        }
    }

    /// Whether this execution failed (its output carries the error prefix).
    pub fn is_failure(&self) -> bool {
        self.output.starts_with(ERROR_PREFIX)
    }

    /// Whether the kernel wrote this record.
    pub fn is_kernel(&self) -> bool {
        self.executor.is_kernel()
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn encode_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from a single JSON line.
    pub fn decode_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}

/// Header written when a tick segment is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Sealed tick
    pub tick: Tick,
    /// Number of records in the segment
    pub records: usize,
    /// Wall-clock seal time; "now" for wall-clock wake conditions
    pub sealed_at: DateTime<Utc>,
    /// Digest of the previous segment (or [`GENESIS_DIGEST`])
    pub prev_digest: String,
    /// Chained digest of this segment
    pub digest: String,
}

/// Compute the chained digest for a segment's encoded record lines.
pub fn compute_segment_digest(prev_digest: &str, tick: Tick, lines: &[String]) -> String {
    let mut hasher = Hasher::new();
    hasher.update(prev_digest.as_bytes());
    hasher.update(&tick.to_le_bytes());
    for line in lines {
        hasher.update(&(line.len() as u64).to_le_bytes());
        hasher.update(line.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
