//! Wake registrations and the suspend/resume state machine
//!
//! Registrations are never stored on the side. A successful `\wake` record
//! is a registration, and a kernel `\wake-resolved` or `\wake-failed` record
//! retires it, so the pending set is the [`WakeTable`] fold of the log.
//!
//! Evaluation runs after a tick is sealed. Resolutions produce a kernel
//! marker and a resume command, both destined for the next tick. Until that
//! tick is sealed the scheduler remembers which registrations it already
//! settled so none can fire twice.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::condition::{self, Snapshot};
use super::error::LogResult;
use super::handlers::WakeRequest;
use super::journal::LogReader;
use super::record::{ERROR_PREFIX, EntityId, ExecutionRecord, RecordPosition, Tick};
use super::views::{Checkpoint, LogView, SpaceDirectory};
use crate::grammar::{Command, ConditionExpr, Node};

/// Kernel verb marking a satisfied registration.
pub const WAKE_RESOLVED_VERB: &str = "wake-resolved";

/// Kernel verb marking a registration whose condition could not be evaluated.
pub const WAKE_FAILED_VERB: &str = "wake-failed";

/// Identity of a registration: the position of its `\wake` record.
///
/// Serialized as `tick:index` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WakeId(RecordPosition);

impl WakeId {
    /// Wrap a record position.
    pub fn new(position: RecordPosition) -> Self {
        Self(position)
    }

    /// Position of the registering record.
    pub fn position(&self) -> RecordPosition {
        self.0
    }
}

impl fmt::Display for WakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<WakeId> for String {
    fn from(id: WakeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for WakeId {
    type Error = String;

    fn try_from(text: String) -> Result<Self, Self::Error> {
        text.parse().map(Self)
    }
}

/// Lifecycle of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WakeState {
    /// Condition not yet satisfied
    Pending,
    /// Condition satisfied; resume handed over exactly once
    Resolved,
    /// Condition could not be evaluated; resolved without resuming
    Failed(String),
}

/// A suspended entity waiting on a condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeRegistration {
    /// Registration identity
    pub id: WakeId,
    /// Entity to resume
    pub entity: EntityId,
    /// Condition to wait for
    pub condition: ConditionExpr,
    /// Command dispatched for `entity` on resolution
    pub resume: Command,
    /// Tick of the `\wake` record
    pub registered_tick: Tick,
    /// Timestamp of the `\wake` record
    pub registered_at: DateTime<Utc>,
    /// Current state
    pub state: WakeState,
}

impl WakeRegistration {
    /// Registration carried by the record at `position`, if any.
    pub fn from_record(position: RecordPosition, record: &ExecutionRecord) -> Option<Self> {
        let request = WakeRequest::from_record(record)?;
        Some(Self {
            id: WakeId::new(position),
            entity: record.executor.clone(),
            condition: request.condition,
            resume: request.resume,
            registered_tick: record.tick,
            registered_at: record.timestamp,
            state: WakeState::Pending,
        })
    }
}

/// Kernel marker command retiring a registration.
pub fn marker_command(verb: &str, registration: &WakeRegistration) -> Command {
    Command::new(
        verb,
        vec![
            Node::EntityRef(registration.entity.as_str().to_string()),
            Node::Text(format!("{} ", registration.id)),
        ],
    )
}

/// Registration retired by a kernel marker record, if it is one.
fn retired_by(record: &ExecutionRecord) -> Option<WakeId> {
    if !record.is_kernel() {
        return None;
    }
    let verb = record.command.verb.as_str();
    if verb != WAKE_RESOLVED_VERB && verb != WAKE_FAILED_VERB {
        return None;
    }
    record
        .command
        .text()
        .split_whitespace()
        .next()?
        .parse()
        .ok()
        .map(WakeId::new)
}

/// Pending registrations, folded from the log.
///
/// An entity waits on at most one condition: a later registration replaces
/// the entity's pending one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeTable {
    pending: BTreeMap<WakeId, WakeRegistration>,
    by_entity: BTreeMap<EntityId, WakeId>,
    #[serde(skip)]
    cursor: Option<RecordPosition>,
}

impl WakeTable {
    /// Pending registrations in registration order.
    pub fn pending(&self) -> impl Iterator<Item = &WakeRegistration> {
        self.pending.values()
    }

    /// Look up a pending registration.
    pub fn get(&self, id: &WakeId) -> Option<&WakeRegistration> {
        self.pending.get(id)
    }

    /// The pending registration of `entity`, if it is suspended.
    pub fn for_entity(&self, entity: &EntityId) -> Option<&WakeRegistration> {
        self.by_entity.get(entity).and_then(|id| self.pending.get(id))
    }

    /// Number of pending registrations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl LogView for WakeTable {
    fn apply(mut self, record: &ExecutionRecord) -> Self {
        // Replay visits records in order, so the index within a tick is
        // recovered by counting.
        let position = match self.cursor {
            Some(last) if last.tick == record.tick => RecordPosition::new(record.tick, last.index + 1),
            _ => RecordPosition::new(record.tick, 0),
        };
        self.cursor = Some(position);

        if let Some(registration) = WakeRegistration::from_record(position, record) {
            if let Some(replaced) = self
                .by_entity
                .insert(registration.entity.clone(), registration.id)
            {
                self.pending.remove(&replaced);
            }
            self.pending.insert(registration.id, registration);
        } else if let Some(id) = retired_by(record) {
            if let Some(retired) = self.pending.remove(&id) {
                self.by_entity.remove(&retired.entity);
            }
        }
        self
    }
}

/// Outcome of evaluating one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// The registration, with its final state
    pub registration: WakeRegistration,
    /// Kernel marker to append to the next tick
    pub marker: Command,
    /// Output of the marker record
    pub output: String,
}

impl Resolution {
    /// Resume command to dispatch, unless the registration failed.
    pub fn resume(&self) -> Option<(&EntityId, &Command)> {
        match self.registration.state {
            WakeState::Resolved => Some((&self.registration.entity, &self.registration.resume)),
            _ => None,
        }
    }
}

/// Owner of all wake registrations.
#[derive(Debug, Clone)]
pub struct WakeScheduler {
    wakes: Checkpoint<WakeTable>,
    spaces: Checkpoint<SpaceDirectory>,
    settled: BTreeSet<WakeId>,
    public_verbs: Vec<String>,
}

impl WakeScheduler {
    /// Create a scheduler; `public_verbs` feed `published(...)`.
    pub fn new(public_verbs: Vec<String>) -> Self {
        Self {
            wakes: Checkpoint::new(),
            spaces: Checkpoint::new(),
            settled: BTreeSet::new(),
            public_verbs,
        }
    }

    /// Fold newly sealed ticks into the cached views.
    pub fn catch_up(&mut self, log: &LogReader) {
        let applied = self.wakes.advance(log);
        self.spaces.advance(log);
        if applied > 0 {
            let table = self.wakes.view();
            self.settled.retain(|id| table.get(id).is_some());
            tracing::debug!(
                pending = table.len(),
                next_tick = self.wakes.next_tick(),
                "Wake table advanced"
            );
        }
    }

    /// Registrations still waiting, in registration order.
    pub fn pending(&self) -> impl Iterator<Item = &WakeRegistration> {
        self.wakes
            .view()
            .pending()
            .filter(|registration| !self.settled.contains(&registration.id))
    }

    /// Space membership as of the last sealed tick seen.
    pub fn spaces(&self) -> &SpaceDirectory {
        self.spaces.view()
    }

    /// Evaluate every pending registration against the last sealed tick.
    ///
    /// Satisfied and failed registrations leave the pending set at once and
    /// are returned in registration order.
    pub fn evaluate(&mut self, log: &LogReader) -> LogResult<Vec<Resolution>> {
        self.catch_up(log);
        let Some(tick) = log.sealed_head() else {
            return Ok(Vec::new());
        };
        let now = log.read_segment(tick)?.header.sealed_at;

        let snapshot = Snapshot {
            tick,
            now,
            log,
            spaces: self.spaces.view(),
            public_verbs: &self.public_verbs,
        };

        let mut resolutions = Vec::new();
        for registration in self.pending() {
            let (state, verb, output) = match condition::evaluate(registration, &snapshot) {
                Ok(false) => continue,
                Ok(true) => {
                    tracing::info!(
                        tick,
                        wake = %registration.id,
                        entity = %registration.entity,
                        "Wake condition satisfied"
                    );
                    let output = format!(
                        "Woke {} ({}), resuming with {}",
                        registration.entity, registration.id, registration.resume
                    );
                    (WakeState::Resolved, WAKE_RESOLVED_VERB, output)
                }
                Err(err) => {
                    tracing::warn!(
                        tick,
                        wake = %registration.id,
                        entity = %registration.entity,
                        error = %err,
                        "Wake condition failed"
                    );
                    let output = format!(
                        "{ERROR_PREFIX} Wake condition ?({}) for {} ({}) failed: {err}",
                        registration.condition, registration.entity, registration.id
                    );
                    (WakeState::Failed(err.to_string()), WAKE_FAILED_VERB, output)
                }
            };

            let marker = marker_command(verb, registration);
            resolutions.push(Resolution {
                registration: WakeRegistration {
                    state,
                    ..registration.clone()
                },
                marker,
                output,
            });
        }

        self.settled
            .extend(resolutions.iter().map(|resolution| resolution.registration.id));
        Ok(resolutions)
    }
}
