//! Derived views folded from the execution log
//!
//! Every piece of derived state (space membership, pending wakes) is a
//! [`LogView`]: a pure fold over sealed records. A [`Checkpoint`] caches a
//! view together with the first tick it has not seen yet and only replays
//! newly sealed ticks, so it always equals a full replay of the same prefix.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::journal::LogReader;
use super::record::{EntityId, ExecutionRecord, SpaceId, Tick};

/// Verb whose records define named spaces: `\name #space @(a, b) ---`.
pub const NAME_VERB: &str = "name";

/// A fold over execution records.
pub trait LogView: Sized {
    /// Incorporate the next record in log order.
    fn apply(self, record: &ExecutionRecord) -> Self;
}

/// A view plus the next tick it still has to replay.
#[derive(Debug, Clone, Default)]
pub struct Checkpoint<V> {
    view: V,
    next_tick: Tick,
}

impl<V: LogView + Default> Checkpoint<V> {
    /// Empty view positioned at tick 0.
    pub fn new() -> Self {
        Self {
            view: V::default(),
            next_tick: 0,
        }
    }

    /// The cached view.
    pub fn view(&self) -> &V {
        &self.view
    }

    /// First tick not yet folded in.
    pub fn next_tick(&self) -> Tick {
        self.next_tick
    }

    /// Fold every tick sealed since the last advance; returns how many.
    pub fn advance(&mut self, reader: &LogReader) -> u64 {
        let sealed = reader.sealed_len();
        if sealed <= self.next_tick {
            return 0;
        }
        let view = std::mem::take(&mut self.view);
        self.view = reader.replay(self.next_tick..sealed, view, |view, record| view.apply(record));
        let applied = sealed - self.next_tick;
        self.next_tick = sealed;
        applied
    }

    /// Take the view out.
    pub fn into_view(self) -> V {
        self.view
    }
}

/// Blake3 digest of a view's JSON encoding.
///
/// Views keep their maps ordered, so equal views always hash equally.
pub fn digest<V: Serialize>(view: &V) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(view)?;
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().to_hex().to_string())
}

/// Space membership derived from the log.
///
/// Named spaces come from `\name #space @(members) ---` and are replaced
/// wholesale on rename. Every other successful command that addresses
/// entities forms the composite space `{executor} ∪ targets`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceDirectory {
    spaces: BTreeMap<SpaceId, BTreeSet<EntityId>>,
}

impl SpaceDirectory {
    /// Members of a space, if it is known.
    pub fn members(&self, space: &SpaceId) -> Option<&BTreeSet<EntityId>> {
        self.spaces.get(space)
    }

    /// Whether `entity` belongs to `space`.
    pub fn is_member(&self, space: &SpaceId, entity: &EntityId) -> bool {
        self.spaces
            .get(space)
            .is_some_and(|members| members.contains(entity))
    }

    /// Spaces `entity` belongs to.
    pub fn spaces_of<'a>(&'a self, entity: &'a EntityId) -> impl Iterator<Item = &'a SpaceId> {
        self.spaces
            .iter()
            .filter(move |(_, members)| members.contains(entity))
            .map(|(space, _)| space)
    }

    /// Number of known spaces.
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// Whether no spaces are known.
    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }
}

impl LogView for SpaceDirectory {
    fn apply(mut self, record: &ExecutionRecord) -> Self {
        if record.is_failure() || record.is_kernel() {
            return self;
        }

        let targets: BTreeSet<EntityId> = record
            .command
            .entity_refs()
            .filter_map(EntityId::parse)
            .collect();
        if targets.is_empty() {
            return self;
        }

        // Only the first space reference is named; any others are plain text.
        if record.command.verb == NAME_VERB {
            if let Some(space) = record.command.space_refs().next() {
                self.spaces.insert(SpaceId::named(space), targets);
            }
            return self;
        }

        let mut members = targets;
        members.insert(record.executor.clone());
        let composite = SpaceId::composite(&members);
        self.spaces.entry(composite).or_default().extend(members);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::parse;
    use crate::runtime::journal::ExecutionLog;
    use chrono::Utc;

    fn entity(name: &str) -> EntityId {
        EntityId::parse(name).unwrap()
    }

    fn run(log: &mut ExecutionLog, executor: &str, text: &str, output: &str) {
        let tick = log.open_tick();
        log.append(tick, entity(executor), parse(text).unwrap(), output, Utc::now())
            .unwrap();
    }

    #[test]
    fn test_named_and_composite_spaces() {
        let mut log = ExecutionLog::in_memory();
        run(&mut log, "alice", r"\name #family @(alice, bob) ---", "Named #family");
        run(&mut log, "carol", r"\say @(bob, alice) hi ---", "Sent");
        run(&mut log, "dave", r"\say @alice nope ---", "ERROR: Unknown command 'say'");
        log.seal_tick(Utc::now()).unwrap();

        let spaces: SpaceDirectory = log.reader().fold_view(..);
        let family = SpaceId::named("family");
        assert!(spaces.is_member(&family, &entity("bob")));
        assert!(!spaces.is_member(&family, &entity("carol")));

        let composite = SpaceId::composite([&entity("carol"), &entity("alice"), &entity("bob")]);
        assert_eq!(spaces.members(&composite).map(|m| m.len()), Some(3));
        assert_eq!(spaces.len(), 2);
        assert_eq!(spaces.spaces_of(&entity("dave")).count(), 0);
    }

    #[test]
    fn test_rename_replaces_members() {
        let mut log = ExecutionLog::in_memory();
        run(&mut log, "alice", r"\name #team @(alice, bob) ---", "ok");
        run(&mut log, "alice", r"\name #team @(carol, dave) ---", "ok");
        log.seal_tick(Utc::now()).unwrap();

        let spaces: SpaceDirectory = log.reader().fold_view(..);
        let team = SpaceId::named("team");
        assert!(!spaces.is_member(&team, &entity("alice")));
        assert!(spaces.is_member(&team, &entity("dave")));
    }

    #[test]
    fn test_name_assigns_first_space_only() {
        let mut log = ExecutionLog::in_memory();
        run(&mut log, "alice", r"\name #team #ops @(alice, bob) ---", "ok");
        log.seal_tick(Utc::now()).unwrap();

        let spaces: SpaceDirectory = log.reader().fold_view(..);
        assert!(spaces.is_member(&SpaceId::named("team"), &entity("bob")));
        assert!(spaces.members(&SpaceId::named("ops")).is_none());
        assert_eq!(spaces.len(), 1);
    }

    #[test]
    fn test_checkpoint_matches_full_replay() {
        let mut log = ExecutionLog::in_memory();
        let reader = log.reader();
        let mut checkpoint: Checkpoint<SpaceDirectory> = Checkpoint::new();

        for (tick, who) in ["bob", "carol", "dave"].iter().enumerate() {
            run(&mut log, "alice", &format!("\\say @{who} hi ---"), "ok");
            log.seal_tick(Utc::now()).unwrap();
            assert_eq!(checkpoint.advance(&reader), 1);
            assert_eq!(checkpoint.next_tick(), tick as Tick + 1);
        }
        assert_eq!(checkpoint.advance(&reader), 0);

        let full: SpaceDirectory = reader.fold_view(..);
        assert_eq!(checkpoint.view(), &full);
        assert_eq!(digest(checkpoint.view()).unwrap(), digest(&full).unwrap());
    }
}
