//! Wake condition predicates and their evaluation
//!
//! The parser leaves predicate names and arguments uninterpreted. Here a
//! [`ConditionExpr`] is compiled into a typed [`Condition`] tree and
//! evaluated by structural recursion over a read-only [`Snapshot`] of the
//! sealed log. Compilation errors surface as [`ConditionError`] and mark the
//! registration failed.

use chrono::{DateTime, TimeDelta, Utc};
use std::ops::ControlFlow;

use super::error::{ConditionError, ConditionResult};
use super::journal::LogReader;
use super::record::{EntityId, ExecutionRecord, SpaceId, Tick};
use super::scheduler::WakeRegistration;
use super::views::SpaceDirectory;
use crate::grammar::{Arg, ConditionExpr, PredicateCall};

/// Atomic wake predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Always true
    Up,
    /// At least N ticks since registration
    SleepTicks(u64),
    /// At least this much wall-clock time since registration
    SleepFor(TimeDelta),
    /// Wall-clock time has reached this instant
    SleepUntil(DateTime<Utc>),
    /// Entity has addressed the registrant since registration
    From(EntityId),
    /// Incoming messages since registration reached a threshold
    Nbox {
        /// Only count messages from this sender
        sender: Option<EntityId>,
        /// Messages required
        threshold: usize,
    },
    /// Entity has written to a public stream since registration
    Published(EntityId),
}

/// Typed condition tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Single predicate
    Atom(Predicate),
    /// All operands hold
    And(Vec<Condition>),
    /// Any operand holds
    Or(Vec<Condition>),
    /// Operand does not hold right now
    Not(Box<Condition>),
}

impl Condition {
    /// Interpret a parsed expression.
    pub fn compile(expr: &ConditionExpr) -> ConditionResult<Self> {
        Ok(match expr {
            ConditionExpr::Predicate(call) => Condition::Atom(Predicate::compile(call)?),
            ConditionExpr::And(operands) => Condition::And(compile_all(operands)?),
            ConditionExpr::Or(operands) => Condition::Or(compile_all(operands)?),
            ConditionExpr::Not(operand) => Condition::Not(Box::new(Condition::compile(operand)?)),
        })
    }

    /// Evaluate against the snapshot, short-circuiting `And`/`Or`.
    pub fn evaluate(&self, subject: &WakeRegistration, snapshot: &Snapshot<'_>) -> bool {
        match self {
            Condition::Atom(predicate) => predicate.evaluate(subject, snapshot),
            Condition::And(operands) => operands.iter().all(|c| c.evaluate(subject, snapshot)),
            Condition::Or(operands) => operands.iter().any(|c| c.evaluate(subject, snapshot)),
            Condition::Not(operand) => !operand.evaluate(subject, snapshot),
        }
    }
}

fn compile_all(operands: &[ConditionExpr]) -> ConditionResult<Vec<Condition>> {
    operands.iter().map(Condition::compile).collect()
}

/// Read-only state a condition is evaluated against.
pub struct Snapshot<'a> {
    /// Most recently sealed tick
    pub tick: Tick,
    /// Seal time of that tick
    pub now: DateTime<Utc>,
    /// Sealed history
    pub log: &'a LogReader,
    /// Space membership as of `tick`
    pub spaces: &'a SpaceDirectory,
    /// Verbs that count as publishing
    pub public_verbs: &'a [String],
}

impl Snapshot<'_> {
    /// Count sealed records after the registration, up to and including
    /// `tick`, that match `accept`. Stops early once `limit` is reached.
    ///
    /// Records are borrowed from the log; failures and kernel markers are
    /// never counted.
    fn count_since<F>(&self, subject: &WakeRegistration, limit: usize, mut accept: F) -> usize
    where
        F: FnMut(&ExecutionRecord) -> bool,
    {
        if limit == 0 {
            return 0;
        }
        let mut count = 0;
        self.log.scan_after(subject.id.position(), self.tick, |record| {
            if !record.is_failure() && !record.is_kernel() && accept(record) {
                count += 1;
                if count >= limit {
                    return ControlFlow::Break(());
                }
            }
            ControlFlow::Continue(())
        });
        count
    }

    fn any_since<F>(&self, subject: &WakeRegistration, accept: F) -> bool
    where
        F: FnMut(&ExecutionRecord) -> bool,
    {
        self.count_since(subject, 1, accept) > 0
    }

    /// Messages from other entities that address the registrant.
    fn is_incoming(&self, subject: &WakeRegistration, record: &ExecutionRecord) -> bool {
        record.executor != subject.entity && addresses(record, &subject.entity, self.spaces)
    }
}

/// Whether a record addresses `entity` directly or through a space it belongs to.
pub fn addresses(record: &ExecutionRecord, entity: &EntityId, spaces: &SpaceDirectory) -> bool {
    record
        .command
        .entity_refs()
        .any(|name| name == entity.as_str())
        || record
            .command
            .space_refs()
            .any(|space| spaces.is_member(&SpaceId::named(space), entity))
}

/// Evaluate a registration's condition.
pub fn evaluate(subject: &WakeRegistration, snapshot: &Snapshot<'_>) -> ConditionResult<bool> {
    let condition = Condition::compile(&subject.condition)?;
    Ok(condition.evaluate(subject, snapshot))
}

impl Predicate {
    /// Interpret one predicate call. Names are case-insensitive.
    pub fn compile(call: &PredicateCall) -> ConditionResult<Self> {
        let name = call.name.to_ascii_lowercase();
        let args = call.args.as_slice();

        match name.as_str() {
            "up" => {
                expect_arity(&name, args, "no arguments", 0..=0)?;
                Ok(Predicate::Up)
            }
            "sleep" => {
                expect_arity(&name, args, "1 argument", 1..=1)?;
                parse_sleep(&name, word(&name, &args[0])?)
            }
            "from" | "response" => {
                expect_arity(&name, args, "1 argument", 1..=1)?;
                Ok(Predicate::From(entity(&name, &args[0])?))
            }
            "nbox" => {
                let (sender, threshold) = match args {
                    [threshold] => (None, threshold),
                    [sender, threshold] => (Some(entity(&name, sender)?), threshold),
                    _ => {
                        return Err(ConditionError::Arity {
                            predicate: name.clone(),
                            expected: "1 or 2 arguments",
                            found: args.len(),
                        });
                    }
                };
                let threshold = word(&name, threshold)?
                    .parse()
                    .map_err(|_| invalid(&name, "threshold must be a non-negative integer"))?;
                Ok(Predicate::Nbox { sender, threshold })
            }
            "published" => {
                expect_arity(&name, args, "1 argument", 1..=1)?;
                Ok(Predicate::Published(entity(&name, &args[0])?))
            }
            _ => Err(ConditionError::UnknownPredicate(call.name.clone())),
        }
    }

    fn evaluate(&self, subject: &WakeRegistration, snapshot: &Snapshot<'_>) -> bool {
        match self {
            Predicate::Up => true,
            Predicate::SleepTicks(ticks) => {
                snapshot.tick.saturating_sub(subject.registered_tick) >= *ticks
            }
            Predicate::SleepFor(duration) => snapshot.now - subject.registered_at >= *duration,
            Predicate::SleepUntil(instant) => snapshot.now >= *instant,
            Predicate::From(sender) => snapshot.any_since(subject, |record| {
                &record.executor == sender && snapshot.is_incoming(subject, record)
            }),
            Predicate::Nbox { sender, threshold } => {
                let count = snapshot.count_since(subject, *threshold, |record| {
                    sender.as_ref().is_none_or(|s| &record.executor == s)
                        && snapshot.is_incoming(subject, record)
                });
                count >= *threshold
            }
            Predicate::Published(author) => snapshot.any_since(subject, |record| {
                &record.executor == author
                    && snapshot
                        .public_verbs
                        .iter()
                        .any(|verb| verb == &record.command.verb)
            }),
        }
    }
}

fn expect_arity(
    name: &str,
    args: &[Arg],
    expected: &'static str,
    allowed: std::ops::RangeInclusive<usize>,
) -> ConditionResult<()> {
    if allowed.contains(&args.len()) {
        Ok(())
    } else {
        Err(ConditionError::Arity {
            predicate: name.to_string(),
            expected,
            found: args.len(),
        })
    }
}

fn invalid(name: &str, detail: impl Into<String>) -> ConditionError {
    ConditionError::InvalidArgument {
        predicate: name.to_string(),
        detail: detail.into(),
    }
}

fn word<'a>(name: &str, arg: &'a Arg) -> ConditionResult<&'a str> {
    match arg {
        Arg::Word(word) => Ok(word),
        other => Err(invalid(name, format!("expected a value, got '{other}'"))),
    }
}

fn entity(name: &str, arg: &Arg) -> ConditionResult<EntityId> {
    match arg {
        Arg::Entity(entity) => EntityId::parse(entity)
            .ok_or_else(|| invalid(name, format!("invalid entity name '{entity}'"))),
        other => Err(invalid(name, format!("expected an entity reference, got '{other}'"))),
    }
}

/// `N`/`Nt` ticks, `Ns`/`Nm`/`Nh`/`Nd` wall-clock, `until=<unix|RFC3339>`.
fn parse_sleep(name: &str, arg: &str) -> ConditionResult<Predicate> {
    if let Some(instant) = arg.strip_prefix("until=") {
        return parse_instant(instant)
            .map(Predicate::SleepUntil)
            .ok_or_else(|| invalid(name, format!("cannot read '{instant}' as unix seconds or RFC 3339")));
    }

    let split = arg
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(arg.len());
    let (digits, unit) = arg.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| invalid(name, format!("cannot read duration '{arg}'")))?;

    let seconds = |scale: u64| {
        amount
            .checked_mul(scale)
            .and_then(|secs| i64::try_from(secs).ok())
            .and_then(TimeDelta::try_seconds)
            .map(Predicate::SleepFor)
            .ok_or_else(|| invalid(name, format!("duration '{arg}' is out of range")))
    };

    match unit {
        "" | "t" => Ok(Predicate::SleepTicks(amount)),
        "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(3_600),
        "d" => seconds(86_400),
        _ => Err(invalid(name, format!("unknown duration unit '{unit}'"))),
    }
}

fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(seconds) = text.parse::<i64>() {
        return DateTime::from_timestamp(seconds, 0);
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|instant| instant.with_timezone(&Utc))
}
