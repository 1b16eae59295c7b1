use serde::{Deserialize, Serialize};
use std::fmt;

use super::TERMINATOR;

/// A parsed command: `\verb node* ---`.
///
/// Immutable once parsed. The verb is kept apart from the node sequence so
/// handlers never have to strip it out of the first text run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    /// The identifier immediately after `\`.
    pub verb: String,
    /// Nodes in source order.
    pub nodes: Vec<Node>,
}

/// A single node of a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Node {
    /// Free text up to the next special token.
    Text(String),
    /// `@name`; `@(a, b)` expands to one node per name.
    EntityRef(String),
    /// `#name`; `#(a, b)` expands to one node per name.
    SpaceRef(String),
    /// `?( expr )`.
    Condition(ConditionExpr),
    /// `$( \cmd--- )`, one node per inner command.
    Query(Command),
}

/// Boolean expression over predicate calls.
///
/// Built once by the parser; the parser does not know which predicate names
/// are meaningful, that is decided when the expression is evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum ConditionExpr {
    /// A predicate call such as `sleep(3)` or `from(@bob)`.
    Predicate(PredicateCall),
    /// All operands must hold.
    And(Vec<ConditionExpr>),
    /// At least one operand must hold.
    Or(Vec<ConditionExpr>),
    /// Negation of the operand's current value.
    Not(Box<ConditionExpr>),
}

/// `name(arg, ...)`; a bare `name` has no arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PredicateCall {
    /// Predicate name as written.
    pub name: String,
    /// Arguments in source order.
    pub args: Vec<Arg>,
}

/// Predicate argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Arg {
    /// `@name`
    Entity(String),
    /// `#name`
    Space(String),
    /// Any other bare token (`3`, `30s`, `until=1700000000`).
    Word(String),
}

/// Character allowed inside entity, space and verb names.
pub(crate) fn is_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'
}

/// Check a name against `[alnum][alnum\-_]*`.
///
/// Names may not contain the `---` terminator, otherwise they could not be
/// written back out unambiguously.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(is_name_char) && !name.contains(TERMINATOR)
}

impl Command {
    /// Create a command from parts.
    pub fn new(verb: impl Into<String>, nodes: Vec<Node>) -> Self {
        Self {
            verb: verb.into(),
            nodes,
        }
    }

    /// Entity names referenced at the top level, in order.
    pub fn entity_refs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| match node {
            Node::EntityRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Space names referenced at the top level, in order.
    pub fn space_refs(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().filter_map(|node| match node {
            Node::SpaceRef(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// First condition node, if any.
    pub fn condition(&self) -> Option<&ConditionExpr> {
        self.nodes.iter().find_map(|node| match node {
            Node::Condition(expr) => Some(expr),
            _ => None,
        })
    }

    /// Inner commands of all query nodes, in order.
    pub fn queries(&self) -> impl Iterator<Item = &Command> {
        self.nodes.iter().filter_map(|node| match node {
            Node::Query(command) => Some(command),
            _ => None,
        })
    }

    /// Trimmed text runs joined with single spaces.
    pub fn text(&self) -> String {
        self.nodes
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.trim()),
                _ => None,
            })
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Command {
    /// Canonical rendering; parsing the output yields an equal command.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\\{}", self.verb)?;
        let mut after_text = false;
        for node in &self.nodes {
            if !after_text {
                f.write_str(" ")?;
            }
            write!(f, "{}", node)?;
            after_text = matches!(node, Node::Text(_));
        }
        if !after_text {
            f.write_str(" ")?;
        }
        f.write_str(TERMINATOR)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Text(text) => f.write_str(text),
            Node::EntityRef(name) => write!(f, "@{}", name),
            Node::SpaceRef(name) => write!(f, "#{}", name),
            Node::Condition(expr) => write!(f, "?({})", expr),
            Node::Query(command) => write!(f, "$({})", command),
        }
    }
}

impl fmt::Display for ConditionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionExpr::Predicate(call) => write!(f, "{}", call),
            ConditionExpr::And(operands) => {
                // `and` binds tighter than `or`, so only compound operands need parens.
                write_joined(f, operands, " and ", |op| {
                    matches!(op, ConditionExpr::And(_) | ConditionExpr::Or(_))
                })
            }
            ConditionExpr::Or(operands) => {
                write_joined(f, operands, " or ", |op| matches!(op, ConditionExpr::Or(_)))
            }
            ConditionExpr::Not(operand) => match operand.as_ref() {
                ConditionExpr::And(_) | ConditionExpr::Or(_) => write!(f, "not ({})", operand),
                _ => write!(f, "not {}", operand),
            },
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    operands: &[ConditionExpr],
    separator: &str,
    needs_parens: impl Fn(&ConditionExpr) -> bool,
) -> fmt::Result {
    for (index, operand) in operands.iter().enumerate() {
        if index > 0 {
            f.write_str(separator)?;
        }
        if needs_parens(operand) {
            write!(f, "({})", operand)?;
        } else {
            write!(f, "{}", operand)?;
        }
    }
    Ok(())
}

impl fmt::Display for PredicateCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Entity(name) => write!(f, "@{}", name),
            Arg::Space(name) => write!(f, "#{}", name),
            Arg::Word(word) => f.write_str(word),
        }
    }
}
