//! Built-in kernel verbs
//!
//! `\wake ?(cond) [$(\cmd ---)] [prompt] ---` suspends the executor until
//! `cond` holds. The handler only validates and acknowledges; the record it
//! produces *is* the registration, which the scheduler folds out of the log.

use super::error::{HandlerError, HandlerResult};
use super::registry::{Handler, Invocation};
use super::record::ExecutionRecord;
use crate::grammar::{Command, ConditionExpr, Node};

/// Verb that registers a wake condition.
pub const WAKE_VERB: &str = "wake";

/// Default verb of resume commands.
pub const RESUME_VERB: &str = "resume";

const WAKE_USAGE: &str = "Usage: \\wake ?(condition) [$(\\command ---)] [prompt] ---";

/// What a `\wake` command asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeRequest {
    /// Condition to wait for
    pub condition: ConditionExpr,
    /// Command to run for the executor once it holds
    pub resume: Command,
}

impl WakeRequest {
    /// Extract a request from a `\wake` command.
    ///
    /// The resume command is the first query node; without one the text
    /// following the condition is wrapped into `\resume <text> ---`.
    pub fn from_command(command: &Command) -> Option<Self> {
        if command.verb != WAKE_VERB {
            return None;
        }
        let condition = command.condition()?.clone();
        let resume = match command.queries().next() {
            Some(query) => query.clone(),
            None => {
                let prompt = command
                    .nodes
                    .iter()
                    .skip_while(|node| !matches!(node, Node::Condition(_)))
                    .filter_map(|node| match node {
                        Node::Text(text) => Some(text.trim()),
                        _ => None,
                    })
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                let nodes = if prompt.is_empty() {
                    Vec::new()
                } else {
                    vec![Node::Text(format!("{prompt} "))]
                };
                Command::new(RESUME_VERB, nodes)
            }
        };
        Some(Self { condition, resume })
    }

    /// Registration carried by a sealed record, if it is one.
    ///
    /// Failed records and kernel records never register anything.
    pub fn from_record(record: &ExecutionRecord) -> Option<Self> {
        if record.is_failure() || record.is_kernel() {
            return None;
        }
        Self::from_command(&record.command)
    }
}

/// Handler for `\wake`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeHandler;

impl Handler for WakeHandler {
    fn execute(&self, invocation: &Invocation<'_>) -> HandlerResult {
        if invocation.executor.is_kernel() {
            return Err(HandlerError::Failed("The kernel cannot wait on itself".into()));
        }
        let request = WakeRequest::from_command(invocation.command)
            .ok_or_else(|| HandlerError::Usage(WAKE_USAGE.into()))?;

        Ok(format!(
            "{} waiting on ?({}), then {}",
            invocation.executor, request.condition, request.resume
        ))
    }
}

/// Handler for the default resume command.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResumeHandler;

impl Handler for ResumeHandler {
    fn execute(&self, invocation: &Invocation<'_>) -> HandlerResult {
        let prompt = invocation.command.text();
        if prompt.is_empty() {
            Ok(format!("Resumed {}", invocation.executor))
        } else {
            Ok(format!("Resumed {}: {}", invocation.executor, prompt))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::parse;
    use crate::runtime::journal::LogReader;
    use crate::runtime::record::EntityId;

    fn run(handler: &dyn Handler, executor: &str, text: &str) -> HandlerResult {
        let command = parse(text).unwrap();
        let executor = EntityId::parse(executor).unwrap();
        let log = LogReader::default();
        handler.execute(&Invocation {
            command: &command,
            executor: &executor,
            tick: 3,
            log: &log,
        })
    }

    #[test]
    fn test_resume_defaults_to_prompt() {
        let command = parse(r"\wake ?(sleep(2)) check the inbox ---").unwrap();
        let request = WakeRequest::from_command(&command).unwrap();
        assert_eq!(request.resume.to_string(), r"\resume check the inbox ---");
        assert_eq!(parse(&request.resume.to_string()).unwrap(), request.resume);

        let bare = parse(r"\wake ?(up) ---").unwrap();
        let request = WakeRequest::from_command(&bare).unwrap();
        assert_eq!(request.resume.to_string(), r"\resume ---");
    }

    #[test]
    fn test_prompt_skips_text_before_condition() {
        let command = parse(r"\wake until then ?(up) pick up @bob where we left off ---").unwrap();
        let request = WakeRequest::from_command(&command).unwrap();
        assert_eq!(request.resume.to_string(), r"\resume pick up where we left off ---");

        let leading_only = parse(r"\wake later ?(sleep(1)) ---").unwrap();
        let request = WakeRequest::from_command(&leading_only).unwrap();
        assert_eq!(request.resume.to_string(), r"\resume ---");
    }

    #[test]
    fn test_query_overrides_resume() {
        let command = parse(r"\wake ?(from(@bob)) $(\say @bob thanks ---) ignored ---").unwrap();
        let request = WakeRequest::from_command(&command).unwrap();
        assert_eq!(request.resume.verb, "say");
        assert_eq!(request.resume.text(), "thanks");
    }

    #[test]
    fn test_wake_requires_condition() {
        let err = run(&WakeHandler, "alice", r"\wake later ---").unwrap_err();
        assert!(matches!(err, HandlerError::Usage(_)));

        let ok = run(&WakeHandler, "alice", r"\wake ?(sleep(3)) ---").unwrap();
        assert_eq!(ok, r"@alice waiting on ?(sleep(3)), then \resume ---");

        let kernel = run(&WakeHandler, "kernel", r"\wake ?(up) ---");
        assert!(kernel.is_err());
    }

    #[test]
    fn test_resume_acknowledges() {
        assert_eq!(run(&ResumeHandler, "alice", r"\resume ---").unwrap(), "Resumed @alice");
        assert_eq!(
            run(&ResumeHandler, "alice", r"\resume check ---").unwrap(),
            "Resumed @alice: check"
        );
    }
}
