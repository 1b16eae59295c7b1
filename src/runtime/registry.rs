//! Verb handler registry and dispatcher
//!
//! Handlers are collected by a [`RegistryBuilder`] at startup and frozen into
//! an immutable [`HandlerRegistry`] snapshot. Dispatch is a pure function of
//! the command, its executor and that snapshot; it never fails the caller.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::error::HandlerResult;
use super::handlers::{RESUME_VERB, ResumeHandler, WAKE_VERB, WakeHandler};
use super::journal::LogReader;
use super::record::{ERROR_PREFIX, EntityId, Tick};
use crate::grammar::Command;

/// Everything a handler may look at while executing one command.
///
/// The log reader only exposes sealed ticks.
pub struct Invocation<'a> {
    /// Parsed command
    pub command: &'a Command,
    /// Entity running it
    pub executor: &'a EntityId,
    /// Tick it runs in
    pub tick: Tick,
    /// Sealed history
    pub log: &'a LogReader,
}

/// Implementation of one verb.
pub trait Handler: Send + Sync {
    /// Run the command and return its output.
    fn execute(&self, invocation: &Invocation<'_>) -> HandlerResult;
}

struct FnHandler<F>(F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Invocation<'_>) -> HandlerResult + Send + Sync,
{
    fn execute(&self, invocation: &Invocation<'_>) -> HandlerResult {
        (self.0)(invocation)
    }
}

/// Mutable collection of handlers, used only before startup.
pub struct RegistryBuilder {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl RegistryBuilder {
    /// Builder preloaded with the kernel's own `wake` and `resume` verbs.
    pub fn new() -> Self {
        let mut builder = Self::empty();
        builder
            .register(WAKE_VERB, WakeHandler)
            .register(RESUME_VERB, ResumeHandler);
        builder
    }

    /// Builder with no handlers at all.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register (or replace) the handler for `verb`.
    pub fn register<H>(&mut self, verb: impl Into<String>, handler: H) -> &mut Self
    where
        H: Handler + 'static,
    {
        self.handlers.insert(verb.into(), Arc::new(handler));
        self
    }

    /// Register a closure as the handler for `verb`.
    pub fn register_fn<F>(&mut self, verb: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Invocation<'_>) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(verb, FnHandler(handler))
    }

    /// Freeze the current handlers into an immutable registry.
    pub fn build(&self) -> HandlerRegistry {
        HandlerRegistry {
            handlers: Arc::new(self.handlers.clone()),
        }
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable verb → handler mapping shared by the tick loop.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Arc<HashMap<String, Arc<dyn Handler>>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("verbs", &self.verbs())
            .finish()
    }
}

/// How a dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handler returned normally
    Completed,
    /// No handler for the verb
    UnknownCommand,
    /// Handler returned an error or panicked
    HandlerFailed,
}

/// Output of a dispatch, ready to be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Text to record as the command's output
    pub output: String,
    /// How the dispatch ended
    pub outcome: Outcome,
}

impl HandlerRegistry {
    /// Whether a handler is registered for `verb`.
    pub fn has_verb(&self, verb: &str) -> bool {
        self.handlers.contains_key(verb)
    }

    /// Registered verbs, sorted.
    pub fn verbs(&self) -> Vec<String> {
        let mut verbs: Vec<String> = self.handlers.keys().cloned().collect();
        verbs.sort();
        verbs
    }

    /// Route a command to its handler.
    ///
    /// Unknown verbs, handler errors and handler panics all come back as
    /// `ERROR:` output.
    pub fn dispatch(&self, invocation: &Invocation<'_>) -> Dispatched {
        let verb = invocation.command.verb.as_str();
        let Some(handler) = self.handlers.get(verb) else {
            tracing::warn!(verb, executor = %invocation.executor, "Unknown command");
            return Dispatched {
                output: format!("{ERROR_PREFIX} Unknown command '{verb}'"),
                outcome: Outcome::UnknownCommand,
            };
        };

        match panic::catch_unwind(AssertUnwindSafe(|| handler.execute(invocation))) {
            Ok(Ok(output)) => Dispatched {
                output,
                outcome: Outcome::Completed,
            },
            Ok(Err(err)) => {
                tracing::debug!(verb, executor = %invocation.executor, error = %err, "Handler failed");
                Dispatched {
                    output: format!("{ERROR_PREFIX} {err}"),
                    outcome: Outcome::HandlerFailed,
                }
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::warn!(verb, executor = %invocation.executor, panic = %message, "Handler panicked");
                Dispatched {
                    output: format!("{ERROR_PREFIX} Handler for '{verb}' panicked: {message}"),
                    outcome: Outcome::HandlerFailed,
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
