//! O Kernel – a tick-driven execution kernel for addressable entities
//!
//! Entities (humans, scripts, model-backed agents) coordinate only through a
//! shared, append-only log, using a small backslash-prefixed command language.
//! This crate provides:
//! - A parser turning `\verb ... ---` text into immutable command trees
//! - A stateless dispatcher routing commands to registered handlers
//! - A tick-segmented execution log with hash-chained segments and
//!   deterministic replay into derived views
//! - A wake scheduler that suspends entities on temporal and relational
//!   conditions and resumes them exactly once

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Command language: syntax tree and parser
pub mod grammar;

/// Kernel core: log, dispatcher, scheduler and tick loop
pub mod runtime;

// Re-export key types for convenience
pub use grammar::{Command, Node, ParseError, parse};
pub use runtime::device::DeviceSet;
pub use runtime::error::{KernelError, KernelResult};
pub use runtime::record::{EntityId, ExecutionRecord, SpaceId, Tick};
pub use runtime::registry::{HandlerRegistry, Invocation};
pub use runtime::{Kernel, KernelConfig, RegistryBuilder, TickReport};

/// Current version of the O kernel
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version of the command language accepted by [`parse`]
pub const GRAMMAR_VERSION: &str = "1.0.0";
