//! Braid – a work-stealing execution engine for structured concurrent orchestration
//!
//! This crate runs compiled combinator graphs with:
//! - Fork, sequence, prune, otherwise and catch combinators over sites and
//!   recursive definitions
//! - One-shot futures organized in cancellation trees (groups) paired with
//!   regions that fire exactly once when their extent empties
//! - A blocking protocol that parks strands on futures instead of native stacks
//! - Per-worker Arora–Blumofe–Plaxton deques with stealing and a global injector
//! - A bounded token pool for admission control
//! - A non-blocking lifecycle trace stream

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Runtime engine modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::error::{EngineError, ProgramError, SiteError, TokenError, TokenFault};
pub use runtime::node::{Arg, Def, Literal, Node, NodeId, Program, ProgramBuilder, SourceLocation};
pub use runtime::site::{Site, SiteCall, SiteRegistry};
pub use runtime::value::Value;
pub use runtime::{
    CollectingHandler, Engine, EngineBuilder, EngineConfig, EngineHandler, EngineStatus,
    HaltReason, StdoutHandler,
};

/// Current version of the Braid engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
