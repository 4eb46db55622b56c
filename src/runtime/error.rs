//! Error types for the Braid engine
//!
//! Domain errors use thiserror; `anyhow` is only used at the storage and CLI
//! boundary. Broken single-assignment invariants are not errors: they panic.

use std::fmt;
use std::io;
use thiserror::Error;

use super::node::{NodeId, SourceLocation};
use super::token::TokenId;
use super::value::Value;

/// Top-level engine error
#[derive(Debug, Error)]
pub enum EngineError {
    /// The program failed validation
    #[error("Program error: {0}")]
    Program(#[from] ProgramError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// `start` was called twice
    #[error("Engine already started")]
    AlreadyStarted,

    /// The root strand could not be admitted
    #[error("Token pool exhausted: {0}")]
    TokenLimit(#[from] TokenLimitReached),

    /// Initialization errors (threads, site runtime)
    #[error("Initialization failed: {0}")]
    Init(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Structural problems in a compiled node graph
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// Program contains no nodes
    #[error("Program has no nodes")]
    Empty,

    /// Root id is out of range
    #[error("Root node {0} does not exist")]
    MissingRoot(NodeId),

    /// A child reference is out of range
    #[error("Node {node} references missing node {target}")]
    DanglingNode {
        /// Referencing node
        node: NodeId,
        /// Missing child
        target: NodeId,
    },

    /// A node is reachable from itself
    #[error("Node {0} is reachable from itself")]
    Cycle(NodeId),

    /// A variable index exceeds the static scope depth
    #[error("Node {node} reads variable {index} but only {depth} are in scope")]
    UnboundVariable {
        /// Offending node
        node: NodeId,
        /// Variable index
        index: usize,
        /// Bindings in scope
        depth: usize,
    },

    /// A `Site` operand names a site the engine does not know
    #[error("Program references unknown site '{0}'")]
    UnknownSite(String),

    /// JSON decoding failed
    #[error("Program decoding failed: {0}")]
    Decode(String),
}

/// Admission failure: the token pool has no capacity left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("token limit of {capacity} live tokens reached")]
pub struct TokenLimitReached {
    /// Configured capacity
    pub capacity: usize,
}

/// Failures raised by site invocations
///
/// These are host errors: the interpreter wraps them into catchable
/// exception values with [`SiteError::into_value`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SiteError {
    /// Wrong number of arguments
    #[error("site '{site}' expects {expected} arguments, got {got}")]
    Arity {
        /// Site or definition name
        site: String,
        /// Expected argument count
        expected: usize,
        /// Supplied argument count
        got: usize,
    },

    /// Argument of the wrong type
    #[error("site '{site}' argument {index}: expected {expected}, found {found}")]
    ArgumentType {
        /// Site name
        site: String,
        /// Argument position
        index: usize,
        /// Expected type
        expected: &'static str,
        /// Supplied value type
        found: &'static str,
    },

    /// Name not present in the registry
    #[error("unknown site '{0}'")]
    UnknownSite(String),

    /// Call target is not a site or closure
    #[error("value {0} is not callable")]
    Uncallable(String),

    /// Integer division by zero
    #[error("division by zero in '{0}'")]
    DivisionByZero(String),

    /// Any other host failure
    #[error("{0}")]
    Failed(String),
}

impl SiteError {
    /// Wrap the error as a catchable exception value.
    pub fn into_value(self) -> Value {
        Value::error(self.to_string())
    }
}

/// Why a token died with an error
#[derive(Debug, Clone, Error)]
pub enum TokenFault {
    /// An exception escaped every handler
    #[error("uncaught exception: {0}")]
    Uncaught(Value),

    /// A fork or prune could not allocate a token
    #[error(transparent)]
    ResourceExhausted(#[from] TokenLimitReached),
}

/// Error reported once to the engine handler when a token dies abnormally
#[derive(Debug, Clone)]
pub struct TokenError {
    /// Token that died
    pub token: TokenId,
    /// Last source location the token passed
    pub location: Option<SourceLocation>,
    /// Cause
    pub fault: TokenFault,
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{} at {} (token {})", self.fault, location, self.token),
            None => write!(f, "{} (token {})", self.fault, self.token),
        }
    }
}

impl std::error::Error for TokenError {}
