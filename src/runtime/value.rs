//! Runtime values flowing between strands, sites and futures.

use std::fmt;
use std::sync::Arc;

use super::env::Env;
use super::node::{Literal, NodeId};
use super::site::SiteRef;

/// Label used when a host error is wrapped as a catchable record.
pub const ERROR_RECORD_LABEL: &str = "error";

/// Structured value published by strands and passed to sites.
#[derive(Clone)]
pub enum Value {
    /// The unit publication (`signal`).
    Signal,
    /// Signed integer.
    Integer(i64),
    /// Floating-point number.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
    /// Heterogeneous list (also used for tuples returned by `let`).
    List(Vec<Value>),
    /// Record value with a symbolic label and positional fields.
    Record {
        /// Record label.
        label: String,
        /// Positional field values.
        fields: Vec<Value>,
    },
    /// A definition closed over its declaring environment.
    Closure(Arc<Closure>),
    /// A callable site.
    Site(SiteRef),
}

/// A definition closed over the environment it was declared in.
///
/// The closure names its definition by the declaring `DeclareDefs` node and
/// the index within that node's group, so recursive groups never form
/// reference cycles: sibling closures are rebuilt at call time.
pub struct Closure {
    pub(crate) decl: NodeId,
    pub(crate) index: usize,
    pub(crate) env: Env,
}

impl Closure {
    /// Declaring node of the definition group.
    pub fn decl(&self) -> NodeId {
        self.decl
    }

    /// Index of the definition within its group.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Value {
    /// Build a record value.
    pub fn record(label: impl Into<String>, fields: Vec<Value>) -> Self {
        Value::Record {
            label: label.into(),
            fields,
        }
    }

    /// Wrap a host error message as a catchable record.
    pub fn error(message: impl Into<String>) -> Self {
        Value::record(ERROR_RECORD_LABEL, vec![Value::String(message.into())])
    }

    /// Short type name used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Signal => "signal",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record { .. } => "record",
            Value::Closure(_) => "closure",
            Value::Site(_) => "site",
        }
    }

    /// Integer payload, if any.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(num) => Some(*num),
            _ => None,
        }
    }

    /// Boolean payload, if any.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(flag) => Some(*flag),
            _ => None,
        }
    }

    /// Convenience accessor for string references.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(text) => Some(text),
            _ => None,
        }
    }

    /// Whether the value is a record carrying the given label.
    pub fn has_label(&self, wanted: &str) -> bool {
        matches!(self, Value::Record { label, .. } if label == wanted)
    }

    /// Text written by `print`: strings verbatim, everything else as displayed.
    pub fn to_text(&self) -> String {
        match self {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl From<&Literal> for Value {
    fn from(literal: &Literal) -> Self {
        match literal {
            Literal::Signal => Value::Signal,
            Literal::Integer(num) => Value::Integer(*num),
            Literal::Float(num) => Value::Float(*num),
            Literal::Boolean(flag) => Value::Boolean(*flag),
            Literal::String(text) => Value::String(text.clone()),
            Literal::List(items) => Value::List(items.iter().map(Value::from).collect()),
        }
    }
}

impl From<i64> for Value {
    fn from(num: i64) -> Self {
        Value::Integer(num)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Boolean(flag)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Value::String(text.to_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Signal, Value::Signal) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (
                Value::Record {
                    label: la,
                    fields: fa,
                },
                Value::Record {
                    label: lb,
                    fields: fb,
                },
            ) => la == lb && fa == fb,
            (Value::Closure(a), Value::Closure(b)) => Arc::ptr_eq(a, b),
            (Value::Site(a), Value::Site(b)) => a.name() == b.name(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signal => write!(f, "signal"),
            Value::Integer(num) => write!(f, "{}", num),
            Value::Float(num) => write!(f, "{}", num),
            Value::Boolean(flag) => write!(f, "{}", flag),
            Value::String(text) => write!(f, "{:?}", text),
            Value::List(items) => {
                write!(f, "[")?;
                for (idx, item) in items.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Record { label, fields } => {
                write!(f, "<{}", label)?;
                for field in fields {
                    write!(f, " {}", field)?;
                }
                write!(f, ">")
            }
            Value::Closure(closure) => write!(f, "<closure {}.{}>", closure.decl, closure.index),
            Value::Site(site) => write!(f, "<site {}>", site.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
