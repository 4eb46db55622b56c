//! Persistent variable environments
//!
//! An environment is an immutable, structurally shared chain of bindings
//! addressed by position from the top (index 0 is the most recent binding).
//! Extending never mutates an existing chain, so forked strands share their
//! common prefix for free.

use std::sync::Arc;

use super::group::GroupCell;
use super::value::Value;

/// A single environment entry: either a resolved value or a pending future.
#[derive(Clone)]
pub enum Binding {
    /// Value available immediately.
    Value(Value),
    /// One-shot future produced by a `Prune`.
    Future(Arc<GroupCell>),
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Value(value)
    }
}

struct Frame {
    binding: Binding,
    next: Env,
}

/// Immutable, reference-counted binding chain.
#[derive(Clone, Default)]
pub struct Env {
    head: Option<Arc<Frame>>,
    depth: usize,
}

impl Env {
    /// The empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new environment with `binding` on top; `self` is untouched.
    pub fn extend(&self, binding: impl Into<Binding>) -> Env {
        Env {
            head: Some(Arc::new(Frame {
                binding: binding.into(),
                next: self.clone(),
            })),
            depth: self.depth + 1,
        }
    }

    /// Look up the binding `index` positions from the top.
    pub fn lookup(&self, index: usize) -> Option<&Binding> {
        if index >= self.depth {
            return None;
        }
        let mut frame = self.head.as_deref()?;
        for _ in 0..index {
            frame = frame.next.head.as_deref()?;
        }
        Some(&frame.binding)
    }

    /// Number of bindings in scope.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Whether the environment has no bindings.
    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}

impl Drop for Env {
    // Unlink uniquely owned frames iteratively so long chains cannot
    // overflow the stack on drop.
    fn drop(&mut self) {
        let mut head = self.head.take();
        while let Some(frame) = head {
            match Arc::try_unwrap(frame) {
                Ok(mut frame) => head = frame.next.head.take(),
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(binding: Option<&Binding>) -> Option<i64> {
        match binding {
            Some(Binding::Value(value)) => value.as_integer(),
            _ => None,
        }
    }

    #[test]
    fn test_lookup_is_positional_from_top() {
        let env = Env::new()
            .extend(Value::Integer(1))
            .extend(Value::Integer(2))
            .extend(Value::Integer(3));

        assert_eq!(env.depth(), 3);
        assert_eq!(int(env.lookup(0)), Some(3));
        assert_eq!(int(env.lookup(2)), Some(1));
        assert!(env.lookup(3).is_none());
    }

    #[test]
    fn test_extend_shares_prefix() {
        let base = Env::new().extend(Value::Integer(10));
        let left = base.extend(Value::Integer(1));
        let right = base.extend(Value::Integer(2));

        assert_eq!(int(left.lookup(0)), Some(1));
        assert_eq!(int(right.lookup(0)), Some(2));
        assert_eq!(int(left.lookup(1)), Some(10));
        assert_eq!(base.depth(), 1);
    }

    #[test]
    fn test_long_chain_drops_without_recursion() {
        let mut env = Env::new();
        for i in 0..200_000 {
            env = env.extend(Value::Integer(i));
        }
        assert_eq!(env.depth(), 200_000);
        drop(env);
    }
}
