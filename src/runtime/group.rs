//! One-shot futures with cancellation (group cells)
//!
//! A group cell is created for every `Prune`. It leaves `Pending` exactly
//! once, decided by a single compare-and-set on its state word:
//! - `bind` wins: the value is stored, live child groups are killed, parked
//!   tokens are handed back for reactivation and the paired region closes.
//! - `kill` wins: child groups are killed, parked tokens die and the paired
//!   region closes.
//! The loser of a race is a no-op.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::region::Region;
use super::token::Token;
use super::trace::EventKind;
use super::value::Value;

const PENDING: u8 = 0;
const BINDING: u8 = 1;
const BOUND: u8 = 2;
const KILLED: u8 = 3;

static NEXT_GROUP: AtomicU64 = AtomicU64::new(0);

/// Group identifier (diagnostics and tracing)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Observable state of a group cell.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupState {
    /// Not yet resolved.
    Pending,
    /// Resolved with a value.
    Bound(Value),
    /// Cancelled.
    Killed,
}

/// Write-once future organized in a tree mirroring `Prune` nesting.
pub struct GroupCell {
    id: GroupId,
    state: AtomicU8,
    value: OnceLock<Value>,
    /// `None` once the cell has resolved.
    waiters: Mutex<Option<Vec<Box<Token>>>>,
    /// `None` once the cell has resolved.
    children: Mutex<Option<Vec<Weak<GroupCell>>>>,
    region: Weak<Region>,
}

impl GroupCell {
    /// Root group of an execution. It has no paired region.
    pub fn root() -> Arc<Self> {
        Arc::new(Self::detached(Weak::new()))
    }

    fn detached(region: Weak<Region>) -> Self {
        Self {
            id: GroupId(NEXT_GROUP.fetch_add(1, Ordering::Relaxed)),
            state: AtomicU8::new(PENDING),
            value: OnceLock::new(),
            waiters: Mutex::new(Some(Vec::new())),
            children: Mutex::new(Some(Vec::new())),
            region,
        }
    }

    /// Create a child of `parent` paired with `region`.
    ///
    /// If the parent has already resolved the child is killed on the spot.
    pub(crate) fn child_of(parent: &Arc<GroupCell>, region: Weak<Region>) -> Arc<Self> {
        let child = Arc::new(Self::detached(region));
        let adopted = {
            let mut children = parent.children.lock();
            match children.as_mut() {
                Some(list) => {
                    if list.len() == list.capacity() {
                        list.retain(|c| c.upgrade().is_some_and(|c| c.is_alive()));
                    }
                    list.push(Arc::downgrade(&child));
                    true
                }
                None => false,
            }
        };
        if !adopted {
            child.kill();
        }
        child
    }

    /// Group identifier.
    pub fn id(&self) -> GroupId {
        self.id
    }

    /// Whether the cell is still pending.
    pub fn is_alive(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// Whether the cell has been bound.
    pub fn is_bound(&self) -> bool {
        self.state.load(Ordering::Acquire) == BOUND
    }

    /// Whether the cell has been killed.
    pub fn is_killed(&self) -> bool {
        self.state.load(Ordering::Acquire) == KILLED
    }

    /// Bound value, if any.
    pub fn peek(&self) -> Option<&Value> {
        if self.is_bound() {
            self.value.get()
        } else {
            None
        }
    }

    /// Snapshot of the cell state.
    pub fn state(&self) -> GroupState {
        match self.state.load(Ordering::Acquire) {
            BOUND => match self.value.get() {
                Some(value) => GroupState::Bound(value.clone()),
                None => GroupState::Pending,
            },
            KILLED => GroupState::Killed,
            _ => GroupState::Pending,
        }
    }

    /// Try to bind the cell.
    ///
    /// Returns the parked tokens to reactivate if this call won the race,
    /// `None` if the cell had already resolved.
    pub fn bind(&self, value: Value) -> Option<Vec<Box<Token>>> {
        if self
            .state
            .compare_exchange(PENDING, BINDING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let fresh = self.value.set(value).is_ok();
        assert!(fresh, "group {} bound twice", self.id);
        self.state.store(BOUND, Ordering::Release);

        self.kill_children();
        let woken = self.waiters.lock().take().unwrap_or_default();
        for token in &woken {
            token.trace(|| EventKind::Unblock { group: self.id });
        }
        self.close_region();
        Some(woken)
    }

    /// Try to kill the cell. Returns whether this call won the race.
    pub fn kill(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, KILLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.kill_children();
        let dead = self.waiters.lock().take();
        drop(dead);
        self.close_region();
        true
    }

    /// Park `token` until the cell resolves.
    ///
    /// Hands the token back if the cell resolved before it could be parked;
    /// the caller then re-reads the (final) state.
    pub(crate) fn wait(&self, token: Box<Token>) -> Result<(), Box<Token>> {
        let mut waiters = self.waiters.lock();
        match waiters.as_mut() {
            Some(list) => {
                token.trace(|| EventKind::Block { group: self.id });
                list.push(token);
                Ok(())
            }
            None => Err(token),
        }
    }

    /// Number of parked tokens.
    pub fn waiting(&self) -> usize {
        self.waiters.lock().as_ref().map_or(0, Vec::len)
    }

    fn kill_children(&self) {
        let children = self.children.lock().take().unwrap_or_default();
        for child in children {
            if let Some(child) = child.upgrade() {
                child.kill();
            }
        }
    }

    fn close_region(&self) {
        if let Some(region) = self.region.upgrade() {
            region.close();
        }
    }
}

impl fmt::Debug for GroupCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupCell")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_bind_is_single_assignment() {
        let group = GroupCell::root();
        assert!(group.bind(Value::Integer(1)).is_some());
        assert!(group.bind(Value::Integer(2)).is_none());
        assert!(!group.kill());
        assert_eq!(group.state(), GroupState::Bound(Value::Integer(1)));
    }

    #[test]
    fn test_concurrent_bind_and_kill_have_one_winner() {
        for _ in 0..200 {
            let group = GroupCell::root();
            let winners = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let group = group.clone();
                    let winners = winners.clone();
                    thread::spawn(move || {
                        let won = if i % 2 == 0 {
                            group.bind(Value::Integer(i)).is_some()
                        } else {
                            group.kill()
                        };
                        if won {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(winners.load(Ordering::SeqCst), 1);
            assert!(!group.is_alive());
        }
    }

    #[test]
    fn test_resolution_kills_descendants() {
        let root = GroupCell::root();
        let child = GroupCell::child_of(&root, Weak::new());
        let grandchild = GroupCell::child_of(&child, Weak::new());

        assert!(root.bind(Value::Signal).is_some());
        assert!(child.is_killed());
        assert!(grandchild.is_killed());
    }

    #[test]
    fn test_child_of_resolved_parent_is_born_dead() {
        let root = GroupCell::root();
        root.kill();
        let child = GroupCell::child_of(&root, Weak::new());
        assert!(child.is_killed());
    }

    #[test]
    fn test_dead_children_are_purged_on_growth() {
        let root = GroupCell::root();
        let keep = GroupCell::child_of(&root, Weak::new());
        for _ in 0..64 {
            let transient = GroupCell::child_of(&root, Weak::new());
            transient.kill();
        }
        let tracked = root.children.lock().as_ref().map_or(0, Vec::len);
        assert!(tracked < 65);
        assert!(keep.is_alive());
    }
}
