//! Regions: dynamic extents of concurrently running tokens
//!
//! A region counts its inhabitants (live tokens and open child regions) and
//! closes when the count drops to zero, firing its completion action exactly
//! once. Closing is guarded by an atomic flag, so a group cell closing its
//! region at the same moment the last token leaves is harmless.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::group::GroupCell;

static NEXT_REGION: AtomicU64 = AtomicU64::new(0);

/// Action run once when a completion region closes.
pub type CloseAction = Box<dyn FnOnce() + Send>;

/// Region identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u64);

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

enum RegionKind {
    /// Runs an action on close (execution root, `Otherwise` left side).
    Completion(Mutex<Option<CloseAction>>),
    /// Paired one-to-one with a group cell: closing kills the cell.
    Group(Arc<GroupCell>),
}

/// Tracker for "when does this extent become empty".
pub struct Region {
    id: RegionId,
    parent: Option<Arc<Region>>,
    live: AtomicUsize,
    closed: AtomicBool,
    kind: RegionKind,
}

impl Region {
    /// Root region of an execution.
    pub fn root(on_close: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(Self::new(None, RegionKind::Completion(Mutex::new(Some(Box::new(on_close))))))
    }

    /// Child region that runs `on_close` when its extent empties.
    ///
    /// The action runs before the parent is notified, so anything it adds to
    /// the parent keeps the parent open.
    pub fn sequencing(parent: &Arc<Region>, on_close: impl FnOnce() + Send + 'static) -> Arc<Self> {
        parent.enter();
        Arc::new(Self::new(
            Some(parent.clone()),
            RegionKind::Completion(Mutex::new(Some(Box::new(on_close)))),
        ))
    }

    /// Child region paired with a fresh child group of `parent_group`.
    pub fn with_group(
        parent: &Arc<Region>,
        parent_group: &Arc<GroupCell>,
    ) -> (Arc<Self>, Arc<GroupCell>) {
        parent.enter();
        let region = Arc::new_cyclic(|me: &Weak<Region>| {
            let group = GroupCell::child_of(parent_group, me.clone());
            Self::new(Some(parent.clone()), RegionKind::Group(group))
        });
        let group = match &region.kind {
            RegionKind::Group(group) => group.clone(),
            RegionKind::Completion(_) => unreachable!("group region without a group"),
        };
        (region, group)
    }

    fn new(parent: Option<Arc<Region>>, kind: RegionKind) -> Self {
        Self {
            id: RegionId(NEXT_REGION.fetch_add(1, Ordering::Relaxed)),
            parent,
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            kind,
        }
    }

    /// Region identifier.
    pub fn id(&self) -> RegionId {
        self.id
    }

    /// Add an inhabitant.
    pub fn enter(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    /// Remove an inhabitant, closing the region when it was the last one.
    pub fn leave(&self) {
        let previous = self.live.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "region {} left more often than entered", self.id);
        if previous == 1 {
            self.close();
        }
    }

    /// Close the region. Safe to call any number of times from any thread;
    /// only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.kind {
            RegionKind::Completion(action) => {
                let action = action.lock().take();
                if let Some(action) = action {
                    action();
                }
            }
            RegionKind::Group(group) => {
                group.kill();
            }
        }
        if let Some(parent) = &self.parent {
            parent.leave();
        }
    }

    /// Whether the region has closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current inhabitant count.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("id", &self.id)
            .field("live", &self.live())
            .field("closed", &self.is_closed())
            .finish()
    }
}
