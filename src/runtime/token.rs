//! Tokens, continuation chains and admission control
//!
//! A token is one strand of execution. It is owned by exactly one worker at a
//! time (it travels as a `Box<Token>` through deques, wait-lists and site
//! handles), so none of its fields need synchronization. What a token does
//! with a value once its current node publishes is recorded in its
//! continuation chain, which forked tokens share structurally.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use super::env::Env;
use super::error::TokenLimitReached;
use super::group::GroupCell;
use super::node::{NodeId, SourceLocation};
use super::region::Region;
use super::trace::{EventKind, Tracer};
use super::value::Value;

/// Token identifier, unique within one token pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One step of "what happens to a published value".
#[derive(Clone)]
pub(crate) enum Frame {
    /// Run `right` with the value pushed on `env`.
    Sequence { right: NodeId, env: Env },
    /// Bind the value into the pruning group; the publisher then dies.
    Prune { group: Arc<GroupCell> },
    /// Record that the left side of an `Otherwise` published; pass through.
    Otherwise { published: Arc<AtomicBool> },
    /// Exception handler scope; publications pass through.
    Catch {
        handler: NodeId,
        env: Env,
        group: Arc<GroupCell>,
        region: Arc<Region>,
    },
}

struct Link {
    frame: Frame,
    next: Cont,
}

/// Persistent continuation chain (innermost frame first).
#[derive(Clone, Default)]
pub(crate) struct Cont {
    head: Option<Arc<Link>>,
}

impl Cont {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// New chain with `frame` innermost; `self` is untouched.
    pub(crate) fn push(&self, frame: Frame) -> Cont {
        Cont {
            head: Some(Arc::new(Link {
                frame,
                next: self.clone(),
            })),
        }
    }

    /// Innermost frame and the rest of the chain.
    pub(crate) fn split(&self) -> Option<(Frame, Cont)> {
        self.head
            .as_deref()
            .map(|link| (link.frame.clone(), link.next.clone()))
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}

impl Drop for Cont {
    fn drop(&mut self) {
        let mut head = self.head.take();
        while let Some(link) = head {
            match Arc::try_unwrap(link) {
                Ok(mut link) => head = link.next.head.take(),
                Err(_) => break,
            }
        }
    }
}

/// How a token re-enters the interpreter after a site call.
#[derive(Debug, Clone)]
pub(crate) enum Resume {
    /// The call returned a value: publish it.
    Publish(Value),
    /// The call raised: unwind to the nearest handler.
    Throw(Value),
}

/// A strand of execution.
pub struct Token {
    pub(crate) id: TokenId,
    pub(crate) node: NodeId,
    pub(crate) env: Env,
    pub(crate) cont: Cont,
    pub(crate) group: Arc<GroupCell>,
    pub(crate) region: Arc<Region>,
    pub(crate) resume: Option<Resume>,
    pub(crate) location: Option<SourceLocation>,
    tracer: Arc<Tracer>,
    permit: Option<TokenPermit>,
}

impl Token {
    /// Create a token inhabiting `region`.
    pub(crate) fn new(
        permit: TokenPermit,
        node: NodeId,
        env: Env,
        cont: Cont,
        group: Arc<GroupCell>,
        region: Arc<Region>,
        tracer: Arc<Tracer>,
    ) -> Box<Self> {
        region.enter();
        Box::new(Self {
            id: permit.id,
            node,
            env,
            cont,
            group,
            region,
            resume: None,
            location: None,
            tracer,
            permit: Some(permit),
        })
    }

    /// Child strand at `node` sharing this token's environment, continuation,
    /// group and region.
    pub(crate) fn fork(&self, permit: TokenPermit, node: NodeId) -> Box<Self> {
        let mut child = Token::new(
            permit,
            node,
            self.env.clone(),
            self.cont.clone(),
            self.group.clone(),
            self.region.clone(),
            self.tracer.clone(),
        );
        child.location = self.location.clone();
        child
    }

    /// Token identifier.
    pub fn id(&self) -> TokenId {
        self.id
    }

    /// Node the token is positioned at.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Last source location the token passed.
    pub fn location(&self) -> Option<&SourceLocation> {
        self.location.as_ref()
    }

    /// Move into another region. The new one is entered before the old one is
    /// left, so a shared ancestor never sees a transient zero.
    pub(crate) fn set_region(&mut self, region: Arc<Region>) {
        region.enter();
        let old = std::mem::replace(&mut self.region, region);
        old.leave();
    }

    pub(crate) fn trace(&self, kind: impl FnOnce() -> EventKind) {
        self.tracer.emit(Some(self.id), kind);
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        self.trace(|| EventKind::Die);
        // Capacity returns before the region can close and halt the engine.
        drop(self.permit.take());
        self.region.leave();
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("group", &self.group.id())
            .field("region", &self.region.id())
            .finish()
    }
}

/// Process-wide bound on simultaneously live tokens.
#[derive(Debug)]
pub struct TokenPool {
    capacity: Option<usize>,
    available: AtomicUsize,
    live: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl TokenPool {
    /// Create a pool; a negative size disables the limit.
    pub fn new(size: i64) -> Arc<Self> {
        let capacity = usize::try_from(size).ok();
        Arc::new(Self {
            capacity,
            available: AtomicUsize::new(capacity.unwrap_or(0)),
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Admit one more token, or fail once the bound is reached.
    pub fn new_token(self: &Arc<Self>) -> Result<TokenPermit, TokenLimitReached> {
        let exhausted = TokenLimitReached {
            capacity: self.capacity.unwrap_or(0),
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(exhausted);
        }
        if self.capacity.is_some() {
            self.available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .map_err(|_| exhausted)?;
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(TokenPermit {
            pool: self.clone(),
            id: TokenId(self.next_id.fetch_add(1, Ordering::Relaxed)),
        })
    }

    /// Return a permit's capacity to the pool.
    pub fn free_token(&self, permit: TokenPermit) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&permit.pool)));
        drop(permit);
    }

    fn release(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if self.capacity.is_some() {
            self.available.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Configured bound (`None` when unbounded).
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Remaining capacity (`None` when unbounded).
    pub fn available(&self) -> Option<usize> {
        self.capacity
            .map(|_| self.available.load(Ordering::Acquire))
    }

    /// Permits currently held.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Refuse all further admissions. Outstanding permits still return
    /// their capacity when dropped.
    pub fn teardown(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Whether `teardown` has been called.
    pub fn is_torn_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Admission ticket held by every live token.
#[derive(Debug)]
pub struct TokenPermit {
    pool: Arc<TokenPool>,
    id: TokenId,
}

impl TokenPermit {
    /// Identifier assigned to the admitted token.
    pub fn id(&self) -> TokenId {
        self.id
    }
}

impl Drop for TokenPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}
