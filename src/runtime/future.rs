//! Future forcing protocol
//!
//! Forcing either yields a value together with the requesting token, or takes
//! the token away. A token taken by a pending group sits on exactly that
//! group's wait-list and is handed back exactly once when the group resolves:
//! alive if it was bound, dropped if it was killed. A woken token re-runs the
//! node it blocked at, so the wait-list entry is the whole continuation.

use super::env::Binding;
use super::group::{GroupCell, GroupState};
use super::token::Token;
use super::value::Value;

/// Outcome of forcing a future.
pub(crate) enum Forced {
    /// Value available; the requester continues.
    Ready(Value, Box<Token>),
    /// The requester was parked, or died because the future was killed.
    NotReady,
}

/// Anything a token may have to wait on.
pub(crate) trait Forceable {
    fn force(&self, requester: Box<Token>) -> Forced;
}

impl Forceable for Value {
    fn force(&self, requester: Box<Token>) -> Forced {
        Forced::Ready(self.clone(), requester)
    }
}

impl Forceable for GroupCell {
    fn force(&self, requester: Box<Token>) -> Forced {
        let mut requester = requester;
        loop {
            match self.state() {
                GroupState::Bound(value) => return Forced::Ready(value, requester),
                GroupState::Killed => return Forced::NotReady,
                GroupState::Pending => match self.wait(requester) {
                    Ok(()) => return Forced::NotReady,
                    // Resolved while we were looking; read the final state.
                    Err(token) => requester = token,
                },
            }
        }
    }
}

impl Forceable for Binding {
    fn force(&self, requester: Box<Token>) -> Forced {
        match self {
            Binding::Value(value) => value.force(requester),
            Binding::Future(group) => group.force(requester),
        }
    }
}
