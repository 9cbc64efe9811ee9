//! Optimistic local updates with automatic compensation.
//!
//! Screens that mutate a local list before the server confirms (ad edits,
//! catalog toggles) describe the mutation as a [`SpeculativeUpdate`]. The
//! client applies it, issues the call, and rolls it back if the call
//! ultimately fails after retries.

use crate::error::AllowanceError;
use crate::network::ApiResponse;

/// A local mutation that can be undone.
pub trait SpeculativeUpdate: Send {
    /// Apply the mutation locally before the call is issued.
    fn apply(&mut self);

    /// The call succeeded.
    fn commit(&mut self, _response: &ApiResponse) {}

    /// The call failed; undo the local mutation.
    fn rollback(&mut self, error: &AllowanceError);
}

/// [`SpeculativeUpdate`] built from two closures.
pub struct Speculation<A, R>
where
    A: FnMut() + Send,
    R: FnMut(&AllowanceError) + Send,
{
    apply: A,
    rollback: R,
}

/// Build a speculative update from an apply and a rollback closure.
pub fn speculate<A, R>(apply: A, rollback: R) -> Speculation<A, R>
where
    A: FnMut() + Send,
    R: FnMut(&AllowanceError) + Send,
{
    Speculation { apply, rollback }
}

impl<A, R> SpeculativeUpdate for Speculation<A, R>
where
    A: FnMut() + Send,
    R: FnMut(&AllowanceError) + Send,
{
    fn apply(&mut self) {
        (self.apply)()
    }

    fn rollback(&mut self, error: &AllowanceError) {
        (self.rollback)(error)
    }
}
