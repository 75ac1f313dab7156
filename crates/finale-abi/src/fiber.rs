//! Stackful fibers with registered guard zones.
//!
//! Each fiber runs on its own [`FiberStack`] and is registered in the
//! process stack registry under a fresh [`OwnerId`] for its whole lifetime.
//! While a fiber runs, the thread's current owner is the fiber's, so an
//! overflow of the fiber stack is classified against the fiber's guard zone
//! and never against the thread that resumed it.

use std::fmt;

use corosensei::{Coroutine, CoroutineResult, Yielder};
use finale_core::OwnerId;

use crate::stack_abi::FiberStack;
use crate::{AbiError, runtime};

/// Outcome of one [`Fiber::resume`].
#[derive(Debug, PartialEq, Eq)]
pub enum FiberState<R> {
    /// The fiber called [`FiberYielder::suspend`].
    Suspended,
    /// The fiber body returned.
    Finished(R),
}

/// Handle a fiber body uses to give control back to its resumer.
pub struct FiberYielder<'a> {
    inner: &'a Yielder<(), ()>,
    owner: OwnerId,
}

impl FiberYielder<'_> {
    /// Return to the resumer; continues on the next [`Fiber::resume`].
    pub fn suspend(&self) {
        self.inner.suspend(());
    }

    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

/// A suspended computation with its own stack.
pub struct Fiber<R> {
    coroutine: Coroutine<(), (), R, FiberStack>,
    owner: OwnerId,
}

impl<R> fmt::Debug for Fiber<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("owner", &self.owner)
            .field("done", &self.coroutine.done())
            .finish()
    }
}

/// Restores the resumer's owner when control comes back, including by unwind.
struct OwnerSwap {
    previous: Option<OwnerId>,
}

impl OwnerSwap {
    fn enter(owner: OwnerId) -> Self {
        Self {
            previous: runtime::swap_current_owner(Some(owner)),
        }
    }
}

impl Drop for OwnerSwap {
    fn drop(&mut self) {
        runtime::swap_current_owner(self.previous);
    }
}

impl<R: 'static> Fiber<R> {
    /// Create a fiber with the configured default stack size. The body does
    /// not start until the first [`resume`](Self::resume).
    pub fn spawn<F>(body: F) -> Result<Self, AbiError>
    where
        F: FnOnce(&FiberYielder<'_>) -> R + 'static,
    {
        Self::with_stack_size(runtime::fiber_stack_size(), body)
    }

    /// Create a fiber whose stack has at least `size` usable bytes.
    pub fn with_stack_size<F>(size: usize, body: F) -> Result<Self, AbiError>
    where
        F: FnOnce(&FiberYielder<'_>) -> R + 'static,
    {
        let stack = FiberStack::new(size)?;
        let owner = OwnerId::next();
        let region = stack.region(owner);
        runtime::registry().register(region)?;
        runtime::log_registered(owner, region.base, region.size, "fiber");

        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<(), ()>, ()| {
            body(&FiberYielder {
                inner: yielder,
                owner,
            })
        });
        Ok(Self { coroutine, owner })
    }

    /// Run the fiber until it suspends or finishes.
    ///
    /// A panic in the fiber body propagates out of this call.
    pub fn resume(&mut self) -> Result<FiberState<R>, AbiError> {
        if self.coroutine.done() {
            return Err(AbiError::FiberFinished {
                owner: self.owner.as_raw(),
            });
        }
        let _swap = OwnerSwap::enter(self.owner);
        Ok(match self.coroutine.resume(()) {
            CoroutineResult::Yield(()) => FiberState::Suspended,
            CoroutineResult::Return(value) => FiberState::Finished(value),
        })
    }

    /// Drive the fiber to completion, resuming through every suspension.
    pub fn run_to_completion(mut self) -> Result<R, AbiError> {
        loop {
            if let FiberState::Finished(value) = self.resume()? {
                return Ok(value);
            }
        }
    }
}

impl<R> Fiber<R> {
    #[must_use]
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.coroutine.done()
    }
}

impl<R> Drop for Fiber<R> {
    fn drop(&mut self) {
        // The coroutine (and its stack mapping) is dropped after this; an
        // unfinished body is unwound then.
        if runtime::registry().unregister(self.owner).is_ok() {
            runtime::log_unregistered(self.owner);
        }
    }
}
