//! Counter policies and the embedded strong counter.
//!
//! A reference-counted object carries its own count. This module owns the
//! arithmetic: how a count is stored and mutated (`CounterPolicy`) and the
//! counter value objects embed (`StrongCounter`). Disposal is not decided
//! here; a counter only reports the transition to zero and the owning
//! pointer layer acts on it.
//!
//! Goals
//! - One place where increments and decrements happen, so every other layer only reasons about the value `decrement` returns.
//! - Pluggable storage: `ThreadSafe` uses an `AtomicUsize`; `ThreadUnsafe` uses a `Cell<usize>` and makes the embedding type `!Sync`.
//! - Fail fast on unbalanced flows: decrementing a zero count panics, overflowing a count aborts.
//!
//! Abstraction
//! - CounterPolicy: stateless strategy with `load`, `increment`, `decrement` (returns the count after the decrement) and `compare_exchange` (writes the observed value back into `expected` on failure).
//! - RefCount: the capability an object's counter exposes to the pointer layer. Both `StrongCounter` and `WeakCounter` implement it.
//! - StrongCounter<P>: the count itself. It starts at zero and a clone starts its own independent count at zero, so copying an object never copies its owners.
//!
//! Ordering
//! - `ThreadSafe::decrement` releases on every decrement and issues an acquire fence when the count reaches zero, so whoever disposes of the object observes every write made through other owners.
//! - `ThreadSafe::compare_exchange` acquires on success. This is the step a weak lock uses to claim a reference.
//! - `use_count` is a relaxed snapshot for diagnostics.
//!
//! Notes
//! - Overflow behavior follows `Rc`/`Arc`: the process aborts rather than continue with a wrapped count.
//! - The non-atomic policy is legal only for objects that never cross threads; the `Cell` enforces that through auto traits.

use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use std::sync::atomic::{self, AtomicUsize, Ordering};

/// Storage and arithmetic strategy for a reference count.
pub trait CounterPolicy: 'static {
    /// The cell the count lives in.
    type Count: fmt::Debug;

    /// A fresh count holding zero.
    fn new_count() -> Self::Count;

    fn load(count: &Self::Count) -> usize;

    /// Raise the count by one and return the new value.
    fn increment(count: &Self::Count) -> usize;

    /// Lower the count by one and return the value after the decrement.
    fn decrement(count: &Self::Count) -> usize;

    /// Replace `*expected` with `desired` if the count still holds `*expected`.
    ///
    /// On failure the value actually observed is written back into `expected`.
    fn compare_exchange(count: &Self::Count, expected: &mut usize, desired: usize) -> bool;
}

/// Atomic counter policy, safe to share across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSafe;

// Same limit as `Arc`: far below wrap-around, so racing increments cannot
// push the count past `usize::MAX` before one of them aborts.
const MAX_ATOMIC_COUNT: usize = isize::MAX as usize;

impl CounterPolicy for ThreadSafe {
    type Count = AtomicUsize;

    #[inline]
    fn new_count() -> AtomicUsize {
        AtomicUsize::new(0)
    }

    #[inline]
    fn load(count: &AtomicUsize) -> usize {
        count.load(Ordering::Acquire)
    }

    #[inline]
    fn increment(count: &AtomicUsize) -> usize {
        let prev = count.fetch_add(1, Ordering::Relaxed);
        if prev > MAX_ATOMIC_COUNT {
            std::process::abort();
        }
        prev + 1
    }

    #[inline]
    fn decrement(count: &AtomicUsize) -> usize {
        let prev = count.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "reference count underflow");
        if prev == 1 {
            atomic::fence(Ordering::Acquire);
        }
        prev - 1
    }

    #[inline]
    fn compare_exchange(count: &AtomicUsize, expected: &mut usize, desired: usize) -> bool {
        match count.compare_exchange(*expected, desired, Ordering::Acquire, Ordering::Acquire) {
            Ok(_) => true,
            Err(actual) => {
                *expected = actual;
                false
            }
        }
    }
}

/// Plain counter policy for objects confined to one thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadUnsafe;

impl CounterPolicy for ThreadUnsafe {
    type Count = Cell<usize>;

    #[inline]
    fn new_count() -> Cell<usize> {
        Cell::new(0)
    }

    #[inline]
    fn load(count: &Cell<usize>) -> usize {
        count.get()
    }

    #[inline]
    fn increment(count: &Cell<usize>) -> usize {
        let n = count.get().wrapping_add(1);
        count.set(n);
        if n == 0 {
            std::process::abort();
        }
        n
    }

    #[inline]
    fn decrement(count: &Cell<usize>) -> usize {
        let c = count.get();
        assert!(c > 0, "reference count underflow");
        count.set(c - 1);
        c - 1
    }

    #[inline]
    fn compare_exchange(count: &Cell<usize>, expected: &mut usize, desired: usize) -> bool {
        let actual = count.get();
        if actual == *expected {
            count.set(desired);
            true
        } else {
            *expected = actual;
            false
        }
    }
}

/// The counting capability an object's embedded counter offers to the
/// pointer layer.
pub trait RefCount {
    /// Add one owner.
    fn increment(&self);

    /// Remove one owner and return how many remain.
    ///
    /// Exactly one call ever returns zero for a given object; the caller that
    /// receives it is responsible for finalizing the object. Implementations
    /// finish any end-of-life bookkeeping of their own before returning zero.
    fn decrement(&self) -> usize;

    /// Snapshot of the number of owners, for diagnostics only.
    fn use_count(&self) -> usize;
}

/// Strong reference count embedded in a reference-counted object.
pub struct StrongCounter<P: CounterPolicy = ThreadSafe> {
    count: P::Count,
    _policy: PhantomData<P>,
}

impl<P: CounterPolicy> StrongCounter<P> {
    pub fn new() -> Self {
        Self {
            count: P::new_count(),
            _policy: PhantomData,
        }
    }

    /// Claim one more owner only if the count is non-zero.
    ///
    /// Returns false once the count has reached zero; from then on the object
    /// is dying and must not be resurrected. The read and the increment are a
    /// single compare-exchange, retried with the freshly observed value when
    /// another thread changed the count in between.
    pub fn try_increment(&self) -> bool {
        let mut current = P::load(&self.count);
        loop {
            if current == 0 {
                return false;
            }
            if current > MAX_ATOMIC_COUNT {
                std::process::abort();
            }
            let desired = current + 1;
            if P::compare_exchange(&self.count, &mut current, desired) {
                return true;
            }
        }
    }
}

impl<P: CounterPolicy> RefCount for StrongCounter<P> {
    #[inline]
    fn increment(&self) {
        P::increment(&self.count);
    }

    #[inline]
    fn decrement(&self) -> usize {
        P::decrement(&self.count)
    }

    #[inline]
    fn use_count(&self) -> usize {
        P::load(&self.count)
    }
}

impl<P: CounterPolicy> Default for StrongCounter<P> {
    fn default() -> Self {
        Self::new()
    }
}

// A copied object is a new object with no owners yet.
impl<P: CounterPolicy> Clone for StrongCounter<P> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<P: CounterPolicy> fmt::Debug for StrongCounter<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrongCounter")
            .field("count", &self.use_count())
            .finish()
    }
}
