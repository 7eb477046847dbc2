//! Weak references through lazily published control blocks.
//!
//! An object that wants weak references embeds a `WeakCounter` instead of a
//! plain `StrongCounter`. The first weak request allocates a `ControlBlock`
//! and publishes it into the counter's slot; weak handles own counted
//! references to that block, never to the object.
//!
//! Lifecycle
//! - Publication: `weak_ref` loads the slot, returns the published block if there is one, and otherwise races a fresh candidate in with a compare-exchange. A losing candidate was never visible to anyone and is simply freed. Exactly one block per object ever becomes visible.
//! - Ownership: the slot holds one reference to the published block; every `WeakPtr` holds another.
//! - End of life: the release that takes the object's strong count to zero swaps the slot to null, severs the block's back-pointer and drops the slot's reference. Only then is the object finalized.
//!
//! Lock protocol
//! - `WeakPtr::lock` claims an owner with a compare-exchange on the object's strong count that refuses zero, retrying with the observed value on contention. Reading "alive" and claiming a reference are one atomic step, so a dying object is never resurrected.
//! - The count lives inside the object, so a locker must also be sure the object's storage is still there while it reads it. Lockers announce themselves in the block's `pending` counter before loading the back-pointer and retract afterwards. Severing clears the back-pointer first and then waits for `pending` to drain; both sides use sequentially consistent accesses, so every locker either sees the null back-pointer or is waited for.
//! - The back-pointer is type-erased (it addresses the owner's `WeakCounter`). The typed object pointer lives in the `WeakPtr` and is only turned into a handle after a successful claim.
//!
//! Notes
//! - Weak support always counts atomically.
//! - `expired` and `use_count` are snapshots and may be stale the moment they return.

use core::fmt;
use core::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;
use log::{debug, trace};

use crate::counter::{RefCount, StrongCounter, ThreadSafe};
use crate::error::LockError;
use crate::strong::{RefCounted, StrongPtr};

/// Out-of-line record weak handles point at.
///
/// Reference counted like any other object; it observes its owner without
/// owning it.
pub struct ControlBlock {
    count: StrongCounter<ThreadSafe>,
    owner: AtomicPtr<WeakCounter>,
    pending: AtomicUsize,
}

// Lowers `pending` when a locker leaves, even on unwind.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

impl ControlBlock {
    fn new(owner: &WeakCounter) -> Self {
        Self {
            count: StrongCounter::new(),
            owner: AtomicPtr::new(owner as *const WeakCounter as *mut WeakCounter),
            pending: AtomicUsize::new(0),
        }
    }

    /// Run `f` against the owner's counter, or `None` once it has been
    /// severed. The owner cannot be finalized while `f` runs.
    ///
    /// Observers that find the back-pointer already cleared never touch
    /// `pending`, so only lockers in flight at the moment of severing can
    /// delay it.
    fn with_owner<R>(&self, f: impl FnOnce(Option<&WeakCounter>) -> R) -> R {
        if self.is_severed() {
            return f(None);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _guard = PendingGuard(&self.pending);
        let owner = self.owner.load(Ordering::SeqCst);
        // SAFETY: a non-null back-pointer was reloaded after `pending` was
        // raised, so `sever` waits for us before the owner goes away.
        f(unsafe { owner.as_ref() })
    }

    /// Claim one strong reference on the owner if it is still alive.
    pub(crate) fn try_acquire(&self) -> bool {
        self.with_owner(|owner| owner.is_some_and(|o| o.strong.try_increment()))
    }

    /// Snapshot of the owner's strong count, 0 once it is gone.
    pub fn owner_use_count(&self) -> usize {
        self.with_owner(|owner| owner.map_or(0, |o| o.strong.use_count()))
    }

    /// True once the owner has reached end of life. Never reverts.
    pub fn is_severed(&self) -> bool {
        self.owner.load(Ordering::SeqCst).is_null()
    }

    fn sever(&self) {
        self.owner.store(ptr::null_mut(), Ordering::SeqCst);
        if self.pending.load(Ordering::SeqCst) == 0 {
            return;
        }
        debug!("control block {:p}: waiting for in-flight weak locks", self);
        let backoff = Backoff::new();
        while self.pending.load(Ordering::SeqCst) != 0 {
            backoff.snooze();
        }
    }
}

impl RefCounted for ControlBlock {
    type Counter = StrongCounter<ThreadSafe>;

    fn ref_count(&self) -> &Self::Counter {
        &self.count
    }
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlBlock")
            .field("count", &self.count.use_count())
            .field("severed", &self.is_severed())
            .finish()
    }
}

/// Strong count plus lazily created control block, embedded in objects that
/// hand out weak references.
pub struct WeakCounter {
    strong: StrongCounter<ThreadSafe>,
    block: AtomicPtr<ControlBlock>,
}

impl WeakCounter {
    pub fn new() -> Self {
        Self {
            strong: StrongCounter::new(),
            block: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// A counted reference to this object's control block, creating and
    /// publishing the block on first use.
    ///
    /// # Safety
    /// The counter must stay at its current address until the object is
    /// finalized, which holds for objects owned through `StrongPtr`. The
    /// caller must hold a strong reference to the object, or otherwise know
    /// the count cannot reach zero, for the whole call: a concurrent final
    /// release frees the published block.
    pub unsafe fn weak_ref(&self) -> StrongPtr<ControlBlock> {
        let mut current = self.block.load(Ordering::Acquire);
        loop {
            if !current.is_null() {
                // SAFETY: the slot's reference keeps a published block alive
                // while the owner is.
                return unsafe { StrongPtr::from_raw(current) };
            }

            let candidate = Box::new(ControlBlock::new(self));
            // Reference held by the slot once published.
            candidate.count.increment();
            let candidate = Box::into_raw(candidate);
            match self.block.compare_exchange(
                ptr::null_mut(),
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    trace!("published control block {:p} for {:p}", candidate, self);
                    return unsafe { StrongPtr::from_raw(candidate) };
                }
                Err(published) => {
                    trace!("control block race lost for {:p}, discarding candidate", self);
                    // SAFETY: the candidate never left this thread.
                    drop(unsafe { Box::from_raw(candidate) });
                    current = published;
                }
            }
        }
    }

    /// References held on the published control block (the counter's own
    /// plus one per weak handle), 0 if none was published.
    pub fn weak_count(&self) -> usize {
        let block = self.block.load(Ordering::Acquire);
        // SAFETY: the slot's reference keeps a published block alive.
        unsafe { block.as_ref() }.map_or(0, |b| b.count.use_count())
    }

    fn detach_block(&self) {
        let block = self.block.swap(ptr::null_mut(), Ordering::AcqRel);
        if block.is_null() {
            return;
        }
        // SAFETY: the slot owned one reference, which moves into this handle
        // and is released when it drops.
        let block = unsafe { StrongPtr::adopt(block) };
        block.sever();
        trace!("severed control block {:p}", block);
    }
}

impl RefCount for WeakCounter {
    #[inline]
    fn increment(&self) {
        self.strong.increment();
    }

    fn decrement(&self) -> usize {
        let remaining = self.strong.decrement();
        if remaining == 0 {
            self.detach_block();
        }
        remaining
    }

    #[inline]
    fn use_count(&self) -> usize {
        self.strong.use_count()
    }
}

// Normally a no-op: the last release already detached the block. Covers
// objects that were never owned through a `StrongPtr`.
impl Drop for WeakCounter {
    fn drop(&mut self) {
        self.detach_block();
    }
}

impl Default for WeakCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for WeakCounter {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl fmt::Debug for WeakCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakCounter")
            .field("strong", &self.strong.use_count())
            .field("weak", &self.weak_count())
            .finish()
    }
}

/// Non-owning handle that can be upgraded to a `StrongPtr` while the target
/// is alive.
pub struct WeakPtr<T: ?Sized + RefCounted<Counter = WeakCounter>> {
    block: StrongPtr<ControlBlock>,
    target: Option<NonNull<T>>,
}

unsafe impl<T: ?Sized + RefCounted<Counter = WeakCounter> + Send + Sync> Send for WeakPtr<T> {}
unsafe impl<T: ?Sized + RefCounted<Counter = WeakCounter> + Send + Sync> Sync for WeakPtr<T> {}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> WeakPtr<T> {
    pub const fn empty() -> Self {
        Self {
            block: StrongPtr::empty(),
            target: None,
        }
    }

    /// Observe the target of `strong`. An empty handle gives an empty weak
    /// handle.
    pub fn new(strong: &StrongPtr<T>) -> Self {
        match strong.as_ptr() {
            // SAFETY: `strong` keeps the boxed object alive and in place.
            Some(p) => unsafe { Self::from_raw(p.as_ptr()) },
            None => Self::empty(),
        }
    }

    /// Observe the object behind a raw pointer. Null gives an empty handle.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a live object owned through
    /// `StrongPtr` handles, and the caller must hold one of its strong
    /// references (or be sure one outlives this call) until it returns.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        let Some(target) = NonNull::new(ptr) else {
            return Self::empty();
        };
        let block = unsafe { target.as_ref().ref_count().weak_ref() };
        Self {
            block,
            target: Some(target),
        }
    }

    /// Upgrade to an owning handle, or an empty one if the target is gone.
    pub fn lock(&self) -> StrongPtr<T> {
        self.try_lock().unwrap_or_default()
    }

    /// Like `lock`, but tells an empty weak handle apart from a dead target.
    pub fn try_lock(&self) -> Result<StrongPtr<T>, LockError> {
        let (Some(block), Some(target)) = (self.block.get(), self.target) else {
            return Err(LockError::Empty);
        };
        if block.try_acquire() {
            // SAFETY: the compare-exchange claimed the reference this handle
            // now owns.
            Ok(unsafe { StrongPtr::adopt(target.as_ptr()) })
        } else {
            Err(LockError::Expired)
        }
    }

    /// True when there is no target or it has been finalized.
    pub fn expired(&self) -> bool {
        self.block
            .get()
            .map_or(true, |b| b.is_severed() || b.owner_use_count() == 0)
    }

    /// Snapshot of the target's strong count, 0 when empty or expired.
    pub fn use_count(&self) -> usize {
        self.block.get().map_or(0, |b| b.owner_use_count())
    }

    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    /// True when both handles observe the same object.
    pub fn ptr_eq<U: ?Sized + RefCounted<Counter = WeakCounter>>(this: &Self, other: &WeakPtr<U>) -> bool {
        StrongPtr::ptr_eq(&this.block, &other.block)
    }

    /// Convert the observed type through a raw-pointer mapping. `upcast!`
    /// wraps this for unsizing conversions.
    ///
    /// # Safety
    /// `f` must return a non-null pointer to the same object, viewed as a
    /// type that counts through the same `WeakCounter`. The pointer may be
    /// dangling, so `f` must not dereference it.
    pub unsafe fn map_raw<U, F>(mut self, f: F) -> WeakPtr<U>
    where
        U: ?Sized + RefCounted<Counter = WeakCounter>,
        F: FnOnce(*mut T) -> *mut U,
    {
        WeakPtr {
            block: self.block.take(),
            target: self.target.take().and_then(|p| NonNull::new(f(p.as_ptr()))),
        }
    }
}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> StrongPtr<T> {
    /// A weak handle observing this handle's target.
    pub fn downgrade(&self) -> WeakPtr<T> {
        WeakPtr::new(self)
    }
}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> From<&StrongPtr<T>> for WeakPtr<T> {
    fn from(strong: &StrongPtr<T>) -> Self {
        WeakPtr::new(strong)
    }
}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> Clone for WeakPtr<T> {
    fn clone(&self) -> Self {
        Self {
            block: self.block.clone(),
            target: self.target,
        }
    }
}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> Default for WeakPtr<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized + RefCounted<Counter = WeakCounter>> fmt::Debug for WeakPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakPtr")
            .field("block", &self.block.get())
            .finish()
    }
}
