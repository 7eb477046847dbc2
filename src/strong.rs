//! Owning handles over intrusively counted objects.
//!
//! `RefCounted` is the capability an object exposes: access to the counter
//! it embeds and a `finalize` hook that receives the object's storage once
//! the last owner is gone. `StrongPtr<T>` is the value-typed owner built on
//! top of it. Cloning adds an owner, dropping removes one, and moving is a
//! plain Rust move with no count traffic.
//!
//! Polymorphism
//! - Every view of one object shares the single counter the concrete type owns. A trait that should be usable behind `StrongPtr<dyn Trait>` declares `RefCounted<Counter = ...>` as a supertrait and the concrete type implements it once.
//! - Upcasts go through `upcast!`, which only compiles for unsizing coercions (`StrongPtr<Circle>` to `StrongPtr<dyn Shape>`).
//! - Downcasts go through `AsAny`: `dynamic_cast` clones into an empty-on-mismatch handle, `downcast` consumes and hands the source back on mismatch.
//!
//! Identity
//! - Equality, ordering and hashing compare the data address only; two handles are equal exactly when they own the same object. Empty handles compare equal to each other.

use core::any::Any;
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use core::ops::Deref;
use core::ptr::{self, NonNull};

use crate::counter::RefCount;

/// An object that tracks its own owners.
///
/// Objects handled by `StrongPtr` live in a `Box` allocation. When the count
/// reaches zero the pointer layer rebuilds that `Box` and passes it to
/// `finalize` exactly once.
pub trait RefCounted {
    /// The counter embedded in the object.
    type Counter: RefCount;

    fn ref_count(&self) -> &Self::Counter;

    /// Dispose of the object after its last owner released it.
    ///
    /// The default drops the box. Overrides take over the storage and decide
    /// its fate (return it to a pool, hand it to a deferred free list...);
    /// whatever they do, the object must not be given new owners through
    /// handles that predate finalization.
    fn finalize(self: Box<Self>) {
        drop(self)
    }

    /// Snapshot of the number of owners, for diagnostics only.
    fn use_count(&self) -> usize {
        self.ref_count().use_count()
    }
}

/// Runtime type access used by `StrongPtr::dynamic_cast` and `downcast`.
///
/// Implemented for every `'static` sized type; add it as a supertrait of an
/// object trait to make `StrongPtr<dyn Trait>` downcastable.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    #[inline]
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Add an owner to the object behind `ptr`.
///
/// # Safety
/// `ptr` must point to a live object that is owned through `StrongPtr`
/// handles (or will be adopted by one).
#[inline]
pub unsafe fn increment<T: ?Sized + RefCounted>(ptr: NonNull<T>) {
    unsafe { ptr.as_ref() }.ref_count().increment();
}

/// Release one owner of the object behind `ptr`, finalizing it if that was
/// the last one. Returns the number of owners left.
///
/// This is the manual counterpart of dropping a `StrongPtr`, for pointers
/// obtained from `StrongPtr::detach`.
///
/// # Safety
/// `ptr` must carry one owned reference, which this call consumes. The
/// object must have been allocated as a `Box<T>`.
#[inline]
pub unsafe fn decrement<T: ?Sized + RefCounted>(ptr: NonNull<T>) -> usize {
    let remaining = unsafe { ptr.as_ref() }.ref_count().decrement();
    if remaining == 0 {
        // SAFETY: only the release that observed zero gets here, and the
        // object was boxed when its first owner was created.
        T::finalize(unsafe { Box::from_raw(ptr.as_ptr()) });
    }
    remaining
}

/// Value-typed owning handle to an intrusively counted object.
pub struct StrongPtr<T: ?Sized + RefCounted> {
    ptr: Option<NonNull<T>>,
    _owns: PhantomData<T>,
}

// Handles only touch the shared counter and hand out `&T`.
unsafe impl<T: ?Sized + RefCounted + Send + Sync> Send for StrongPtr<T> {}
unsafe impl<T: ?Sized + RefCounted + Send + Sync> Sync for StrongPtr<T> {}

impl<T: RefCounted> StrongPtr<T> {
    /// Box `value` and become its first owner.
    pub fn new(value: T) -> Self {
        Self::from(Box::new(value))
    }
}

impl<T: ?Sized + RefCounted> StrongPtr<T> {
    pub const fn empty() -> Self {
        Self {
            ptr: None,
            _owns: PhantomData,
        }
    }

    /// Wrap a raw pointer and add an owner for this handle.
    ///
    /// A null pointer yields an empty handle.
    ///
    /// # Safety
    /// A non-null `ptr` must point to a live, `Box`-allocated object whose
    /// count is already held by some owner.
    pub unsafe fn from_raw(ptr: *mut T) -> Self {
        let ptr = NonNull::new(ptr);
        if let Some(p) = ptr {
            unsafe { increment(p) };
        }
        Self {
            ptr,
            _owns: PhantomData,
        }
    }

    /// Wrap a raw pointer, taking over a reference the caller already owns.
    ///
    /// This is the inverse of `detach`.
    ///
    /// # Safety
    /// A non-null `ptr` must carry one owned reference to a live,
    /// `Box`-allocated object. That reference moves into the handle.
    pub unsafe fn adopt(ptr: *mut T) -> Self {
        Self {
            ptr: NonNull::new(ptr),
            _owns: PhantomData,
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: a non-empty handle keeps its target alive.
        self.ptr.map(|p| unsafe { &*p.as_ptr() })
    }

    #[inline]
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.ptr
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ptr.is_none()
    }

    /// Number of owners of the target, 0 for an empty handle.
    pub fn use_count(&self) -> usize {
        self.get().map_or(0, |t| t.use_count())
    }

    /// Give up ownership without releasing it.
    ///
    /// The handle becomes empty. The caller owns the returned reference and
    /// must eventually `adopt` it again or release it with `decrement`.
    #[must_use = "dropping a detached pointer leaks its reference"]
    pub fn detach(&mut self) -> Option<NonNull<T>> {
        self.ptr.take()
    }

    /// Release the target, if any, and leave the handle empty.
    pub fn reset(&mut self) {
        *self = Self::empty();
    }

    pub fn swap(&mut self, other: &mut Self) {
        core::mem::swap(&mut self.ptr, &mut other.ptr);
    }

    /// Move the target out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        core::mem::take(self)
    }

    #[inline]
    pub fn ptr_eq<U: ?Sized + RefCounted>(this: &Self, other: &StrongPtr<U>) -> bool {
        this.addr() == other.addr()
    }

    /// Convert the handle through a raw-pointer mapping, keeping the owned
    /// reference. `upcast!` wraps this for unsizing conversions.
    ///
    /// # Safety
    /// `f` must return a non-null pointer to the same object, viewed as a
    /// type that counts through the same embedded counter.
    pub unsafe fn map_raw<U, F>(mut self, f: F) -> StrongPtr<U>
    where
        U: ?Sized + RefCounted<Counter = T::Counter>,
        F: FnOnce(*mut T) -> *mut U,
    {
        match self.detach() {
            None => StrongPtr::empty(),
            Some(p) => unsafe { StrongPtr::adopt(f(p.as_ptr())) },
        }
    }

    /// Reinterpret the pointee as `U`, keeping the owned reference.
    ///
    /// # Safety
    /// The object must actually be a `U`.
    pub unsafe fn static_cast<U>(self) -> StrongPtr<U>
    where
        U: RefCounted<Counter = T::Counter>,
    {
        unsafe { self.map_raw(|p| p.cast::<U>()) }
    }

    /// Copying form of `static_cast`: a new owner viewed as `U`, leaving this
    /// handle as it was.
    ///
    /// # Safety
    /// The object must actually be a `U`.
    pub unsafe fn static_cast_cloned<U>(&self) -> StrongPtr<U>
    where
        U: RefCounted<Counter = T::Counter>,
    {
        unsafe { self.clone().static_cast() }
    }

    /// Thin data address, null for an empty handle.
    #[inline]
    fn addr(&self) -> *const () {
        self.ptr
            .map_or(ptr::null(), |p| p.as_ptr() as *const T as *const ())
    }
}

impl<T: ?Sized + RefCounted + AsAny> StrongPtr<T> {
    /// A new owner of the target viewed as `U`, or an empty handle if the
    /// target is not a `U`. The source is left untouched either way.
    pub fn dynamic_cast<U>(&self) -> StrongPtr<U>
    where
        U: RefCounted<Counter = T::Counter> + Any,
    {
        if self.is::<U>() {
            // SAFETY: the type check above proves the target is a `U`.
            unsafe { self.clone().map_raw(|p| p.cast::<U>()) }
        } else {
            StrongPtr::empty()
        }
    }

    /// Convert this handle into one typed as `U`.
    ///
    /// On mismatch the handle comes back unchanged in `Err`, still owning
    /// its target; only a successful conversion consumes it.
    pub fn downcast<U>(self) -> Result<StrongPtr<U>, Self>
    where
        U: RefCounted<Counter = T::Counter> + Any,
    {
        if self.is::<U>() {
            // SAFETY: the type check above proves the target is a `U`.
            Ok(unsafe { self.map_raw(|p| p.cast::<U>()) })
        } else {
            Err(self)
        }
    }

    pub fn is<U: Any>(&self) -> bool {
        self.get().is_some_and(|t| t.as_any().is::<U>())
    }
}

impl<T: ?Sized + RefCounted> From<Box<T>> for StrongPtr<T> {
    fn from(value: Box<T>) -> Self {
        let ptr = NonNull::from(Box::leak(value));
        // SAFETY: freshly leaked box, nobody else can observe the count yet.
        unsafe { increment(ptr) };
        Self {
            ptr: Some(ptr),
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized + RefCounted> Clone for StrongPtr<T> {
    fn clone(&self) -> Self {
        if let Some(p) = self.ptr {
            // SAFETY: this handle keeps the target alive.
            unsafe { increment(p) };
        }
        Self {
            ptr: self.ptr,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized + RefCounted> Drop for StrongPtr<T> {
    fn drop(&mut self) {
        if let Some(p) = self.ptr.take() {
            // SAFETY: the handle owned exactly this reference.
            unsafe { decrement(p) };
        }
    }
}

impl<T: ?Sized + RefCounted> Default for StrongPtr<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: ?Sized + RefCounted> Deref for StrongPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match self.get() {
            Some(t) => t,
            None => panic!("dereferenced an empty StrongPtr"),
        }
    }
}

impl<T: ?Sized + RefCounted, U: ?Sized + RefCounted> PartialEq<StrongPtr<U>> for StrongPtr<T> {
    fn eq(&self, other: &StrongPtr<U>) -> bool {
        self.addr() == other.addr()
    }
}

impl<T: ?Sized + RefCounted> Eq for StrongPtr<T> {}

impl<T: ?Sized + RefCounted> PartialOrd for StrongPtr<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ?Sized + RefCounted> Ord for StrongPtr<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr().cmp(&other.addr())
    }
}

impl<T: ?Sized + RefCounted> Hash for StrongPtr<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state)
    }
}

impl<T: ?Sized + RefCounted> fmt::Pointer for StrongPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&self.addr(), f)
    }
}

impl<T: ?Sized + RefCounted> fmt::Debug for StrongPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrongPtr")
            .field("ptr", &self.addr())
            .field("use_count", &self.use_count())
            .finish()
    }
}
