//! rc-intrusive: intrusive reference counting with optional weak references.
//!
//! Objects embed their own counter and expose it through `RefCounted`.
//! `StrongPtr<T>` owns such an object; `WeakPtr<T>` observes one without
//! keeping it alive and can be upgraded with `lock` while it still lives.
//!
//! ```rust
//! use rc_intrusive::{RefCounted, StrongPtr, WeakCounter};
//!
//! #[derive(Default)]
//! struct Session {
//!     rc: WeakCounter,
//!     id: u32,
//! }
//!
//! impl RefCounted for Session {
//!     type Counter = WeakCounter;
//!     fn ref_count(&self) -> &WeakCounter {
//!         &self.rc
//!     }
//! }
//!
//! let s = StrongPtr::new(Session { id: 9, ..Session::default() });
//! let w = s.downgrade();
//! assert_eq!(w.lock().id, 9);
//! drop(s);
//! assert!(w.lock().is_empty());
//! assert!(w.expired());
//! ```
//!
//! Layers
//! - `counter`: counter policies (`ThreadSafe`, `ThreadUnsafe`) and the embedded `StrongCounter`.
//! - `strong`: the `RefCounted` capability, `StrongPtr` and its casts.
//! - `weak`: `WeakCounter`, the lazily published `ControlBlock`, `WeakPtr` and the lock protocol.
//! - `hash`: identity-keyed `StrongSet`/`StrongMap` with the feature-selected hasher.

pub mod counter;
mod error;
pub mod hash;
pub mod strong;
pub mod weak;

pub use counter::{CounterPolicy, RefCount, StrongCounter, ThreadSafe, ThreadUnsafe};
pub use error::LockError;
pub use hash::{DefaultHashBuilder, StrongMap, StrongSet};
pub use strong::{AsAny, RefCounted, StrongPtr};
pub use weak::{ControlBlock, WeakCounter, WeakPtr};

/// Convert a `StrongPtr` or `WeakPtr` into one viewing the same object as a
/// supertype, typically a trait object.
///
/// Only unsizing coercions compile, so the conversion cannot change which
/// object or counter the handle refers to.
///
/// ```rust
/// use rc_intrusive::{upcast, RefCounted, StrongCounter, StrongPtr};
///
/// trait Shape: RefCounted<Counter = StrongCounter> {
///     fn area(&self) -> f64;
/// }
///
/// #[derive(Default)]
/// struct Square {
///     rc: StrongCounter,
///     side: f64,
/// }
///
/// impl RefCounted for Square {
///     type Counter = StrongCounter;
///     fn ref_count(&self) -> &StrongCounter {
///         &self.rc
///     }
/// }
///
/// impl Shape for Square {
///     fn area(&self) -> f64 {
///         self.side * self.side
///     }
/// }
///
/// let sq = StrongPtr::new(Square { side: 2.0, ..Square::default() });
/// let shape: StrongPtr<dyn Shape> = upcast!(sq.clone(), dyn Shape);
/// assert_eq!(shape.area(), 4.0);
/// assert_eq!(sq.use_count(), 2);
/// ```
#[macro_export]
macro_rules! upcast {
    ($handle:expr, $target:ty) => {
        // SAFETY: the closure body is a coercion site, so it only accepts
        // unsizing conversions of the same pointer.
        unsafe { $handle.map_raw(|p| -> *mut $target { p }) }
    };
}
