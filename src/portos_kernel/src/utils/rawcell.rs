//! Provides [`RawCell`], an `UnsafeCell` that can be placed in shared
//! kernel objects.
use core::cell::UnsafeCell;

/// An `UnsafeCell` whose contents are protected by an external exclusion
/// discipline instead of a lock type.
///
/// The kernel uses this for state that is serialized by construction, such
/// as a signal group's waiter index, which is only ever touched by bodies
/// running at the group's priority ceiling. The accessor hands out a raw
/// pointer; every dereference site must uphold the owning object's
/// serialization invariant.
#[repr(transparent)]
pub struct RawCell<T>(UnsafeCell<T>);

impl<T> RawCell<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a pointer to the contents.
    #[inline]
    pub fn get(&self) -> *mut T {
        self.0.get()
    }
}

// Safety: `RawCell` only adds shared mutability. Whether concurrent access
// is actually possible is determined by the embedding object's exclusion
// discipline, which every dereference site is required to uphold.
unsafe impl<T: Send> Sync for RawCell<T> {}
