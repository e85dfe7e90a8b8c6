//! Critical section protected cell
//!
//! Zero-overhead wrapper for state shared between process context and
//! interrupt context, such as a driver's in-flight transfer.

use core::cell::UnsafeCell;
use crate::critical::CriticalSection;

/// A cell that can only be accessed within a critical section.
pub struct CsCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for CsCell<T> {}

impl<T> CsCell<T> {
    /// Create a new CsCell
    #[inline(always)]
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Get a mutable reference to the inner value
    ///
    /// Callers must not hold two references obtained from the same cell at
    /// once; single-core execution with interrupts masked rules out any other
    /// accessor.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    pub fn get(&self, _cs: &CriticalSection) -> &mut T {
        unsafe { &mut *self.0.get() }
    }

    /// Run `f` on the inner value inside a fresh critical section
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let cs = CriticalSection::enter();
        f(self.get(&cs))
    }

    /// Consume the cell and return the inner value
    #[inline(always)]
    pub fn into_inner(self) -> T {
        self.0.into_inner()
    }
}
