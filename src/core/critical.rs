//! Critical section handling for RExOS
//!
//! Interrupt masking is the only synchronization primitive the core uses:
//! everything shared between process context and interrupt context is touched
//! while a [`CriticalSection`] guard is alive.

use core::marker::PhantomData;

use critical_section::RestoreState;
use portable_atomic::{AtomicU8, Ordering};

/// Critical section nesting depth.
///
/// `portable_atomic` keeps `fetch_add` available on Cortex-M0, which has no
/// native read-modify-write atomics.
static NESTING: AtomicU8 = AtomicU8::new(0);

/// RAII guard for critical sections
///
/// When this guard is created, interrupts are disabled.
/// When it is dropped, interrupts are restored to the state they had when the
/// guard was created, so guards nest.
pub struct CriticalSection {
    restore: RestoreState,
    _not_send: PhantomData<*mut ()>,
}

impl CriticalSection {
    /// Enter a critical section by disabling interrupts.
    #[inline(always)]
    pub fn enter() -> Self {
        // SAFETY: the matching release happens in `Drop`, in LIFO order with
        // any nested guard.
        let restore = unsafe { critical_section::acquire() };
        NESTING.fetch_add(1, Ordering::Acquire);
        CriticalSection {
            restore,
            _not_send: PhantomData,
        }
    }

    /// Check if we're currently in a critical section
    #[inline(always)]
    pub fn is_active() -> bool {
        NESTING.load(Ordering::Acquire) > 0
    }
}

impl Drop for CriticalSection {
    #[inline(always)]
    fn drop(&mut self) {
        NESTING.fetch_sub(1, Ordering::Release);
        // SAFETY: `restore` came from the `acquire` in `enter`.
        unsafe { critical_section::release(self.restore) };
    }
}

/// Execute a closure with interrupts disabled
///
/// The closure receives a reference to the critical section guard,
/// which can be used to access [`CsCell`](crate::core::cs_cell::CsCell)
/// protected data.
#[inline]
pub fn critical_section<F, R>(f: F) -> R
where
    F: FnOnce(&CriticalSection) -> R,
{
    let cs = CriticalSection::enter();
    f(&cs)
}

/// Check if currently executing in an ISR context
#[inline]
pub fn is_isr_context() -> bool {
    #[cfg(target_arch = "arm")]
    {
        let ipsr: u32;
        unsafe {
            core::arch::asm!(
                "mrs {}, IPSR",
                out(reg) ipsr,
                options(nomem, nostack, preserves_flags)
            );
        }
        ipsr != 0
    }

    #[cfg(not(target_arch = "arm"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guards_nest() {
        let outer = CriticalSection::enter();
        assert!(CriticalSection::is_active());
        {
            let _inner = CriticalSection::enter();
            assert!(CriticalSection::is_active());
        }
        assert!(CriticalSection::is_active());
        drop(outer);
    }

    #[test]
    fn test_closure_returns_value() {
        let v = critical_section(|_cs| 42);
        assert_eq!(v, 42);
    }
}
