//! RExOS kernel core in Rust
//!
//! The interrupt/IPC/driver core of a small real-time operating system for
//! ARM Cortex-M3/M0 and ARM7 microcontrollers:
//! - Prioritized IRQ pending queue and vector dispatch table
//! - Exactly-once IPC completion of asynchronous I/O
//! - Interrupt-driven peripheral state machines (I2C, UART, CAN, USB)

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

// ============ Critical Section ============

#[cfg(target_arch = "arm")]
mod cs_impl {
    use cortex_m::interrupt;
    use cortex_m::register::primask;
    use critical_section::{set_impl, Impl, RawRestoreState};

    struct SingleCoreCriticalSection;
    set_impl!(SingleCoreCriticalSection);

    unsafe impl Impl for SingleCoreCriticalSection {
        unsafe fn acquire() -> RawRestoreState {
            let was_active = primask::read().is_active();
            interrupt::disable();
            was_active
        }

        unsafe fn release(was_active: RawRestoreState) {
            if was_active {
                unsafe { interrupt::enable() }
            }
        }
    }
}

// ============ Modules ============

pub mod log;
mod lang_items;

pub mod core;
pub mod drivers;
pub mod api;
pub mod port;

// ============ Re-exports ============

pub use self::core::config;
pub use self::core::config::*;
pub use self::core::critical;
pub use self::core::error;
pub use self::core::error::{Error, ErrorKind, Result};
pub use self::core::io;
pub use self::core::ipc;
pub use self::core::irq;
pub use self::core::kernel;
pub use self::core::kernel::Kernel;
pub use self::core::types;
pub use self::core::types::*;

#[cfg(feature = "pac")]
pub use stm32_metapac as pac;
