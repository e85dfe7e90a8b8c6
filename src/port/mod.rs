//! Port layer - CPU-specific implementations
//!
//! Interrupt-controller access and trap glue. On Cortex-M the NVIC backs
//! [`InterruptLines`] and device interrupts reach the installed kernel
//! through the `cortex-m-rt` default handler.

#[cfg(target_arch = "arm")]
pub mod nvic;

#[cfg(target_arch = "arm")]
pub use nvic::*;

use crate::irq::InterruptLines;
use crate::types::{Irq, Priority};

/// Interrupt lines without a controller behind them
///
/// Keeps the requested line state so host simulations and tests can inspect
/// it.
#[derive(Debug, Default)]
pub struct NullLines {
    unmasked: u32,
    fiq: Option<Irq>,
}

impl NullLines {
    pub const fn new() -> Self {
        NullLines {
            unmasked: 0,
            fiq: None,
        }
    }

    pub fn is_unmasked(&self, irq: Irq) -> bool {
        self.unmasked & irq.mask() != 0
    }

    pub fn fiq(&self) -> Option<Irq> {
        self.fiq
    }
}

impl InterruptLines for NullLines {
    fn unmask(&mut self, irq: Irq) {
        self.unmasked |= irq.mask();
    }

    fn mask(&mut self, irq: Irq) {
        self.unmasked &= !irq.mask();
    }

    fn set_priority(&mut self, _irq: Irq, _priority: Priority) {}

    fn route_fiq(&mut self, irq: Option<Irq>) {
        self.fiq = irq;
    }
}
