//! Cortex-M port
//!
//! The NVIC has no FIQ; the FIQ source is emulated by giving it the highest
//! hardware priority and keeping every IRQ vector one level below it.

use cortex_m::interrupt::InterruptNumber;
use cortex_m::peripheral::NVIC;

use crate::config::IRQ_VECTORS_COUNT;
use crate::core::cs_cell::CsCell;
use crate::critical::critical_section;
use crate::irq::InterruptLines;
use crate::kernel::Kernel;
use crate::types::{Irq, Priority};
use crate::config::IRQ_LOWEST_PRIORITY;

#[derive(Clone, Copy)]
struct Line(u16);

// SAFETY: `Line` is only built from `Irq`, which is range checked against
// the vector table.
unsafe impl InterruptNumber for Line {
    fn number(self) -> u16 {
        self.0
    }
}

impl From<Irq> for Line {
    fn from(irq: Irq) -> Line {
        Line(irq.number() as u16)
    }
}

/// NVIC-backed interrupt lines
pub struct NvicLines {
    prio_bits: u8,
    priorities: [Priority; IRQ_VECTORS_COUNT],
    fiq: Option<Irq>,
}

impl NvicLines {
    /// `prio_bits`: implemented NVIC priority bits (4 on STM32F4, 2 on M0)
    pub const fn new(prio_bits: u8) -> Self {
        NvicLines {
            prio_bits,
            priorities: [IRQ_LOWEST_PRIORITY; IRQ_VECTORS_COUNT],
            fiq: None,
        }
    }

    /// Hardware priority byte; level 0 is kept for the FIQ source
    fn hw_priority(&self, priority: Priority) -> u8 {
        let levels = 1u16 << self.prio_bits;
        let level = (priority as u16 + 1).min(levels - 1);
        (level << (8 - self.prio_bits)) as u8
    }

    fn program(&self, irq: Irq, hw: u8) {
        // SAFETY: priorities are changed inside the kernel critical section.
        unsafe {
            let mut p = cortex_m::Peripherals::steal();
            p.NVIC.set_priority(Line::from(irq), hw);
        }
    }
}

impl InterruptLines for NvicLines {
    fn unmask(&mut self, irq: Irq) {
        // SAFETY: the vector is installed before its line is unmasked.
        unsafe { NVIC::unmask(Line::from(irq)) }
    }

    fn mask(&mut self, irq: Irq) {
        NVIC::mask(Line::from(irq));
    }

    fn set_priority(&mut self, irq: Irq, priority: Priority) {
        self.priorities[irq.index()] = priority;
        if self.fiq != Some(irq) {
            self.program(irq, self.hw_priority(priority));
        }
    }

    fn route_fiq(&mut self, irq: Option<Irq>) {
        if let Some(old) = self.fiq {
            self.program(old, self.hw_priority(self.priorities[old.index()]));
        }
        self.fiq = irq;
        if let Some(new) = irq {
            self.program(new, 0);
        }
    }
}

type PortKernel = Kernel<'static, NvicLines>;

static KERNEL: CsCell<Option<&'static mut PortKernel>> = CsCell::new(None);

/// Hand the kernel to the trap glue
pub fn install(kernel: &'static mut PortKernel) {
    critical_section(|cs| *KERNEL.get(cs) = Some(kernel));
}

/// Run `f` on the installed kernel with interrupts masked
pub fn with_kernel<R>(f: impl FnOnce(&mut PortKernel) -> R) -> Option<R> {
    critical_section(|cs| KERNEL.get(cs).as_deref_mut().map(f))
}

#[cortex_m_rt::exception]
unsafe fn DefaultHandler(irqn: i16) {
    let Some(irq) = u8::try_from(irqn).ok().and_then(Irq::new) else {
        crate::warn!("port: unhandled exception {=i16}", irqn);
        return;
    };
    if with_kernel(|k| k.irq_entry(irq)).is_none() {
        NVIC::mask(Line::from(irq));
        crate::warn!("port: vector {=u8} before kernel install", irq.number());
    }
}
