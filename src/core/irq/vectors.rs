//! Vector dispatch table
//!
//! One slot and one priority per vector. A slot holds a [`Vector`], a sum type
//! instead of a raw function pointer, so every registration is type-checked
//! and an empty slot still dispatches somewhere (the default handler).

use crate::config::{IRQ_LOWEST_PRIORITY, IRQ_VECTORS_COUNT};
use crate::critical::CriticalSection;
use crate::drivers::Driver;
use crate::types::{Irq, Priority};

use super::IsrContext;

/// Interrupt service routine
pub trait IrqHandler {
    /// Service one entry of `irq`
    ///
    /// Runs with interrupts masked; `cs` grants access to state shared with
    /// process context.
    fn handle(&self, cs: &CriticalSection, irq: Irq, ctx: &mut IsrContext<'_>);
}

/// Dispatch table entry
#[derive(Clone, Copy)]
pub enum Vector<'a> {
    /// Nothing registered: the default handler logs and returns
    Unassigned,
    /// Free-standing interrupt handler
    Handler(&'a dyn IrqHandler),
    /// Peripheral driver installed by the kernel on open
    Driver(&'a dyn Driver),
}

impl<'a> Vector<'a> {
    #[inline]
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Vector::Unassigned)
    }
}

/// Handlers and priorities indexed by vector number
pub struct VectorTable<'a> {
    vectors: [Vector<'a>; IRQ_VECTORS_COUNT],
    priorities: [Priority; IRQ_VECTORS_COUNT],
}

impl<'a> VectorTable<'a> {
    pub const fn new() -> Self {
        VectorTable {
            vectors: [Vector::Unassigned; IRQ_VECTORS_COUNT],
            priorities: [IRQ_LOWEST_PRIORITY; IRQ_VECTORS_COUNT],
        }
    }

    #[inline]
    pub fn vector(&self, irq: Irq) -> Vector<'a> {
        self.vectors[irq.index()]
    }

    #[inline]
    pub fn priority(&self, irq: Irq) -> Priority {
        self.priorities[irq.index()]
    }

    #[inline]
    pub fn priorities(&self) -> &[Priority; IRQ_VECTORS_COUNT] {
        &self.priorities
    }

    /// Install a vector. The table is only changed with interrupts disabled.
    #[inline]
    pub fn set_vector(&mut self, _cs: &CriticalSection, irq: Irq, vector: Vector<'a>) {
        self.vectors[irq.index()] = vector;
    }

    #[inline]
    pub fn set_priority(&mut self, _cs: &CriticalSection, irq: Irq, priority: Priority) {
        self.priorities[irq.index()] = priority;
    }
}

impl<'a> Default for VectorTable<'a> {
    fn default() -> Self {
        Self::new()
    }
}
