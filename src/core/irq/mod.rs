//! Interrupt core
//!
//! Pending queue, vector table, FIQ slot and the bookkeeping of which vector
//! is being serviced. When a vector asserts while another one runs, it is
//! queued instead of lost; when the running handler returns, the most urgent
//! queued vector runs next, until the queue is empty.
//!
//! Registration calls take a `&CriticalSection`: the table is never changed
//! from interrupt context and never with interrupts enabled.

mod pending;
mod vectors;

pub use pending::PendingQueue;
pub use vectors::{IrqHandler, Vector, VectorTable};

use crate::config::{IRQ_LOWEST_PRIORITY, IRQ_VECTORS_COUNT};
use crate::critical::CriticalSection;
use crate::error::{Error, Result};
use crate::io::IoContext;
use crate::types::{cpu_mode, ExecContext, Irq, Priority, Trap};

/// Hardware interrupt line control
///
/// Implemented by the port for the interrupt controller in use.
pub trait InterruptLines {
    /// Let `irq` reach the CPU
    fn unmask(&mut self, irq: Irq);
    /// Block `irq` at the controller
    fn mask(&mut self, irq: Irq);
    /// Program the controller priority of `irq`
    fn set_priority(&mut self, irq: Irq, priority: Priority);
    /// Select the single line routed to FIQ, or none
    fn route_fiq(&mut self, irq: Option<Irq>);
}

/// What an interrupt handler may touch
pub struct IsrContext<'k> {
    /// IPC layer for completions and notifications
    pub io: &'k mut IoContext,
    pending: &'k mut PendingQueue,
    priorities: &'k [Priority; IRQ_VECTORS_COUNT],
}

impl<'k> IsrContext<'k> {
    /// Latch `irq` pending; it runs after the current handler returns,
    /// in priority order
    #[inline]
    pub fn raise(&mut self, irq: Irq) {
        self.pending.push(irq, self.priorities);
    }
}

/// Interrupt dispatch state
pub struct IrqCore<'a, L: InterruptLines> {
    table: VectorTable<'a>,
    pending: PendingQueue,
    current: Option<Irq>,
    fiq: Option<(Irq, Vector<'a>)>,
    lines: L,
    stray: u32,
}

impl<'a, L: InterruptLines> IrqCore<'a, L> {
    pub const fn new(lines: L) -> Self {
        IrqCore {
            table: VectorTable::new(),
            pending: PendingQueue::new(),
            current: None,
            fiq: None,
            lines,
            stray: 0,
        }
    }

    // ============ Pending queue ============

    /// Latch `irq` pending. Idempotent.
    ///
    /// Called from trap entry, where interrupts are already disabled.
    #[inline]
    pub fn push_pending(&mut self, _cs: &CriticalSection, irq: Irq) {
        self.pending.push(irq, self.table.priorities());
    }

    /// Remove and return the most urgent pending vector
    #[inline]
    pub fn pop_pending(&mut self, _cs: &CriticalSection) -> Option<Irq> {
        self.pending.pop()
    }

    /// Cancel a pending vector. Safe to call from process context.
    pub fn clear_pending(&mut self, irq: Irq) -> bool {
        let _cs = CriticalSection::enter();
        self.pending.remove(irq)
    }

    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    // ============ Vector table ============

    pub fn register_vector(&mut self, cs: &CriticalSection, irq: Irq, vector: Vector<'a>) {
        self.table.set_vector(cs, irq, vector);
    }

    /// Restore the default handler and forget a pending entry
    pub fn unregister_vector(&mut self, cs: &CriticalSection, irq: Irq) {
        self.table.set_vector(cs, irq, Vector::Unassigned);
        self.pending.remove(irq);
    }

    pub fn set_priority(&mut self, cs: &CriticalSection, irq: Irq, priority: Priority) -> Result<()> {
        if priority > IRQ_LOWEST_PRIORITY {
            return Err(Error::InvalidParams);
        }
        self.table.set_priority(cs, irq, priority);
        self.lines.set_priority(irq, priority);
        Ok(())
    }

    pub fn priority(&self, irq: Irq) -> Priority {
        self.table.priority(irq)
    }

    pub fn vector(&self, irq: Irq) -> Vector<'a> {
        self.table.vector(irq)
    }

    /// Install the FIQ vector
    ///
    /// Only one source can be routed to FIQ: the previous source loses its
    /// routing and the previous handler is overwritten.
    pub fn fiq_register_vector(&mut self, _cs: &CriticalSection, irq: Irq, vector: Vector<'a>) {
        if let Some((old, _)) = self.fiq {
            if old != irq {
                crate::debug!("irq: FIQ source {=u8} displaced by {=u8}", old.number(), irq.number());
            }
        }
        self.fiq = Some((irq, vector));
        self.lines.route_fiq(Some(irq));
    }

    pub fn fiq_unregister_vector(&mut self, _cs: &CriticalSection) {
        self.fiq = None;
        self.lines.route_fiq(None);
    }

    /// Source currently routed to FIQ
    pub fn fiq_source(&self) -> Option<Irq> {
        self.fiq.map(|(irq, _)| irq)
    }

    // ============ Dispatch ============

    /// Vector being serviced, `None` outside interrupt handlers
    #[inline]
    pub fn current_vector(&self) -> Option<Irq> {
        self.current
    }

    /// Trap entry for `irq`
    ///
    /// If a vector is already being serviced, `irq` is only latched pending
    /// and `None` is returned. Otherwise the most urgent of `irq` and the
    /// already pending vectors is claimed and returned for execution.
    pub fn enter(&mut self, cs: &CriticalSection, irq: Irq) -> Option<(Irq, Vector<'a>)> {
        self.push_pending(cs, irq);
        if self.current.is_some() {
            return None;
        }
        self.claim_next(cs)
    }

    /// The running handler returned: claim the next pending vector, if any
    pub fn finish(&mut self, cs: &CriticalSection) -> Option<(Irq, Vector<'a>)> {
        self.current = None;
        self.claim_next(cs)
    }

    fn claim_next(&mut self, cs: &CriticalSection) -> Option<(Irq, Vector<'a>)> {
        let irq = self.pop_pending(cs)?;
        self.current = Some(irq);
        Some((irq, self.table.vector(irq)))
    }

    pub(crate) fn fiq(&self) -> Option<(Irq, Vector<'a>)> {
        self.fiq
    }

    /// Handler context for one vector invocation
    pub(crate) fn isr_context<'k>(&'k mut self, io: &'k mut IoContext) -> IsrContext<'k> {
        IsrContext {
            io,
            pending: &mut self.pending,
            priorities: self.table.priorities(),
        }
    }

    /// Fallback for vectors without a handler. Non-fatal.
    pub fn default_irq_handler(&mut self, irq: Irq) {
        self.stray = self.stray.wrapping_add(1);
        crate::warn!("irq: unexpected vector {=u8}", irq.number());
    }

    /// Number of interrupts that hit the default handler
    pub fn stray_count(&self) -> u32 {
        self.stray
    }

    // ============ Lines ============

    pub fn lines(&self) -> &L {
        &self.lines
    }

    pub fn lines_mut(&mut self) -> &mut L {
        &mut self.lines
    }

    /// Execution context from CPU mode bits and the vector being serviced
    ///
    /// Nested IRQ handlers switch to System mode, so System/Supervisor mode
    /// with a current vector still counts as interrupt context.
    pub fn exec_context(&self, mode_bits: u32) -> ExecContext {
        match mode_bits & cpu_mode::MASK {
            cpu_mode::USR => ExecContext::User,
            cpu_mode::FIQ => ExecContext::Fiq,
            cpu_mode::IRQ => ExecContext::Irq,
            _ if self.current.is_some() => ExecContext::Irq,
            _ => ExecContext::Supervisor,
        }
    }
}

/// Unrecoverable CPU trap: report the faulting address and halt
///
/// Memory safety cannot be assumed after an abort, so nothing is resumed.
#[cold]
pub fn fatal_trap(trap: Trap, address: u32) -> ! {
    crate::error!("FATAL: {} at {=u32:#010x}", trap, address);

    #[cfg(target_arch = "arm")]
    {
        loop {
            cortex_m::asm::udf();
        }
    }

    #[cfg(not(target_arch = "arm"))]
    {
        panic!("fatal trap {:?} at {:#010x}", trap, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lines {
        fiq: Option<Irq>,
        prio: Option<(Irq, Priority)>,
    }

    impl InterruptLines for Lines {
        fn unmask(&mut self, _irq: Irq) {}
        fn mask(&mut self, _irq: Irq) {}
        fn set_priority(&mut self, irq: Irq, priority: Priority) {
            self.prio = Some((irq, priority));
        }
        fn route_fiq(&mut self, irq: Option<Irq>) {
            self.fiq = irq;
        }
    }

    fn irq(n: u8) -> Irq {
        Irq::new(n).unwrap()
    }

    #[test]
    fn test_enter_while_busy_latches() {
        let cs = CriticalSection::enter();
        let mut core = IrqCore::new(Lines::default());
        let (first, _) = core.enter(&cs, irq(4)).unwrap();
        assert_eq!(first, irq(4));
        assert_eq!(core.current_vector(), Some(irq(4)));
        assert!(core.enter(&cs, irq(6)).is_none());
        assert!(core.pending().contains(irq(6)));
        let (next, _) = core.finish(&cs).unwrap();
        assert_eq!(next, irq(6));
        assert!(core.finish(&cs).is_none());
        assert_eq!(core.current_vector(), None);
    }

    #[test]
    fn test_set_priority_bounds() {
        let cs = CriticalSection::enter();
        let mut core = IrqCore::new(Lines::default());
        assert_eq!(
            core.set_priority(&cs, irq(1), IRQ_LOWEST_PRIORITY + 1),
            Err(Error::InvalidParams)
        );
        core.set_priority(&cs, irq(1), 3).unwrap();
        assert_eq!(core.priority(irq(1)), 3);
        assert_eq!(core.lines().prio, Some((irq(1), 3)));
    }

    #[test]
    fn test_fiq_displaces_routing() {
        let cs = CriticalSection::enter();
        let mut core = IrqCore::new(Lines::default());
        core.fiq_register_vector(&cs, irq(2), Vector::Unassigned);
        core.fiq_register_vector(&cs, irq(9), Vector::Unassigned);
        assert_eq!(core.fiq_source(), Some(irq(9)));
        assert_eq!(core.lines().fiq, Some(irq(9)));
        core.fiq_unregister_vector(&cs);
        assert_eq!(core.lines().fiq, None);
    }

    #[test]
    fn test_exec_context() {
        let cs = CriticalSection::enter();
        let mut core = IrqCore::new(Lines::default());
        assert_eq!(core.exec_context(cpu_mode::SVC), ExecContext::Supervisor);
        assert_eq!(core.exec_context(cpu_mode::USR), ExecContext::User);
        assert_eq!(core.exec_context(cpu_mode::FIQ | 0xC0), ExecContext::Fiq);
        core.enter(&cs, irq(0));
        assert_eq!(core.exec_context(cpu_mode::SYS), ExecContext::Irq);
    }

    #[test]
    #[should_panic(expected = "fatal trap")]
    fn test_data_abort_is_fatal() {
        fatal_trap(Trap::DataAbort, 0x2000_0000);
    }
}
