//! Kernel context
//!
//! One explicit struct owns the interrupt core, the IPC layer and the driver
//! routing table. Trap entry points, the request path and the scheduler side
//! of the mailbox all go through it, so several independent kernels can live
//! side by side (one per test, for instance).

use heapless::Vec;

use crate::config::{DRIVERS_MAX, IRQ_LOWEST_PRIORITY};
use crate::critical::CriticalSection;
use crate::drivers::{request_port, Driver, Reply};
use crate::error::{Error, Result};
use crate::io::IoContext;
use crate::ipc::IpcMessage;
use crate::irq::{fatal_trap, InterruptLines, IrqCore, Vector};
use crate::types::{ipc_item, ExecContext, Irq, Priority, Trap};

struct Route<'a> {
    driver: &'a dyn Driver,
    priority: Priority,
}

pub struct Kernel<'a, L: InterruptLines> {
    pub irq: IrqCore<'a, L>,
    pub io: IoContext,
    drivers: Vec<Route<'a>, DRIVERS_MAX>,
}

impl<'a, L: InterruptLines> Kernel<'a, L> {
    pub const fn new(lines: L) -> Self {
        Kernel {
            irq: IrqCore::new(lines),
            io: IoContext::new(),
            drivers: Vec::new(),
        }
    }

    // ============ Drivers ============

    /// Make `driver` reachable by requests for its group and port
    ///
    /// Its vector is installed with `priority` when the port is opened.
    pub fn attach(&mut self, driver: &'a dyn Driver, priority: Priority) -> Result<()> {
        if priority > IRQ_LOWEST_PRIORITY {
            return Err(Error::InvalidParams);
        }
        if self.route(driver.group(), driver.port()).is_some() {
            return Err(Error::AlreadyConfigured);
        }
        self.drivers
            .push(Route { driver, priority })
            .map_err(|_| Error::OutOfSystemMemory)?;
        crate::debug!(
            "kernel: driver {=u16}:{=u8} on vector {=u8}",
            driver.group().0,
            driver.port(),
            driver.irq().number()
        );
        Ok(())
    }

    fn route(&self, group: crate::types::HalGroup, port: u8) -> Option<&Route<'a>> {
        self.drivers
            .iter()
            .find(|r| r.driver.group() == group && r.driver.port() == port)
    }

    /// Route a request to its driver
    ///
    /// A successful open installs the driver's vector and unmasks its line;
    /// a successful close masks the line and restores the default handler.
    pub fn request(&mut self, msg: &IpcMessage) -> Reply {
        let group = msg.cmd.group();
        let Some(route) = self.route(group, request_port(msg)) else {
            let err = if self.drivers.iter().any(|r| r.driver.group() == group) {
                Error::DeviceIndexOutOfRange
            } else {
                Error::NotSupported
            };
            return Reply::Ready(Err(err));
        };
        let (driver, priority) = (route.driver, route.priority);

        let cs = CriticalSection::enter();
        let reply = driver.request(&cs, &mut self.io, msg);
        if let Reply::Ready(Ok(_)) = reply {
            match msg.cmd.item() {
                ipc_item::IPC_OPEN => self.install(&cs, driver, priority),
                ipc_item::IPC_CLOSE => self.uninstall(&cs, driver.irq()),
                _ => {}
            }
        }
        reply
    }

    /// Driver loop step: serve `msg` and post a synchronous reply to its
    /// sender
    ///
    /// Pending requests are answered later by their completion.
    pub fn serve(&mut self, msg: &IpcMessage) -> Result<()> {
        match self.request(msg) {
            Reply::Ready(result) => {
                let mut reply = *msg;
                reply.set_result(result);
                self.io.post(reply)
            }
            Reply::Pending => Ok(()),
        }
    }

    fn install(&mut self, cs: &CriticalSection, driver: &'a dyn Driver, priority: Priority) {
        let irq = driver.irq();
        self.irq.register_vector(cs, irq, Vector::Driver(driver));
        if self.irq.set_priority(cs, irq, priority).is_err() {
            crate::warn!("kernel: bad priority for vector {=u8}", irq.number());
        }
        self.irq.lines_mut().unmask(irq);
    }

    fn uninstall(&mut self, cs: &CriticalSection, irq: Irq) {
        self.irq.lines_mut().mask(irq);
        self.irq.unregister_vector(cs, irq);
    }

    // ============ Trap entry ============

    /// IRQ trap entry for `irq`
    ///
    /// Runs the claimed vector, then every vector latched meanwhile, most
    /// urgent first, until the pending queue is empty. Entered while another
    /// vector is being serviced, it only latches `irq`.
    pub fn irq_entry(&mut self, irq: Irq) {
        let cs = CriticalSection::enter();
        let mut next = self.irq.enter(&cs, irq);
        while let Some((irq, vector)) = next {
            self.dispatch(&cs, irq, vector);
            next = self.irq.finish(&cs);
        }
    }

    /// FIQ trap entry: the FIQ vector runs at once, bypassing the queue
    pub fn fiq_entry(&mut self) {
        let cs = CriticalSection::enter();
        match self.irq.fiq() {
            Some((irq, vector)) => self.dispatch(&cs, irq, vector),
            None => crate::warn!("irq: FIQ without a source"),
        }
    }

    fn dispatch(&mut self, cs: &CriticalSection, irq: Irq, vector: Vector<'a>) {
        match vector {
            Vector::Unassigned => self.irq.default_irq_handler(irq),
            Vector::Handler(h) => {
                let mut ctx = self.irq.isr_context(&mut self.io);
                h.handle(cs, irq, &mut ctx);
            }
            Vector::Driver(d) => {
                let mut ctx = self.irq.isr_context(&mut self.io);
                d.handle(cs, irq, &mut ctx);
            }
        }
    }

    /// Undefined instruction, prefetch or data abort
    pub fn trap(&self, trap: Trap, address: u32) -> ! {
        fatal_trap(trap, address)
    }

    /// Classify the running code from CPU mode bits
    pub fn exec_context(&self, mode_bits: u32) -> ExecContext {
        self.irq.exec_context(mode_bits)
    }

    // ============ Scheduler side ============

    /// Next message for process context
    pub fn receive(&mut self) -> Option<IpcMessage> {
        self.io.receive()
    }
}
