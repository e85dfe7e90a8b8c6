//! Interrupt-driven peripheral drivers
//!
//! A driver serves the requests of one HAL group for one peripheral
//! instance. Requests arrive as IPC messages routed by the kernel; a driver
//! either answers at once ([`Reply::Ready`]) or arms a [`Channel`] and
//! leaves the request pending until its interrupt handler completes it.
//!
//! Common request layout:
//!
//! | item         | param1 | param2    | param3                    |
//! |--------------|--------|-----------|---------------------------|
//! | `IPC_OPEN`   | port   | mode      | speed / max packet size   |
//! | `IPC_CLOSE`  | port   |           |                           |
//! | `IPC_READ`   | port   | io handle | size                      |
//! | `IPC_WRITE`  | port   | io handle |                           |
//! | `IPC_FLUSH`  | port   |           |                           |
//!
//! Completions echo `cmd` and `param1`, carry the io handle in `param2` and
//! the size or error in `param3`.

pub mod can;
pub mod channel;
pub mod i2c;
pub mod regs;
pub mod uart;
pub mod usb;

pub use channel::{Channel, Phase, Transfer};
pub use regs::{Mmio, RamRegisters, Registers};

use crate::critical::CriticalSection;
use crate::error::{Error, Result};
use crate::io::IoContext;
use crate::ipc::IpcMessage;
use crate::irq::IrqHandler;
use crate::types::{HalGroup, Irq, ProcessHandle};

/// Answer to a driver request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Finished synchronously with this result
    Ready(Result<u32>),
    /// Accepted; a completion follows from interrupt context
    Pending,
}

impl From<Result<u32>> for Reply {
    fn from(result: Result<u32>) -> Reply {
        Reply::Ready(result)
    }
}

/// Peripheral driver
pub trait Driver: IrqHandler {
    /// HAL group served
    fn group(&self) -> HalGroup;

    /// Port number within the group, matched against request `param1`
    fn port(&self) -> u8;

    /// Interrupt vector of the peripheral
    fn irq(&self) -> Irq;

    /// Serve one request
    ///
    /// Runs in process context inside the critical section `cs`, which also
    /// guards the driver state against its own interrupt handler.
    fn request(&self, cs: &CriticalSection, io: &mut IoContext, msg: &IpcMessage) -> Reply;
}

/// Port number addressed by a request
#[inline]
pub fn request_port(msg: &IpcMessage) -> u8 {
    msg.param1 as u8
}

/// Open/owner bookkeeping shared by the drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    owner: Option<ProcessHandle>,
}

impl Ownership {
    pub const fn new() -> Self {
        Ownership { owner: None }
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.owner.is_some()
    }

    #[inline]
    pub fn owner(&self) -> Option<ProcessHandle> {
        self.owner
    }

    /// Take ownership for `process`
    pub fn open(&mut self, process: ProcessHandle) -> Result<()> {
        if self.owner.is_some() {
            return Err(Error::AlreadyConfigured);
        }
        self.owner = Some(process);
        Ok(())
    }

    /// Check that `process` may use the port
    pub fn check(&self, process: ProcessHandle) -> Result<()> {
        match self.owner {
            None => Err(Error::NotConfigured),
            Some(p) if p != process => Err(Error::AccessDenied),
            Some(_) => Ok(()),
        }
    }

    pub fn close(&mut self) {
        self.owner = None;
    }
}

impl Default for Ownership {
    fn default() -> Self {
        Self::new()
    }
}
