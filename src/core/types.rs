//! Core type definitions for RExOS
//!
//! These types provide strong typing for kernel primitives.

use crate::config::IRQ_VECTORS_COUNT;

/// Interrupt priority (0 = most urgent)
pub type Priority = u8;

/// Interrupt vector number
///
/// A dense index into the vector table. "No vector" is `Option<Irq>::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct Irq(u8);

impl Irq {
    /// Create a vector number, `None` if it is outside the vector table
    #[inline]
    pub const fn new(n: u8) -> Option<Irq> {
        if (n as usize) < IRQ_VECTORS_COUNT {
            Some(Irq(n))
        } else {
            None
        }
    }

    /// Vector number as a table index
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw vector number
    #[inline(always)]
    pub const fn number(self) -> u8 {
        self.0
    }

    /// Single-bit mask for this vector
    #[inline(always)]
    pub const fn mask(self) -> u32 {
        1 << self.0
    }
}

/// Process handle
///
/// Identifies the process a request came from and the destination of its
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct ProcessHandle(pub u16);

impl ProcessHandle {
    /// The kernel itself (notifications without an owner)
    pub const KERNEL: ProcessHandle = ProcessHandle(0);
}

/// Packed IPC command: HAL group in the high half, item in the low half
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct Cmd(u32);

impl Cmd {
    #[inline(always)]
    pub const fn new(group: HalGroup, item: u16) -> Cmd {
        Cmd(((group.0 as u32) << 16) | item as u32)
    }

    #[inline(always)]
    pub const fn group(self) -> HalGroup {
        HalGroup((self.0 >> 16) as u16)
    }

    #[inline(always)]
    pub const fn item(self) -> u16 {
        self.0 as u16
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn from_raw(raw: u32) -> Cmd {
        Cmd(raw)
    }
}

/// Hardware abstraction group a request is routed by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct HalGroup(pub u16);

/// HAL groups
pub mod hal {
    use super::HalGroup;

    pub const SYSTEM: HalGroup = HalGroup(0);
    pub const UART: HalGroup = HalGroup(1);
    pub const I2C: HalGroup = HalGroup(2);
    pub const CAN: HalGroup = HalGroup(3);
    pub const USB: HalGroup = HalGroup(4);
}

/// IPC command items
pub mod ipc_item {
    pub const IPC_OPEN: u16 = 1;
    pub const IPC_CLOSE: u16 = 2;
    pub const IPC_READ: u16 = 3;
    pub const IPC_WRITE: u16 = 4;
    pub const IPC_FLUSH: u16 = 5;

    /// First item number free for per-driver commands
    pub const IPC_USER: u16 = 0x100;

    /// CAN frame transmitted (or dropped) completion
    pub const IPC_CAN_TXC: u16 = IPC_USER;
    /// CAN bus state change notification
    pub const IPC_CAN_BUS_STATE: u16 = IPC_USER + 1;
    /// Re-initialise the CAN controller after bus-off
    pub const IPC_CAN_RESET: u16 = IPC_USER + 2;

    /// Configure a USB endpoint
    pub const IPC_USB_EP_OPEN: u16 = IPC_USER + 0x10;
    pub const IPC_USB_EP_CLOSE: u16 = IPC_USER + 0x11;
    pub const IPC_USB_EP_SET_STALL: u16 = IPC_USER + 0x12;
    pub const IPC_USB_EP_CLEAR_STALL: u16 = IPC_USER + 0x13;
}

/// Processor execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub enum ExecContext {
    /// Kernel code outside any interrupt
    Supervisor,
    /// Servicing an IRQ vector
    Irq,
    /// Servicing the FIQ vector
    Fiq,
    /// Unprivileged process code
    User,
}

/// ARM7 CPSR mode field values
pub mod cpu_mode {
    pub const MASK: u32 = 0x1F;
    pub const USR: u32 = 0x10;
    pub const FIQ: u32 = 0x11;
    pub const IRQ: u32 = 0x12;
    pub const SVC: u32 = 0x13;
    pub const ABT: u32 = 0x17;
    pub const UND: u32 = 0x1B;
    pub const SYS: u32 = 0x1F;
}

/// CPU traps that terminate the system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub enum Trap {
    UndefinedInstruction,
    PrefetchAbort,
    DataAbort,
    /// Cortex-M escalated fault
    HardFault,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_range() {
        assert!(Irq::new(0).is_some());
        assert!(Irq::new((IRQ_VECTORS_COUNT - 1) as u8).is_some());
        assert!(Irq::new(IRQ_VECTORS_COUNT as u8).is_none());
    }

    #[test]
    fn test_cmd_packing() {
        let cmd = Cmd::new(hal::CAN, ipc_item::IPC_CAN_TXC);
        assert_eq!(cmd.group(), hal::CAN);
        assert_eq!(cmd.item(), ipc_item::IPC_CAN_TXC);
        assert_eq!(Cmd::from_raw(cmd.raw()), cmd);
    }
}
