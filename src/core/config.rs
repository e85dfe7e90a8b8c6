//! Compile-time configuration for RExOS
//!
//! These constants control the resource limits of the interrupt core, the
//! IPC layer and the peripheral drivers.

/// Number of interrupt vectors handled by the dispatcher
pub const IRQ_VECTORS_COUNT: usize = 32;

/// Numerically highest (least urgent) interrupt priority
pub const IRQ_LOWEST_PRIORITY: u8 = 15;

/// Depth of the interrupt-to-process mailbox.
///
/// `heapless::spsc::Queue` keeps one slot free, so this holds
/// `IPC_QUEUE_SIZE - 1` messages.
pub const IPC_QUEUE_SIZE: usize = 32;

/// Number of I/O descriptor slots in the arena
pub const IO_SLOTS: usize = 16;

/// Data capacity of one I/O descriptor in bytes
pub const IO_BUF_SIZE: usize = 512;

/// Words of driver parameters carried alongside an I/O buffer
pub const IO_STACK_WORDS: usize = 2;

/// Driver instances the kernel can route requests to
pub const DRIVERS_MAX: usize = 8;

/// Largest transfer the I2C peripheral moves without an NBYTES reload
pub const I2C_MAX_NBYTES: usize = 255;

/// Frames waiting for the CAN transmit mailbox
pub const CAN_TX_QUEUE_SIZE: usize = 8;

/// Received CAN frames buffered while no read is armed
pub const CAN_RX_QUEUE_SIZE: usize = 4;

/// Endpoints per direction on the USB device controller
pub const USB_EP_COUNT: usize = 4;

/// Largest full-speed bulk packet
pub const USB_MAX_PACKET_SIZE: usize = 64;
