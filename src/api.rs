//! Process-level driver API
//!
//! Builders for the request messages a process sends to a driver. Each one
//! packs its arguments in the layout the driver expects; the kernel routes
//! the message by HAL group and port. Synchronous requests are answered at
//! once, reads and writes are answered by their completion.

use crate::drivers::can;
use crate::drivers::i2c::I2cStack;
use crate::drivers::usb::{ep_param, EpAddr};
use crate::error::Result;
use crate::io::{Io, IoHandle};
use crate::ipc::IpcMessage;
use crate::types::{hal, ipc_item, Cmd, HalGroup, ProcessHandle};

const fn request(group: HalGroup, item: u16, process: ProcessHandle) -> IpcMessage {
    IpcMessage::new(Cmd::new(group, item), process)
}

// ============ UART ============

/// Open a UART at `baud`, assuming the default kernel clock
pub const fn uart_open(process: ProcessHandle, port: u8, baud: u32) -> IpcMessage {
    request(hal::UART, ipc_item::IPC_OPEN, process).with_params(port as u32, 0, baud)
}

pub const fn uart_close(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::UART, ipc_item::IPC_CLOSE, process).with_params(port as u32, 0, 0)
}

/// Receive up to `size` bytes; completes early on line idle
pub const fn uart_read(process: ProcessHandle, port: u8, io: IoHandle, size: u32) -> IpcMessage {
    request(hal::UART, ipc_item::IPC_READ, process).with_params(port as u32, io.raw(), size)
}

/// Transmit the valid bytes of `io`
pub const fn uart_write(process: ProcessHandle, port: u8, io: IoHandle) -> IpcMessage {
    request(hal::UART, ipc_item::IPC_WRITE, process).with_params(port as u32, io.raw(), 0)
}

/// Cancel pending reads and writes
pub const fn uart_flush(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::UART, ipc_item::IPC_FLUSH, process).with_params(port as u32, 0, 0)
}

// ============ I2C ============

/// Open an I2C master; `timing` 0 selects 100 kHz
pub const fn i2c_open(process: ProcessHandle, port: u8, timing: u32) -> IpcMessage {
    request(hal::I2C, ipc_item::IPC_OPEN, process).with_params(port as u32, 0, timing)
}

pub const fn i2c_close(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::I2C, ipc_item::IPC_CLOSE, process).with_params(port as u32, 0, 0)
}

/// Store slave address, flags and register address in `io`
pub fn i2c_prepare(io: &mut Io, sla: u8, flags: u8, addr: u8) {
    I2cStack::new(sla, flags, addr).store(io);
}

/// Read `size` bytes (the length limit for length-prefixed reads)
pub const fn i2c_read(process: ProcessHandle, port: u8, io: IoHandle, size: u32) -> IpcMessage {
    request(hal::I2C, ipc_item::IPC_READ, process).with_params(port as u32, io.raw(), size)
}

pub const fn i2c_write(process: ProcessHandle, port: u8, io: IoHandle) -> IpcMessage {
    request(hal::I2C, ipc_item::IPC_WRITE, process).with_params(port as u32, io.raw(), 0)
}

pub const fn i2c_flush(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::I2C, ipc_item::IPC_FLUSH, process).with_params(port as u32, 0, 0)
}

// ============ CAN ============

/// Open a CAN controller; `btr` 0 selects 500 kbit/s
pub const fn can_open(process: ProcessHandle, port: u8, btr: u32) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_OPEN, process).with_params(port as u32, 0, btr)
}

pub const fn can_close(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_CLOSE, process).with_params(port as u32, 0, 0)
}

/// Put a frame into `io`: identifier (with [`can::CAN_ID_EXT`] for 29 bits)
/// and up to 8 data bytes
pub fn can_prepare(io: &mut Io, id: u32, data: &[u8]) -> Result<()> {
    if data.len() > 8 {
        return Err(crate::Error::InvalidParams);
    }
    io.fill(data)?;
    can::set_frame_id(io, id);
    Ok(())
}

/// Queue the frame in `io`; completes with `IPC_CAN_TXC`
pub const fn can_write(process: ProcessHandle, port: u8, io: IoHandle) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_WRITE, process).with_params(port as u32, io.raw(), 0)
}

/// Receive one frame into `io`
pub const fn can_read(process: ProcessHandle, port: u8, io: IoHandle) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_READ, process).with_params(port as u32, io.raw(), 0)
}

pub const fn can_flush(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_FLUSH, process).with_params(port as u32, 0, 0)
}

/// Leave bus-off and rejoin the bus
pub const fn can_reset(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::CAN, ipc_item::IPC_CAN_RESET, process).with_params(port as u32, 0, 0)
}

// ============ USB ============

pub const fn usb_open(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_OPEN, process).with_params(port as u32, 0, 0)
}

pub const fn usb_close(process: ProcessHandle, port: u8) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_CLOSE, process).with_params(port as u32, 0, 0)
}

pub const fn usb_ep_open(process: ProcessHandle, port: u8, ep: EpAddr, max_packet: u32) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_USB_EP_OPEN, process).with_params(ep_param(port, ep), 0, max_packet)
}

pub const fn usb_ep_close(process: ProcessHandle, port: u8, ep: EpAddr) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_USB_EP_CLOSE, process).with_params(ep_param(port, ep), 0, 0)
}

/// Receive on an OUT endpoint; `size` 0 means one max-size packet
pub const fn usb_ep_read(process: ProcessHandle, port: u8, ep: EpAddr, io: IoHandle, size: u32) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_READ, process).with_params(ep_param(port, ep), io.raw(), size)
}

/// Send on an IN endpoint; `size` 0 means one max-size packet
pub const fn usb_ep_write(process: ProcessHandle, port: u8, ep: EpAddr, io: IoHandle, size: u32) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_WRITE, process).with_params(ep_param(port, ep), io.raw(), size)
}

pub const fn usb_ep_flush(process: ProcessHandle, port: u8, ep: EpAddr) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_FLUSH, process).with_params(ep_param(port, ep), 0, 0)
}

pub const fn usb_ep_set_stall(process: ProcessHandle, port: u8, ep: EpAddr) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_USB_EP_SET_STALL, process).with_params(ep_param(port, ep), 0, 0)
}

pub const fn usb_ep_clear_stall(process: ProcessHandle, port: u8, ep: EpAddr) -> IpcMessage {
    request(hal::USB, ipc_item::IPC_USB_EP_CLEAR_STALL, process).with_params(ep_param(port, ep), 0, 0)
}
