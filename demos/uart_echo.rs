//! UART echo, simulated on the host
//!
//! Runs the UART driver against an in-memory register file. The "hardware"
//! side pokes status flags and enters the kernel through `irq_entry`, the
//! process side talks to the driver with request messages only: a line
//! received up to the idle gap is written back.

use rexos::api;
use rexos::drivers::uart::{isr, reg, Uart};
use rexos::drivers::{RamRegisters, Reply};
use rexos::ipc::IpcMessage;
use rexos::port::NullLines;
use rexos::types::{ipc_item, Irq, ProcessHandle};
use rexos::{Kernel, Result};

const APP: ProcessHandle = ProcessHandle(1);
const PORT: u8 = 2;
const UART_PRIORITY: u8 = 6;

type Regs = RamRegisters<{ reg::WORDS }>;

/// Line driven into the receiver
const LINE: &[u8] = b"hello, rexos";

fn interrupt(k: &mut Kernel<'_, NullLines>, regs: &Regs, irq: Irq, flags: u32) {
    regs.poke(reg::ISR, flags);
    k.irq_entry(irq);
}

fn wait(k: &mut Kernel<'_, NullLines>, item: u16) -> Option<IpcMessage> {
    while let Some(msg) = k.receive() {
        if msg.cmd.item() == item {
            return Some(msg);
        }
        println!("uart_echo: skipped {:?}", msg);
    }
    None
}

fn main() -> Result<()> {
    let irq = Irq::new(17).ok_or(rexos::Error::InvalidParams)?;
    let regs = Regs::new();
    let uart = Uart::new(&regs, PORT, irq);
    let mut k = Kernel::new(NullLines::new());
    k.attach(&uart, UART_PRIORITY)?;

    k.serve(&api::uart_open(APP, PORT, 115_200))?;
    let opened = wait(&mut k, ipc_item::IPC_OPEN).map(|m| m.result());
    println!("uart_echo: open -> {:?}, line unmasked: {}", opened, k.irq.lines().is_unmasked(irq));

    let io = k.io.io_alloc(APP)?;
    let read = api::uart_read(APP, PORT, io, 64);
    if k.request(&read) != Reply::Pending {
        println!("uart_echo: read rejected");
        return Ok(());
    }

    for &byte in LINE {
        regs.poke(reg::RDR, byte as u32);
        interrupt(&mut k, &regs, irq, isr::RXNE);
    }
    interrupt(&mut k, &regs, irq, isr::IDLE);

    let Some(done) = wait(&mut k, ipc_item::IPC_READ) else {
        println!("uart_echo: no read completion");
        return Ok(());
    };
    let received = done.result()?;
    println!(
        "uart_echo: received {} bytes: {:?}",
        received,
        String::from_utf8_lossy(k.io.io(io)?.data())
    );

    let write = api::uart_write(APP, PORT, io);
    if k.request(&write) != Reply::Pending {
        println!("uart_echo: write rejected");
        return Ok(());
    }
    let mut echoed = Vec::new();
    while uart.tx_busy() && echoed.len() <= LINE.len() {
        interrupt(&mut k, &regs, irq, isr::TXE);
        echoed.push(regs.peek(reg::TDR) as u8);
        if echoed.len() == received as usize {
            interrupt(&mut k, &regs, irq, isr::TXE | isr::TC);
        }
    }
    let sent = wait(&mut k, ipc_item::IPC_WRITE).map(|m| m.result());
    println!(
        "uart_echo: write -> {:?}, wire: {:?}",
        sent,
        String::from_utf8_lossy(&echoed)
    );

    k.io.io_free(io, APP)?;
    k.serve(&api::uart_close(APP, PORT))?;
    println!("uart_echo: stats {:?}", uart.stats());
    Ok(())
}
