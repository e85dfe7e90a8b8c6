//! UART driver (STM32 USART with ISR/ICR registers)
//!
//! Transmit and receive are independent channels, each with at most one
//! request in flight. Transmit moves one byte per TXE and completes on TC,
//! after the last stop bit left the shifter. Receive stores one byte per
//! RXNE and completes when the requested size arrived, or on line IDLE with
//! whatever was received so far.

use crate::critical::CriticalSection;
use crate::core::cs_cell::CsCell;
use crate::error::{Error, Result};
use crate::io::{Io, IoContext, IoHandle};
use crate::ipc::IpcMessage;
use crate::irq::{IrqHandler, IsrContext};
use crate::types::{hal, ipc_item, HalGroup, Irq};

use super::{Channel, Driver, Ownership, Phase, Registers, Reply, Transfer};

pub mod reg {
    pub const CR1: usize = 0x00;
    pub const CR3: usize = 0x08;
    pub const BRR: usize = 0x0C;
    pub const ISR: usize = 0x1C;
    pub const ICR: usize = 0x20;
    pub const RDR: usize = 0x24;
    pub const TDR: usize = 0x28;

    pub const WORDS: usize = 11;
}

pub mod cr1 {
    pub const UE: u32 = 1 << 0;
    pub const RE: u32 = 1 << 2;
    pub const TE: u32 = 1 << 3;
    pub const IDLEIE: u32 = 1 << 4;
    pub const RXNEIE: u32 = 1 << 5;
    pub const TCIE: u32 = 1 << 6;
    pub const TXEIE: u32 = 1 << 7;
    pub const PEIE: u32 = 1 << 8;
}

pub mod cr3 {
    pub const EIE: u32 = 1 << 0;
}

pub mod isr {
    pub const PE: u32 = 1 << 0;
    pub const FE: u32 = 1 << 1;
    pub const NF: u32 = 1 << 2;
    pub const ORE: u32 = 1 << 3;
    pub const IDLE: u32 = 1 << 4;
    pub const RXNE: u32 = 1 << 5;
    pub const TC: u32 = 1 << 6;
    pub const TXE: u32 = 1 << 7;

    pub const ERRORS: u32 = PE | FE | NF | ORE;
}

pub mod icr {
    pub const IDLECF: u32 = 1 << 4;
    pub const TCCF: u32 = 1 << 6;
}

/// Kernel clock assumed when an open request does not name one
pub const DEFAULT_CLOCK_HZ: u32 = 16_000_000;

/// Receive-side error counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UartStats {
    pub parity: u32,
    pub framing: u32,
    pub noise: u32,
    pub overrun: u32,
    /// Bytes received while no read was armed
    pub dropped: u32,
}

struct State {
    port: Ownership,
    tx: Channel,
    rx: Channel,
    stats: UartStats,
}

pub struct Uart<R: Registers> {
    regs: R,
    port: u8,
    irq: Irq,
    state: CsCell<State>,
}

impl<R: Registers> Uart<R> {
    pub const fn new(regs: R, port: u8, irq: Irq) -> Self {
        Uart {
            regs,
            port,
            irq,
            state: CsCell::new(State {
                port: Ownership::new(),
                tx: Channel::new(),
                rx: Channel::new(),
                stats: UartStats {
                    parity: 0,
                    framing: 0,
                    noise: 0,
                    overrun: 0,
                    dropped: 0,
                },
            }),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn stats(&self) -> UartStats {
        self.state.with(|st| st.stats)
    }

    /// Whether a read is waiting for data
    pub fn rx_busy(&self) -> bool {
        self.state.with(|st| !st.rx.is_idle())
    }

    pub fn tx_busy(&self) -> bool {
        self.state.with(|st| !st.tx.is_idle())
    }

    // ============ Requests ============

    fn open(&self, st: &mut State, msg: &IpcMessage) -> Result<u32> {
        let baud = msg.param3;
        if baud == 0 {
            return Err(Error::InvalidParams);
        }
        st.port.open(msg.process)?;
        let clock = if msg.param2 == 0 { DEFAULT_CLOCK_HZ } else { msg.param2 };
        self.regs.write(reg::CR1, 0);
        self.regs.write(reg::BRR, clock / baud);
        self.regs.write(reg::CR3, cr3::EIE);
        self.regs.write(reg::ICR, isr::ERRORS | icr::IDLECF | icr::TCCF);
        self.regs.write(reg::CR1, cr1::UE | cr1::RE | cr1::TE | cr1::PEIE);
        crate::debug!("uart{=u8}: open at {=u32} baud", self.port, baud);
        Ok(0)
    }

    fn close(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        st.tx.cancel(io);
        st.rx.cancel(io);
        self.regs.write(reg::CR1, 0);
        st.port.close();
        Ok(0)
    }

    /// Abort both directions
    fn flush(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        self.regs
            .clear_bits(reg::CR1, cr1::TXEIE | cr1::TCIE | cr1::RXNEIE | cr1::IDLEIE);
        st.tx.cancel(io);
        st.rx.cancel(io);
        Ok(0)
    }

    fn write(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let size = io.io(IoHandle::from_raw(msg.param2))?.size();
        if size == 0 {
            return Err(Error::InvalidParams);
        }
        st.tx.begin(io, Transfer::from_request(msg, size), Phase::Data)?;
        self.regs.set_bits(reg::CR1, cr1::TXEIE);
        Ok(())
    }

    fn read(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let size = msg.param3 as usize;
        if size == 0 || size > Io::CAPACITY {
            return Err(Error::InvalidParams);
        }
        let h = IoHandle::from_raw(msg.param2);
        st.rx.begin(io, Transfer::from_request(msg, size), Phase::Data)?;
        io.io_held(h)?.set_size(0)?;
        self.regs.write(reg::ICR, icr::IDLECF);
        self.regs.set_bits(reg::CR1, cr1::RXNEIE | cr1::IDLEIE);
        Ok(())
    }

    // ============ Interrupt ============

    fn service(&self, st: &mut State, io: &mut IoContext) {
        let sr = self.regs.read(reg::ISR);
        let cr = self.regs.read(reg::CR1);
        self.service_rx(st, io, sr);
        self.service_tx(st, io, sr, cr);
    }

    fn service_rx(&self, st: &mut State, io: &mut IoContext, sr: u32) {
        if sr & isr::ERRORS != 0 {
            self.regs.write(reg::ICR, sr & isr::ERRORS);
            // the byte that came with the error is discarded
            if sr & isr::RXNE != 0 {
                let _ = self.regs.read(reg::RDR);
            }
            let err = if sr & isr::PE != 0 {
                st.stats.parity = st.stats.parity.wrapping_add(1);
                Error::InvalidParity
            } else if sr & isr::FE != 0 {
                st.stats.framing = st.stats.framing.wrapping_add(1);
                Error::InvalidFrame
            } else if sr & isr::NF != 0 {
                st.stats.noise = st.stats.noise.wrapping_add(1);
                Error::LineNoise
            } else {
                st.stats.overrun = st.stats.overrun.wrapping_add(1);
                Error::Overflow
            };
            self.stop_rx(st, io, Err(err));
            return;
        }

        if sr & isr::RXNE != 0 {
            let byte = self.regs.read(reg::RDR) as u8;
            match st.rx.transfer().copied() {
                Some(t) => {
                    if io.io_held(t.io).map(|b| b.push(byte)).unwrap_or(false) {
                        st.rx.advance(1);
                    }
                    if st.rx.is_done() {
                        self.stop_rx(st, io, Ok(t.size));
                    }
                }
                None => st.stats.dropped = st.stats.dropped.wrapping_add(1),
            }
        }

        if sr & isr::IDLE != 0 {
            self.regs.write(reg::ICR, icr::IDLECF);
            let done = st.rx.done();
            if done > 0 {
                self.stop_rx(st, io, Ok(done));
            }
        }
    }

    fn stop_rx(&self, st: &mut State, io: &mut IoContext, result: Result<usize>) {
        if st.rx.is_idle() {
            return;
        }
        self.regs.clear_bits(reg::CR1, cr1::RXNEIE | cr1::IDLEIE);
        st.rx.complete(io, result);
    }

    fn service_tx(&self, st: &mut State, io: &mut IoContext, sr: u32, cr: u32) {
        if cr & cr1::TXEIE != 0 && sr & isr::TXE != 0 {
            let Some(t) = st.tx.transfer().copied() else {
                self.regs.clear_bits(reg::CR1, cr1::TXEIE);
                return;
            };
            if let Ok(buf) = io.io(t.io) {
                self.regs.write(reg::TDR, buf.byte(t.done) as u32);
                st.tx.advance(1);
            }
            if st.tx.is_done() {
                self.regs.clear_bits(reg::CR1, cr1::TXEIE);
                self.regs.write(reg::ICR, icr::TCCF);
                self.regs.set_bits(reg::CR1, cr1::TCIE);
            }
        } else if cr & cr1::TCIE != 0 && sr & isr::TC != 0 {
            self.regs.write(reg::ICR, icr::TCCF);
            self.regs.clear_bits(reg::CR1, cr1::TCIE);
            st.tx.finish(io);
        }
    }
}

impl<R: Registers> IrqHandler for Uart<R> {
    fn handle(&self, cs: &CriticalSection, _irq: Irq, ctx: &mut IsrContext<'_>) {
        let st = self.state.get(cs);
        self.service(st, ctx.io);
    }
}

impl<R: Registers> Driver for Uart<R> {
    fn group(&self) -> HalGroup {
        hal::UART
    }

    fn port(&self) -> u8 {
        self.port
    }

    fn irq(&self) -> Irq {
        self.irq
    }

    fn request(&self, cs: &CriticalSection, io: &mut IoContext, msg: &IpcMessage) -> Reply {
        let st = self.state.get(cs);
        match msg.cmd.item() {
            ipc_item::IPC_OPEN => self.open(st, msg).into(),
            ipc_item::IPC_CLOSE => self.close(st, io, msg).into(),
            ipc_item::IPC_FLUSH => self.flush(st, io, msg).into(),
            ipc_item::IPC_WRITE => match self.write(st, io, msg) {
                Ok(()) => Reply::Pending,
                Err(e) => Reply::Ready(Err(e)),
            },
            ipc_item::IPC_READ => match self.read(st, io, msg) {
                Ok(()) => Reply::Pending,
                Err(e) => Reply::Ready(Err(e)),
            },
            _ => Reply::Ready(Err(Error::NotSupported)),
        }
    }
}
