//! I2C master driver (STM32 I2C v2)
//!
//! Transfers are interrupt driven, one byte per TXIS/RXNE. A request may
//! carry a register-address byte ([`I2C_FLAG_ADDR`]) and a length prefix
//! ([`I2C_FLAG_LEN`]) around its payload; the channel phases follow the wire
//! order `Addressing -> Length -> Data`.
//!
//! Write: the first outgoing byte is preloaded into TXDR before START, so an
//! `n`-byte wire sequence takes `n - 1` TXIS entries and one TC entry.
//! Read with a register address: one-byte write, then RESTART in the read
//! direction on TC. A length-prefixed read receives the prefix with NBYTES
//! reload armed and reprograms NBYTES once the length is known.

use crate::critical::CriticalSection;
use crate::core::cs_cell::CsCell;
use crate::error::{Error, Result};
use crate::io::{Io, IoContext, IoHandle};
use crate::ipc::IpcMessage;
use crate::irq::{IrqHandler, IsrContext};
use crate::types::{hal, ipc_item, HalGroup, Irq};
use crate::config::I2C_MAX_NBYTES;

use super::{Channel, Driver, Ownership, Phase, Registers, Reply, Transfer};

/// Register offsets
pub mod reg {
    pub const CR1: usize = 0x00;
    pub const CR2: usize = 0x04;
    pub const TIMINGR: usize = 0x10;
    pub const ISR: usize = 0x18;
    pub const ICR: usize = 0x1C;
    pub const RXDR: usize = 0x24;
    pub const TXDR: usize = 0x28;

    /// Words spanned by the register block
    pub const WORDS: usize = 11;
}

pub mod cr1 {
    pub const PE: u32 = 1 << 0;
    pub const TXIE: u32 = 1 << 1;
    pub const RXIE: u32 = 1 << 2;
    pub const NACKIE: u32 = 1 << 4;
    pub const TCIE: u32 = 1 << 6;
    pub const ERRIE: u32 = 1 << 7;
}

pub mod cr2 {
    pub const RD_WRN: u32 = 1 << 10;
    pub const START: u32 = 1 << 13;
    pub const STOP: u32 = 1 << 14;
    pub const NBYTES_SHIFT: u32 = 16;
    pub const NBYTES_MASK: u32 = 0xFF << NBYTES_SHIFT;
    pub const RELOAD: u32 = 1 << 24;
}

pub mod isr {
    pub const TXIS: u32 = 1 << 1;
    pub const RXNE: u32 = 1 << 2;
    pub const NACKF: u32 = 1 << 4;
    pub const TC: u32 = 1 << 6;
    pub const TCR: u32 = 1 << 7;
    pub const BERR: u32 = 1 << 8;
    pub const ARLO: u32 = 1 << 9;
    pub const OVR: u32 = 1 << 10;

    pub const ERRORS: u32 = NACKF | BERR | ARLO | OVR;
}

/// Send a register-address byte before the payload
pub const I2C_FLAG_ADDR: u8 = 1 << 0;
/// Payload is preceded by a one-byte length
pub const I2C_FLAG_LEN: u8 = 1 << 1;

/// TIMINGR for 100 kHz from a 16 MHz kernel clock
pub const TIMING_100KHZ: u32 = 0x0030_3D5B;

/// Per-request addressing, carried in the first stack word of the io
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct I2cStack {
    /// 7-bit slave address
    pub sla: u8,
    pub flags: u8,
    /// Register address sent with [`I2C_FLAG_ADDR`]
    pub addr: u8,
}

impl I2cStack {
    pub const fn new(sla: u8, flags: u8, addr: u8) -> Self {
        I2cStack { sla, flags, addr }
    }

    pub const fn to_word(self) -> u32 {
        (self.sla as u32) | ((self.flags as u32) << 8) | ((self.addr as u32) << 16)
    }

    pub const fn from_word(word: u32) -> Self {
        I2cStack {
            sla: word as u8,
            flags: (word >> 8) as u8,
            addr: (word >> 16) as u8,
        }
    }

    pub fn store(self, io: &mut Io) {
        io.stack_mut()[0] = self.to_word();
    }

    pub fn load(io: &Io) -> Self {
        Self::from_word(io.stack()[0])
    }

    #[inline]
    fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Bytes sent ahead of the payload
    fn header_len(&self) -> usize {
        self.has(I2C_FLAG_ADDR) as usize + self.has(I2C_FLAG_LEN) as usize
    }
}

struct State {
    port: Ownership,
    channel: Channel,
    stack: I2cStack,
    read: bool,
    /// Wire bytes not yet covered by an NBYTES programming
    wire_left: usize,
}

pub struct I2c<R: Registers> {
    regs: R,
    port: u8,
    irq: Irq,
    state: CsCell<State>,
}

impl<R: Registers> I2c<R> {
    pub const fn new(regs: R, port: u8, irq: Irq) -> Self {
        I2c {
            regs,
            port,
            irq,
            state: CsCell::new(State {
                port: Ownership::new(),
                channel: Channel::new(),
                stack: I2cStack::new(0, 0, 0),
                read: false,
                wire_left: 0,
            }),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    /// Phase of the in-flight transfer
    pub fn phase(&self) -> Phase {
        self.state.with(|st| st.channel.phase())
    }

    // ============ Requests ============

    fn open(&self, st: &mut State, msg: &IpcMessage) -> Result<u32> {
        st.port.open(msg.process)?;
        let timing = if msg.param3 == 0 { TIMING_100KHZ } else { msg.param3 };
        self.regs.write(reg::CR1, 0);
        self.regs.write(reg::TIMINGR, timing);
        self.regs.write(reg::ICR, isr::ERRORS);
        self.regs
            .write(reg::CR1, cr1::PE | cr1::TXIE | cr1::RXIE | cr1::NACKIE | cr1::TCIE | cr1::ERRIE);
        crate::debug!("i2c{=u8}: open, timing {=u32:#x}", self.port, timing);
        Ok(0)
    }

    fn close(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        st.channel.cancel(io);
        self.regs.write(reg::CR1, 0);
        st.port.close();
        Ok(0)
    }

    fn flush(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        if st.channel.cancel(io) {
            self.soft_reset();
        }
        Ok(0)
    }

    fn write(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let buf = io.io(IoHandle::from_raw(msg.param2))?;
        let stack = I2cStack::load(buf);
        let size = buf.size();
        if stack.has(I2C_FLAG_LEN) && size > u8::MAX as usize {
            return Err(Error::InvalidParams);
        }
        let first = if stack.has(I2C_FLAG_ADDR) {
            Phase::Addressing
        } else if stack.has(I2C_FLAG_LEN) {
            Phase::Length
        } else {
            Phase::Data
        };
        st.channel.begin(io, Transfer::from_request(msg, size), first)?;
        st.stack = stack;
        st.read = false;
        st.wire_left = size + stack.header_len();

        if let Some(byte) = Self::next_tx_byte(st, io) {
            self.regs.write(reg::TXDR, byte as u32);
        }
        self.program(st, true, false);
        Ok(())
    }

    fn read(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let size = msg.param3 as usize;
        let h = IoHandle::from_raw(msg.param2);
        let stack = I2cStack::load(io.io(h)?);
        if size == 0 || size > Io::CAPACITY {
            return Err(Error::InvalidParams);
        }
        let first = if stack.has(I2C_FLAG_ADDR) {
            Phase::Addressing
        } else if stack.has(I2C_FLAG_LEN) {
            Phase::Length
        } else {
            Phase::Data
        };
        st.channel.begin(io, Transfer::from_request(msg, size), first)?;
        io.io_held(h)?.set_size(0)?;
        st.stack = stack;
        st.read = true;

        if first == Phase::Addressing {
            st.wire_left = 1;
            self.regs.write(reg::TXDR, stack.addr as u32);
            self.program(st, true, false);
        } else {
            self.start_receive(st);
        }
        Ok(())
    }

    // ============ Bus sequencing ============

    /// Program NBYTES for the next chunk of wire bytes
    fn program(&self, st: &mut State, start: bool, force_reload: bool) {
        let n = st.wire_left.min(I2C_MAX_NBYTES);
        st.wire_left -= n;
        let mut v = ((st.stack.sla as u32) << 1) | ((n as u32) << cr2::NBYTES_SHIFT);
        if st.wire_left > 0 || force_reload {
            v |= cr2::RELOAD;
        }
        if st.read {
            v |= cr2::RD_WRN;
        }
        if start {
            v |= cr2::START;
        }
        self.regs.write(reg::CR2, v);
    }

    /// (Re)START in the read direction
    fn start_receive(&self, st: &mut State) {
        if st.stack.has(I2C_FLAG_LEN) {
            st.channel.set_phase(Phase::Length);
            st.wire_left = 1;
            self.program(st, true, true);
        } else {
            st.channel.set_phase(Phase::Data);
            st.wire_left = st.channel.remaining();
            self.program(st, true, false);
        }
    }

    fn next_tx_byte(st: &mut State, io: &IoContext) -> Option<u8> {
        let t = *st.channel.transfer()?;
        match st.channel.phase() {
            Phase::Addressing => {
                let next = if st.stack.has(I2C_FLAG_LEN) { Phase::Length } else { Phase::Data };
                st.channel.set_phase(next);
                Some(st.stack.addr)
            }
            Phase::Length => {
                st.channel.set_phase(Phase::Data);
                Some(t.size as u8)
            }
            Phase::Data if st.channel.remaining() > 0 => {
                let byte = io.io(t.io).ok()?.byte(t.done);
                st.channel.advance(1);
                Some(byte)
            }
            _ => None,
        }
    }

    fn soft_reset(&self) {
        self.regs.clear_bits(reg::CR1, cr1::PE);
        self.regs.set_bits(reg::CR1, cr1::PE);
    }

    fn stop(&self) {
        self.regs.set_bits(reg::CR2, cr2::STOP);
    }

    // ============ Interrupt ============

    fn service(&self, st: &mut State, io: &mut IoContext) {
        let sr = self.regs.read(reg::ISR);

        if sr & isr::ERRORS != 0 {
            self.regs.write(reg::ICR, sr & isr::ERRORS);
            let err = if sr & isr::NACKF != 0 {
                Error::Nak
            } else if sr & isr::BERR != 0 {
                Error::Hardware
            } else if sr & isr::ARLO != 0 {
                Error::ArbitrationLost
            } else {
                Error::Overflow
            };
            self.soft_reset();
            if st.channel.complete(io, Err(err)) {
                crate::debug!("i2c{=u8}: transfer failed: {}", self.port, err);
            }
            return;
        }

        if st.channel.is_idle() {
            return;
        }

        if sr & isr::TCR != 0 {
            self.program(st, false, false);
            return;
        }

        if sr & isr::TC != 0 {
            if st.read && st.channel.phase() == Phase::Addressing {
                self.start_receive(st);
            } else {
                self.stop();
                st.channel.finish(io);
            }
            return;
        }

        if sr & isr::TXIS != 0 {
            if let Some(byte) = Self::next_tx_byte(st, io) {
                self.regs.write(reg::TXDR, byte as u32);
            }
        } else if sr & isr::RXNE != 0 {
            let byte = self.regs.read(reg::RXDR) as u8;
            self.receive_byte(st, io, byte);
        }
    }

    fn receive_byte(&self, st: &mut State, io: &mut IoContext, byte: u8) {
        let Some(t) = st.channel.transfer().copied() else {
            return;
        };
        match st.channel.phase() {
            Phase::Length => {
                let len = (byte as usize).min(t.size);
                st.channel.resize(len);
                st.channel.set_phase(Phase::Data);
                if len == 0 {
                    self.stop();
                    st.channel.finish(io);
                } else {
                    st.wire_left = len;
                }
            }
            Phase::Data => {
                let stored = io.io_held(t.io).map(|b| b.push(byte)).unwrap_or(false);
                if stored {
                    st.channel.advance(1);
                }
            }
            _ => {}
        }
    }
}

impl<R: Registers> IrqHandler for I2c<R> {
    fn handle(&self, cs: &CriticalSection, _irq: Irq, ctx: &mut IsrContext<'_>) {
        let st = self.state.get(cs);
        self.service(st, ctx.io);
    }
}

impl<R: Registers> Driver for I2c<R> {
    fn group(&self) -> HalGroup {
        hal::I2C
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::RamRegisters;
    use crate::types::{Cmd, ProcessHandle};

    const P: ProcessHandle = ProcessHandle(4);

    type Regs = RamRegisters<{ reg::WORDS }>;

    fn setup(regs: &Regs) -> (I2c<&Regs>, IoContext) {
        let i2c = I2c::new(regs, 0, Irq::new(7).unwrap());
        let mut io = IoContext::new();
        let cs = CriticalSection::enter();
        let open = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_OPEN), P);
        assert_eq!(i2c.request(&cs, &mut io, &open), Reply::Ready(Ok(0)));
        (i2c, io)
    }

    fn entry(i2c: &I2c<&Regs>, io: &mut IoContext, flags: u32) {
        i2c.registers().poke(reg::ISR, flags);
        let cs = CriticalSection::enter();
        i2c.service(i2c.state.get(&cs), io);
    }

    fn nbytes(regs: &Regs) -> u32 {
        (regs.peek(reg::CR2) & cr2::NBYTES_MASK) >> cr2::NBYTES_SHIFT
    }

    #[test]
    fn test_read_with_register_address_restarts() {
        let regs = Regs::new();
        let (i2c, mut io) = setup(&regs);
        let h = io.io_alloc(P).unwrap();
        I2cStack::new(0x50, I2C_FLAG_ADDR, 0x10).store(io.io_mut(h).unwrap());
        let read = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_READ), P).with_params(0, h.raw(), 2);
        {
            let cs = CriticalSection::enter();
            assert_eq!(i2c.request(&cs, &mut io, &read), Reply::Pending);
        }
        assert_eq!(regs.peek(reg::TXDR), 0x10);
        assert_eq!(regs.peek(reg::CR2) & cr2::RD_WRN, 0);
        assert_eq!(i2c.phase(), Phase::Addressing);

        entry(&i2c, &mut io, isr::TC);
        assert_ne!(regs.peek(reg::CR2) & cr2::RD_WRN, 0);
        assert_eq!(nbytes(&regs), 2);

        regs.poke(reg::RXDR, 0xAB);
        entry(&i2c, &mut io, isr::RXNE);
        regs.poke(reg::RXDR, 0xCD);
        entry(&i2c, &mut io, isr::RXNE);
        entry(&i2c, &mut io, isr::TC);

        let msg = io.receive().unwrap();
        assert_eq!(msg.result(), Ok(2));
        assert_eq!(io.io(h).unwrap().data(), &[0xAB, 0xCD]);
        assert_eq!(i2c.phase(), Phase::Idle);
    }

    #[test]
    fn test_length_prefixed_read_is_capped() {
        let regs = Regs::new();
        let (i2c, mut io) = setup(&regs);
        let h = io.io_alloc(P).unwrap();
        I2cStack::new(0x20, I2C_FLAG_LEN, 0).store(io.io_mut(h).unwrap());
        let read = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_READ), P).with_params(0, h.raw(), 1);
        {
            let cs = CriticalSection::enter();
            i2c.request(&cs, &mut io, &read);
        }
        assert_ne!(regs.peek(reg::CR2) & cr2::RELOAD, 0);

        regs.poke(reg::RXDR, 5);
        entry(&i2c, &mut io, isr::RXNE);
        entry(&i2c, &mut io, isr::TCR);
        assert_eq!(nbytes(&regs), 1);
        regs.poke(reg::RXDR, 0x77);
        entry(&i2c, &mut io, isr::RXNE);
        entry(&i2c, &mut io, isr::TC);
        assert_eq!(io.receive().unwrap().result(), Ok(1));
    }

    #[test]
    fn test_length_prefixed_write_sends_header_in_wire_order() {
        let regs = Regs::new();
        let (i2c, mut io) = setup(&regs);
        let h = io.io_alloc(P).unwrap();
        io.io_mut(h).unwrap().fill(&[0xC1, 0xC2, 0xC3]).unwrap();
        I2cStack::new(0x3C, I2C_FLAG_ADDR | I2C_FLAG_LEN, 0x40).store(io.io_mut(h).unwrap());
        let write = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_WRITE), P).with_params(0, h.raw(), 0);
        {
            let cs = CriticalSection::enter();
            assert_eq!(i2c.request(&cs, &mut io, &write), Reply::Pending);
        }
        // register address, length, then payload
        assert_eq!(nbytes(&regs), 5);
        let mut wire = vec![regs.peek(reg::TXDR) as u8];
        for _ in 0..4 {
            entry(&i2c, &mut io, isr::TXIS);
            wire.push(regs.peek(reg::TXDR) as u8);
        }
        assert_eq!(wire, [0x40, 3, 0xC1, 0xC2, 0xC3]);
        assert!(io.receive().is_none());
        entry(&i2c, &mut io, isr::TC);
        assert_eq!(io.receive().unwrap().result(), Ok(3));
    }

    #[test]
    fn test_empty_length_prefixed_read_is_rejected() {
        let regs = Regs::new();
        let (i2c, mut io) = setup(&regs);
        let h = io.io_alloc(P).unwrap();
        I2cStack::new(0x20, I2C_FLAG_LEN, 0).store(io.io_mut(h).unwrap());
        let read = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_READ), P).with_params(0, h.raw(), 0);
        let cs = CriticalSection::enter();
        assert_eq!(i2c.request(&cs, &mut io, &read), Reply::Ready(Err(Error::InvalidParams)));
        assert!(!io.io_in_flight(h));
        assert_eq!(i2c.phase(), Phase::Idle);
    }

    #[test]
    fn test_long_write_reloads_nbytes() {
        let regs = Regs::new();
        let (i2c, mut io) = setup(&regs);
        let h = io.io_alloc(P).unwrap();
        io.io_mut(h).unwrap().fill(&[0x5A; 300]).unwrap();
        I2cStack::new(0x33, 0, 0).store(io.io_mut(h).unwrap());
        let write = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_WRITE), P).with_params(0, h.raw(), 0);
        {
            let cs = CriticalSection::enter();
            i2c.request(&cs, &mut io, &write);
        }
        assert_eq!(nbytes(&regs), 255);
        assert_ne!(regs.peek(reg::CR2) & cr2::RELOAD, 0);
        for _ in 0..254 {
            entry(&i2c, &mut io, isr::TXIS);
        }
        entry(&i2c, &mut io, isr::TCR);
        assert_eq!(nbytes(&regs), 45);
        assert_eq!(regs.peek(reg::CR2) & cr2::RELOAD, 0);
        for _ in 0..45 {
            entry(&i2c, &mut io, isr::TXIS);
        }
        entry(&i2c, &mut io, isr::TC);
        assert_eq!(io.receive().unwrap().result(), Ok(300));
    }

    #[test]
    fn test_write_without_open_is_rejected() {
        let regs = Regs::new();
        let i2c = I2c::new(&regs, 0, Irq::new(7).unwrap());
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        let write = IpcMessage::new(Cmd::new(hal::I2C, ipc_item::IPC_WRITE), P).with_params(0, h.raw(), 0);
        let cs = CriticalSection::enter();
        assert_eq!(i2c.request(&cs, &mut io, &write), Reply::Ready(Err(Error::NotConfigured)));
    }
}
