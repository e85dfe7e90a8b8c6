//! CAN driver (bxCAN)
//!
//! Transmission uses mailbox 0 only, fed from a software queue so frames
//! leave in request order. Every frame is completed exactly once with an
//! `IPC_CAN_TXC` message: sent, failed, cancelled by flush/close, or flushed
//! by bus-off.
//!
//! Bus-off stops the controller from transmitting. The driver aborts the
//! mailbox, fails everything queued with [`Error::BusOff`] and rejects new
//! writes until the owner sends `IPC_CAN_RESET`. Error-state changes are
//! reported to the owner with `IPC_CAN_BUS_STATE` (state in `param2`).
//!
//! Received frames complete an armed read; with no read armed they wait in
//! a small queue and the next read completes at once. A frame arriving on a
//! full queue pushes out the oldest one.

use heapless::Deque;

use crate::config::{CAN_RX_QUEUE_SIZE, CAN_TX_QUEUE_SIZE};
use crate::critical::CriticalSection;
use crate::core::cs_cell::CsCell;
use crate::error::{Error, Result};
use crate::io::{Io, IoContext, IoHandle};
use crate::ipc::IpcMessage;
use crate::irq::{IrqHandler, IsrContext};
use crate::types::{hal, ipc_item, Cmd, HalGroup, Irq, ProcessHandle};

use super::{Channel, Driver, Ownership, Phase, Registers, Reply, Transfer};

pub mod reg {
    pub const MCR: usize = 0x000;
    pub const MSR: usize = 0x004;
    pub const TSR: usize = 0x008;
    pub const RF0R: usize = 0x00C;
    pub const IER: usize = 0x014;
    pub const ESR: usize = 0x018;
    pub const BTR: usize = 0x01C;

    /// TX mailbox 0
    pub const TI0R: usize = 0x180;
    pub const TDT0R: usize = 0x184;
    pub const TDL0R: usize = 0x188;
    pub const TDH0R: usize = 0x18C;

    /// RX FIFO 0 output mailbox
    pub const RI0R: usize = 0x1B0;
    pub const RDT0R: usize = 0x1B4;
    pub const RDL0R: usize = 0x1B8;
    pub const RDH0R: usize = 0x1BC;

    pub const WORDS: usize = 0x1C0 / 4;
}

pub mod mcr {
    pub const INRQ: u32 = 1 << 0;
    pub const TXFP: u32 = 1 << 2;
}

pub mod msr {
    pub const INAK: u32 = 1 << 0;
    pub const ERRI: u32 = 1 << 2;
}

pub mod tsr {
    pub const RQCP0: u32 = 1 << 0;
    pub const TXOK0: u32 = 1 << 1;
    pub const ALST0: u32 = 1 << 2;
    pub const TERR0: u32 = 1 << 3;
    pub const ABRQ0: u32 = 1 << 7;
}

pub mod rf0r {
    pub const FMP0_MASK: u32 = 0b11;
    pub const FULL0: u32 = 1 << 3;
    pub const FOVR0: u32 = 1 << 4;
    pub const RFOM0: u32 = 1 << 5;
}

pub mod ier {
    pub const TMEIE: u32 = 1 << 0;
    pub const FMPIE0: u32 = 1 << 1;
    pub const EWGIE: u32 = 1 << 8;
    pub const EPVIE: u32 = 1 << 9;
    pub const BOFIE: u32 = 1 << 10;
    pub const ERRIE: u32 = 1 << 15;
}

pub mod esr {
    pub const EWGF: u32 = 1 << 0;
    pub const EPVF: u32 = 1 << 1;
    pub const BOFF: u32 = 1 << 2;
}

pub mod tir {
    pub const TXRQ: u32 = 1 << 0;
    pub const IDE: u32 = 1 << 2;
    pub const STID_SHIFT: u32 = 21;
    pub const EXID_SHIFT: u32 = 3;
}

/// Frame id flag: 29-bit extended identifier
pub const CAN_ID_EXT: u32 = 1 << 31;

/// BTR for 500 kbit/s from a 36 MHz APB clock
pub const BTR_500K: u32 = 0x001C_0003;

/// INAK polls before giving up on a mode change
const INIT_TIMEOUT: u32 = 20_000;

/// Controller error state, reported in `IPC_CAN_BUS_STATE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
#[repr(u8)]
pub enum BusState {
    Active = 0,
    Warning = 1,
    Passive = 2,
    BusOff = 3,
}

impl BusState {
    fn from_esr(esr: u32) -> BusState {
        if esr & esr::BOFF != 0 {
            BusState::BusOff
        } else if esr & esr::EPVF != 0 {
            BusState::Passive
        } else if esr & esr::EWGF != 0 {
            BusState::Warning
        } else {
            BusState::Active
        }
    }

    pub fn from_raw(raw: u32) -> Option<BusState> {
        match raw {
            0 => Some(BusState::Active),
            1 => Some(BusState::Warning),
            2 => Some(BusState::Passive),
            3 => Some(BusState::BusOff),
            _ => None,
        }
    }
}

/// Frame identifier of a CAN io (first stack word)
pub fn frame_id(io: &Io) -> u32 {
    io.stack()[0]
}

pub fn set_frame_id(io: &mut Io, id: u32) {
    io.stack_mut()[0] = id;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    id: u32,
    len: u8,
    data: [u8; 8],
}

struct State {
    port: Ownership,
    bus: BusState,
    /// Frame in mailbox 0
    tx: Channel,
    tx_queue: Deque<Transfer, CAN_TX_QUEUE_SIZE>,
    rx: Channel,
    rx_queue: Deque<Frame, CAN_RX_QUEUE_SIZE>,
    rx_dropped: u32,
}

pub struct Can<R: Registers> {
    regs: R,
    port: u8,
    irq: Irq,
    state: CsCell<State>,
}

impl<R: Registers> Can<R> {
    pub const fn new(regs: R, port: u8, irq: Irq) -> Self {
        Can {
            regs,
            port,
            irq,
            state: CsCell::new(State {
                port: Ownership::new(),
                bus: BusState::Active,
                tx: Channel::new(),
                tx_queue: Deque::new(),
                rx: Channel::new(),
                rx_queue: Deque::new(),
                rx_dropped: 0,
            }),
        }
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }

    pub fn bus_state(&self) -> BusState {
        self.state.with(|st| st.bus)
    }

    /// Frames waiting behind the mailbox
    pub fn tx_queued(&self) -> usize {
        self.state.with(|st| st.tx_queue.len())
    }

    /// Frames lost to RX queue overflow
    pub fn rx_dropped(&self) -> u32 {
        self.state.with(|st| st.rx_dropped)
    }

    // ============ Controller ============

    fn wait_for(&self, f: impl Fn() -> bool) -> bool {
        (0..INIT_TIMEOUT).any(|_| f())
    }

    /// Initialisation mode, bit timing, back to normal mode
    fn init(&self, btr: u32) {
        self.regs.write(reg::MCR, mcr::INRQ | mcr::TXFP);
        if !self.wait_for(|| self.regs.is_set(reg::MSR, msr::INAK)) {
            crate::warn!("can{=u8}: no init acknowledge", self.port);
        }
        self.regs.write(reg::BTR, btr);
        self.regs.write(reg::TSR, tsr::RQCP0);
        self.regs.write(reg::RF0R, rf0r::FULL0 | rf0r::FOVR0);
        self.regs.write(
            reg::IER,
            ier::TMEIE | ier::FMPIE0 | ier::EWGIE | ier::EPVIE | ier::BOFIE | ier::ERRIE,
        );
        self.regs.clear_bits(reg::MCR, mcr::INRQ);
        if !self.wait_for(|| !self.regs.is_set(reg::MSR, msr::INAK)) {
            crate::warn!("can{=u8}: still in init mode", self.port);
        }
    }

    fn load_mailbox(&self, t: &Transfer, io: &IoContext) {
        let Ok(buf) = io.io(t.io) else {
            return;
        };
        let len = buf.size().min(8);
        let mut data = [0u8; 8];
        data[..len].copy_from_slice(&buf.data()[..len]);
        let id = frame_id(buf);
        let ti = if id & CAN_ID_EXT != 0 {
            ((id & 0x1FFF_FFFF) << tir::EXID_SHIFT) | tir::IDE
        } else {
            (id & 0x7FF) << tir::STID_SHIFT
        };
        self.regs.write(reg::TDT0R, len as u32);
        self.regs.write(reg::TDL0R, u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
        self.regs.write(reg::TDH0R, u32::from_le_bytes([data[4], data[5], data[6], data[7]]));
        self.regs.write(reg::TI0R, ti | tir::TXRQ);
    }

    fn read_fifo(&self) -> Frame {
        let ri = self.regs.read(reg::RI0R);
        let id = if ri & tir::IDE != 0 {
            ((ri >> tir::EXID_SHIFT) & 0x1FFF_FFFF) | CAN_ID_EXT
        } else {
            ri >> tir::STID_SHIFT
        };
        let len = (self.regs.read(reg::RDT0R) & 0xF).min(8) as u8;
        let lo = self.regs.read(reg::RDL0R).to_le_bytes();
        let hi = self.regs.read(reg::RDH0R).to_le_bytes();
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&lo);
        data[4..].copy_from_slice(&hi);
        self.regs.write(reg::RF0R, rf0r::RFOM0);
        Frame { id, len, data }
    }

    // ============ Requests ============

    fn open(&self, st: &mut State, msg: &IpcMessage) -> Result<u32> {
        st.port.open(msg.process)?;
        let btr = if msg.param3 == 0 { BTR_500K } else { msg.param3 };
        self.init(btr);
        st.bus = BusState::Active;
        crate::debug!("can{=u8}: open, btr {=u32:#x}", self.port, btr);
        Ok(0)
    }

    fn close(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        self.flush(st, io, msg)?;
        self.regs.write(reg::IER, 0);
        self.regs.write(reg::MCR, mcr::INRQ);
        st.port.close();
        Ok(0)
    }

    /// Cancel the mailbox frame, queued frames and an armed read
    fn flush(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        if !st.tx.is_idle() {
            self.regs.write(reg::TSR, tsr::ABRQ0);
        }
        Self::fail_tx(st, io, Error::IoCancelled);
        st.rx.cancel(io);
        st.rx_queue.clear();
        Ok(0)
    }

    fn write(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        if st.bus == BusState::BusOff {
            return Err(Error::BusOff);
        }
        let size = io.io(IoHandle::from_raw(msg.param2))?.size();
        if size > 8 {
            return Err(Error::InvalidParams);
        }
        let mut t = Transfer::from_request(msg, size);
        t.cmd = Cmd::new(hal::CAN, ipc_item::IPC_CAN_TXC);

        if st.tx.is_idle() {
            st.tx.begin(io, t, Phase::Data)?;
            self.load_mailbox(&t, io);
            return Ok(());
        }
        if st.tx_queue.is_full() {
            return Err(Error::InProgress);
        }
        io.io_start(t.io, t.owner)?;
        if let Err(t) = st.tx_queue.push_back(t) {
            crate::error!("can{=u8}: tx queue overrun", self.port);
            io.io_complete(t.io, t.cmd, t.param1, Err(Error::InProgress))?;
        }
        Ok(())
    }

    fn read(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<Option<u32>> {
        st.port.check(msg.process)?;
        let h = IoHandle::from_raw(msg.param2);
        let buf = io.io_claimable(h, msg.process)?;
        if let Some(frame) = st.rx_queue.pop_front() {
            Self::store_frame(buf, &frame)?;
            return Ok(Some(frame.len as u32));
        }
        st.rx.begin(io, Transfer::from_request(msg, 8), Phase::Data)?;
        Ok(None)
    }

    fn reset(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        let btr = self.regs.read(reg::BTR);
        self.init(btr);
        let owner = msg.process;
        self.set_bus(st, io, owner, BusState::Active);
        crate::info!("can{=u8}: reset", self.port);
        Ok(0)
    }

    fn store_frame(buf: &mut Io, frame: &Frame) -> Result<()> {
        buf.fill(&frame.data[..frame.len as usize])?;
        set_frame_id(buf, frame.id);
        Ok(())
    }

    // ============ Interrupt ============

    fn service(&self, st: &mut State, io: &mut IoContext) {
        if self.regs.is_set(reg::MSR, msr::ERRI) {
            self.regs.write(reg::MSR, msr::ERRI);
        }
        let bus = BusState::from_esr(self.regs.read(reg::ESR));
        if bus != st.bus {
            if bus == BusState::BusOff {
                self.enter_bus_off(st, io);
            }
            if let Some(owner) = st.port.owner() {
                self.set_bus(st, io, owner, bus);
            } else {
                st.bus = bus;
            }
        }

        if st.bus != BusState::BusOff {
            let sr = self.regs.read(reg::TSR);
            if sr & tsr::RQCP0 != 0 {
                self.regs.write(reg::TSR, tsr::RQCP0);
                let result = if sr & tsr::TXOK0 != 0 {
                    Ok(st.tx.transfer().map_or(0, |t| t.size))
                } else if sr & tsr::ALST0 != 0 {
                    Err(Error::ArbitrationLost)
                } else if sr & tsr::TERR0 != 0 {
                    Err(Error::Hardware)
                } else {
                    Err(Error::IoCancelled)
                };
                st.tx.complete(io, result);
                self.load_next(st, io);
            }
        }

        let fifo = self.regs.read(reg::RF0R);
        if fifo & rf0r::FOVR0 != 0 {
            self.regs.write(reg::RF0R, rf0r::FOVR0);
            st.rx_dropped = st.rx_dropped.wrapping_add(1);
        }
        if fifo & rf0r::FMP0_MASK != 0 {
            let frame = self.read_fifo();
            self.receive(st, io, frame);
        }
    }

    fn load_next(&self, st: &mut State, io: &mut IoContext) {
        if let Some(next) = st.tx_queue.pop_front() {
            // descriptor already in flight, so only the channel is claimed
            if st.tx.arm(next, Phase::Data).is_ok() {
                self.load_mailbox(&next, io);
            }
        }
    }

    fn receive(&self, st: &mut State, io: &mut IoContext, frame: Frame) {
        match st.rx.transfer().copied() {
            Some(t) => {
                let stored = io.io_held(t.io).map_or(Err(Error::InvalidParams), |buf| {
                    Self::store_frame(buf, &frame)
                });
                st.rx.complete(io, stored.map(|_| frame.len as usize));
            }
            None => {
                if st.rx_queue.is_full() {
                    st.rx_queue.pop_front();
                    st.rx_dropped = st.rx_dropped.wrapping_add(1);
                }
                if st.rx_queue.push_back(frame).is_err() {
                    st.rx_dropped = st.rx_dropped.wrapping_add(1);
                }
            }
        }
    }

    fn enter_bus_off(&self, st: &mut State, io: &mut IoContext) {
        crate::warn!("can{=u8}: bus off, {=usize} frames dropped", self.port, st.tx_queue.len());
        self.regs.write(reg::TSR, tsr::ABRQ0);
        Self::fail_tx(st, io, Error::BusOff);
    }

    /// Complete the mailbox frame and every queued frame with `err`
    fn fail_tx(st: &mut State, io: &mut IoContext, err: Error) {
        st.tx.complete(io, Err(err));
        while let Some(t) = st.tx_queue.pop_front() {
            if io.io_complete(t.io, t.cmd, t.param1, Err(err)).is_err() {
                crate::error!("can: queued frame {=u32} not in flight", t.io.raw());
            }
        }
    }

    fn set_bus(&self, st: &mut State, io: &mut IoContext, owner: ProcessHandle, bus: BusState) {
        st.bus = bus;
        let note = IpcMessage::new(Cmd::new(hal::CAN, ipc_item::IPC_CAN_BUS_STATE), owner)
            .with_params(self.port as u32, bus as u32, 0);
        if io.ipost(note).is_err() {
            crate::warn!("can{=u8}: bus state {=u8} not reported, mailbox full", self.port, bus as u8);
        }
    }
}

impl<R: Registers> IrqHandler for Can<R> {
    fn handle(&self, cs: &CriticalSection, _irq: Irq, ctx: &mut IsrContext<'_>) {
        let st = self.state.get(cs);
        self.service(st, ctx.io);
    }
}

impl<R: Registers> Driver for Can<R> {
    fn group(&self) -> HalGroup {
        hal::CAN
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
            ipc_item::IPC_CAN_RESET => self.reset(st, io, msg).into(),
            ipc_item::IPC_WRITE => match self.write(st, io, msg) {
                Ok(()) => Reply::Pending,
                Err(e) => Reply::Ready(Err(e)),
            },
            ipc_item::IPC_READ => match self.read(st, io, msg) {
                Ok(Some(len)) => Reply::Ready(Ok(len)),
                Ok(None) => Reply::Pending,
                Err(e) => Reply::Ready(Err(e)),
            },
            _ => Reply::Ready(Err(Error::NotSupported)),
        }
    }
}
