//! USB device endpoint driver
//!
//! Moves bulk/interrupt endpoint data between I/O descriptors and the device
//! controller in max-packet-size chunks, one chunk per endpoint interrupt.
//! The controller itself sits behind [`UsbController`], so the same state
//! machine serves any device peripheral.
//!
//! A read or write of size `0` moves exactly one max-size packet. An IN
//! transfer whose last packet is full is terminated with a zero-length
//! packet; an OUT transfer ends on a short packet or when the requested size
//! arrived.
//!
//! Requests address an endpoint through `param1`: port in bits 0..8,
//! endpoint address (bit 7 set for IN) in bits 8..16.

use crate::config::{USB_EP_COUNT, USB_MAX_PACKET_SIZE};
use crate::critical::CriticalSection;
use crate::core::cs_cell::CsCell;
use crate::error::{Error, Result};
use crate::io::{Io, IoContext, IoHandle};
use crate::ipc::IpcMessage;
use crate::irq::{IrqHandler, IsrContext};
use crate::types::{hal, ipc_item, HalGroup, Irq};

use super::{Channel, Driver, Ownership, Phase, Reply, Transfer};

/// Endpoint address: number plus direction bit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct EpAddr(pub u8);

impl EpAddr {
    pub const IN: u8 = 0x80;

    pub const fn in_ep(num: u8) -> EpAddr {
        EpAddr(num | Self::IN)
    }

    pub const fn out_ep(num: u8) -> EpAddr {
        EpAddr(num & 0x7F)
    }

    #[inline]
    pub const fn num(self) -> u8 {
        self.0 & 0x7F
    }

    #[inline]
    pub const fn is_in(self) -> bool {
        self.0 & Self::IN != 0
    }
}

/// Pack port and endpoint into a request `param1`
pub const fn ep_param(port: u8, ep: EpAddr) -> u32 {
    port as u32 | ((ep.0 as u32) << 8)
}

/// Endpoint addressed by a request
pub const fn request_ep(msg: &IpcMessage) -> EpAddr {
    EpAddr((msg.param1 >> 8) as u8)
}

/// Controller event, reported once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEvent {
    /// IN packet taken by the host
    InComplete(u8),
    /// OUT packet received
    OutReceived(u8),
    /// Endpoint answered with STALL
    Stalled(EpAddr),
    /// Bus reset
    Reset,
}

/// Device controller endpoint access
pub trait UsbController {
    fn endpoint_enable(&self, ep: EpAddr, max_packet: usize);
    fn endpoint_disable(&self, ep: EpAddr);
    /// Queue one IN packet; empty for a zero-length packet
    fn endpoint_write(&self, num: u8, packet: &[u8]);
    /// Accept one OUT packet
    fn endpoint_arm_out(&self, num: u8);
    /// Copy the received OUT packet, returning its length
    fn endpoint_read(&self, num: u8, buf: &mut [u8]) -> usize;
    fn endpoint_set_stall(&self, ep: EpAddr, stall: bool);
    /// Take the next pending event
    fn take_event(&self) -> Option<UsbEvent>;
}

impl<C: UsbController + ?Sized> UsbController for &C {
    fn endpoint_enable(&self, ep: EpAddr, max_packet: usize) {
        (**self).endpoint_enable(ep, max_packet)
    }
    fn endpoint_disable(&self, ep: EpAddr) {
        (**self).endpoint_disable(ep)
    }
    fn endpoint_write(&self, num: u8, packet: &[u8]) {
        (**self).endpoint_write(num, packet)
    }
    fn endpoint_arm_out(&self, num: u8) {
        (**self).endpoint_arm_out(num)
    }
    fn endpoint_read(&self, num: u8, buf: &mut [u8]) -> usize {
        (**self).endpoint_read(num, buf)
    }
    fn endpoint_set_stall(&self, ep: EpAddr, stall: bool) {
        (**self).endpoint_set_stall(ep, stall)
    }
    fn take_event(&self) -> Option<UsbEvent> {
        (**self).take_event()
    }
}

struct Endpoint {
    /// Max packet size, 0 while closed
    mps: usize,
    channel: Channel,
    /// Size of the packet last handed to the controller
    last: usize,
}

impl Endpoint {
    const CLOSED: Endpoint = Endpoint {
        mps: 0,
        channel: Channel::new(),
        last: 0,
    };

    fn is_open(&self) -> bool {
        self.mps != 0
    }
}

struct State {
    port: Ownership,
    ep_in: [Endpoint; USB_EP_COUNT],
    ep_out: [Endpoint; USB_EP_COUNT],
}

impl State {
    fn endpoint(&mut self, ep: EpAddr) -> Result<&mut Endpoint> {
        let eps = if ep.is_in() { &mut self.ep_in } else { &mut self.ep_out };
        eps.get_mut(ep.num() as usize).ok_or(Error::InvalidParams)
    }

    fn open_endpoint(&mut self, ep: EpAddr) -> Result<&mut Endpoint> {
        let e = self.endpoint(ep)?;
        if !e.is_open() {
            return Err(Error::NotConfigured);
        }
        Ok(e)
    }
}

pub struct Usb<C: UsbController> {
    hw: C,
    port: u8,
    irq: Irq,
    state: CsCell<State>,
}

impl<C: UsbController> Usb<C> {
    pub const fn new(hw: C, port: u8, irq: Irq) -> Self {
        Usb {
            hw,
            port,
            irq,
            state: CsCell::new(State {
                port: Ownership::new(),
                ep_in: [Endpoint::CLOSED; USB_EP_COUNT],
                ep_out: [Endpoint::CLOSED; USB_EP_COUNT],
            }),
        }
    }

    pub fn controller(&self) -> &C {
        &self.hw
    }

    /// Whether `ep` has a transfer in flight
    pub fn ep_busy(&self, ep: EpAddr) -> bool {
        self.state
            .with(|st| st.endpoint(ep).map(|e| !e.channel.is_idle()).unwrap_or(false))
    }

    // ============ Requests ============

    fn open(&self, st: &mut State, msg: &IpcMessage) -> Result<u32> {
        st.port.open(msg.process)?;
        crate::debug!("usb{=u8}: open", self.port);
        Ok(0)
    }

    fn close(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        for num in 0..USB_EP_COUNT as u8 {
            for ep in [EpAddr::in_ep(num), EpAddr::out_ep(num)] {
                self.close_endpoint(st, io, ep)?;
            }
        }
        st.port.close();
        Ok(0)
    }

    fn ep_open(&self, st: &mut State, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        let ep = request_ep(msg);
        let mps = msg.param3 as usize;
        if mps == 0 || mps > USB_MAX_PACKET_SIZE {
            return Err(Error::InvalidParams);
        }
        let e = st.endpoint(ep)?;
        if e.is_open() {
            return Err(Error::AlreadyConfigured);
        }
        e.mps = mps;
        self.hw.endpoint_enable(ep, mps);
        Ok(0)
    }

    fn ep_close(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        let ep = request_ep(msg);
        st.open_endpoint(ep)?;
        self.close_endpoint(st, io, ep)?;
        Ok(0)
    }

    fn close_endpoint(&self, st: &mut State, io: &mut IoContext, ep: EpAddr) -> Result<()> {
        let e = st.endpoint(ep)?;
        if e.is_open() {
            e.channel.cancel(io);
            e.mps = 0;
            self.hw.endpoint_disable(ep);
        }
        Ok(())
    }

    fn set_stall(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage, stall: bool) -> Result<u32> {
        st.port.check(msg.process)?;
        let ep = request_ep(msg);
        let e = st.open_endpoint(ep)?;
        if stall {
            e.channel.cancel(io);
        }
        self.hw.endpoint_set_stall(ep, stall);
        Ok(0)
    }

    fn flush(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<u32> {
        st.port.check(msg.process)?;
        st.open_endpoint(request_ep(msg))?.channel.cancel(io);
        Ok(0)
    }

    /// Transfer size with the `0 = one max-size packet` convention applied
    fn transfer_size(requested: u32, mps: usize) -> Result<usize> {
        let size = if requested == 0 { mps } else { requested as usize };
        if size > Io::CAPACITY {
            return Err(Error::InvalidParams);
        }
        Ok(size)
    }

    fn write(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let ep = request_ep(msg);
        if !ep.is_in() {
            return Err(Error::InvalidParams);
        }
        let e = st.open_endpoint(ep)?;
        let size = Self::transfer_size(msg.param3, e.mps)?;
        if size > io.io(IoHandle::from_raw(msg.param2))?.size() {
            return Err(Error::InvalidParams);
        }
        e.channel.begin(io, Transfer::from_request(msg, size), Phase::Data)?;
        self.send_next(e, io, ep.num());
        Ok(())
    }

    fn read(&self, st: &mut State, io: &mut IoContext, msg: &IpcMessage) -> Result<()> {
        st.port.check(msg.process)?;
        let ep = request_ep(msg);
        if ep.is_in() {
            return Err(Error::InvalidParams);
        }
        let e = st.open_endpoint(ep)?;
        let size = Self::transfer_size(msg.param3, e.mps)?;
        let h = IoHandle::from_raw(msg.param2);
        io.io(h)?;
        e.channel.begin(io, Transfer::from_request(msg, size), Phase::Data)?;
        io.io_held(h)?.set_size(0)?;
        self.hw.endpoint_arm_out(ep.num());
        Ok(())
    }

    // ============ Packets ============

    /// Hand the next IN chunk to the controller
    fn send_next(&self, e: &mut Endpoint, io: &mut IoContext, num: u8) {
        let Some(t) = e.channel.transfer().copied() else {
            return;
        };
        let chunk = e.channel.remaining().min(e.mps);
        let packet = io.io(t.io).ok().and_then(|buf| buf.data().get(t.done..t.done + chunk));
        match packet {
            Some(packet) => self.hw.endpoint_write(num, packet),
            None => {
                crate::error!("usb: ep {=u8} buffer shorter than transfer", num);
                e.channel.complete(io, Err(Error::InvalidParams));
                return;
            }
        }
        e.channel.advance(chunk);
        e.last = chunk;
    }

    fn in_complete(&self, e: &mut Endpoint, io: &mut IoContext, num: u8) {
        if e.channel.is_idle() {
            return;
        }
        if e.channel.remaining() > 0 {
            self.send_next(e, io, num);
        } else if e.last == e.mps {
            // a full last packet would leave the host waiting for more
            self.hw.endpoint_write(num, &[]);
            e.last = 0;
        } else {
            e.channel.finish(io);
        }
    }

    fn out_received(&self, e: &mut Endpoint, io: &mut IoContext, num: u8) {
        let mut packet = [0u8; USB_MAX_PACKET_SIZE];
        let n = self.hw.endpoint_read(num, &mut packet).min(USB_MAX_PACKET_SIZE);
        let Some(t) = e.channel.transfer().copied() else {
            crate::debug!("usb: OUT packet on idle ep {=u8}", num);
            return;
        };
        let take = n.min(e.channel.remaining());
        if let Ok(buf) = io.io_held(t.io) {
            for &b in &packet[..take] {
                buf.push(b);
            }
        }
        e.channel.advance(take);
        if n < e.mps || e.channel.is_done() {
            if n > take {
                e.channel.complete(io, Err(Error::Overflow));
            } else {
                e.channel.finish(io);
            }
        } else {
            self.hw.endpoint_arm_out(num);
        }
    }

    // ============ Interrupt ============

    fn service(&self, st: &mut State, io: &mut IoContext) {
        while let Some(event) = self.hw.take_event() {
            match event {
                UsbEvent::InComplete(num) => {
                    if let Some(e) = st.ep_in.get_mut(num as usize) {
                        self.in_complete(e, io, num);
                    }
                }
                UsbEvent::OutReceived(num) => {
                    if let Some(e) = st.ep_out.get_mut(num as usize) {
                        self.out_received(e, io, num);
                    }
                }
                UsbEvent::Stalled(ep) => {
                    if let Ok(e) = st.endpoint(ep) {
                        e.channel.complete(io, Err(Error::Hardware));
                    }
                }
                UsbEvent::Reset => {
                    crate::info!("usb{=u8}: bus reset", self.port);
                    for e in st.ep_in.iter_mut().chain(st.ep_out.iter_mut()) {
                        e.channel.cancel(io);
                    }
                }
            }
        }
    }
}

impl<C: UsbController> IrqHandler for Usb<C> {
    fn handle(&self, cs: &CriticalSection, _irq: Irq, ctx: &mut IsrContext<'_>) {
        let st = self.state.get(cs);
        self.service(st, ctx.io);
    }
}

impl<C: UsbController> Driver for Usb<C> {
    fn group(&self) -> HalGroup {
        hal::USB
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
            ipc_item::IPC_USB_EP_OPEN => self.ep_open(st, msg).into(),
            ipc_item::IPC_USB_EP_CLOSE => self.ep_close(st, io, msg).into(),
            ipc_item::IPC_USB_EP_SET_STALL => self.set_stall(st, io, msg, true).into(),
            ipc_item::IPC_USB_EP_CLEAR_STALL => self.set_stall(st, io, msg, false).into(),
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

/// Scripted controller: records IN packets and OUT arming, replays queued
/// events and OUT packets
#[cfg(test)]
pub(crate) mod sim {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::vec::Vec;

    use super::{EpAddr, UsbController, UsbEvent};

    #[derive(Default)]
    pub struct SimController {
        pub sent: RefCell<Vec<(u8, Vec<u8>)>>,
        pub armed: RefCell<Vec<u8>>,
        pub stalled: RefCell<Vec<(EpAddr, bool)>>,
        pub enabled: RefCell<Vec<(EpAddr, usize)>>,
        events: RefCell<VecDeque<UsbEvent>>,
        packets: RefCell<VecDeque<Vec<u8>>>,
    }

    impl SimController {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_event(&self, event: UsbEvent) {
            self.events.borrow_mut().push_back(event);
        }

        /// Deliver an OUT packet on `num`
        pub fn receive(&self, num: u8, data: &[u8]) {
            self.packets.borrow_mut().push_back(data.to_vec());
            self.push_event(UsbEvent::OutReceived(num));
        }
    }

    impl UsbController for SimController {
        fn endpoint_enable(&self, ep: EpAddr, max_packet: usize) {
            self.enabled.borrow_mut().push((ep, max_packet));
        }
        fn endpoint_disable(&self, ep: EpAddr) {
            self.enabled.borrow_mut().retain(|(e, _)| *e != ep);
        }
        fn endpoint_write(&self, num: u8, packet: &[u8]) {
            self.sent.borrow_mut().push((num, packet.to_vec()));
        }
        fn endpoint_arm_out(&self, num: u8) {
            self.armed.borrow_mut().push(num);
        }
        fn endpoint_read(&self, _num: u8, buf: &mut [u8]) -> usize {
            let Some(packet) = self.packets.borrow_mut().pop_front() else {
                return 0;
            };
            let n = packet.len().min(buf.len());
            buf[..n].copy_from_slice(&packet[..n]);
            n
        }
        fn endpoint_set_stall(&self, ep: EpAddr, stall: bool) {
            self.stalled.borrow_mut().push((ep, stall));
        }
        fn take_event(&self) -> Option<UsbEvent> {
            self.events.borrow_mut().pop_front()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimController;
    use super::*;
    use crate::types::{Cmd, ProcessHandle};

    const P: ProcessHandle = ProcessHandle(9);

    fn call(usb: &Usb<&SimController>, io: &mut IoContext, item: u16, ep: EpAddr, p2: u32, p3: u32) -> Reply {
        let msg = IpcMessage::new(Cmd::new(hal::USB, item), P).with_params(ep_param(0, ep), p2, p3);
        let cs = CriticalSection::enter();
        usb.request(&cs, io, &msg)
    }

    fn irq(usb: &Usb<&SimController>, io: &mut IoContext) {
        let cs = CriticalSection::enter();
        usb.service(usb.state.get(&cs), io);
    }

    #[test]
    fn test_ep_open_validates() {
        let hw = SimController::new();
        let usb = Usb::new(&hw, 0, Irq::new(14).unwrap());
        let mut io = IoContext::new();
        let ep = EpAddr::in_ep(1);
        assert_eq!(
            call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 64),
            Reply::Ready(Err(Error::NotConfigured))
        );
        call(&usb, &mut io, ipc_item::IPC_OPEN, ep, 0, 0);
        assert_eq!(
            call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 65),
            Reply::Ready(Err(Error::InvalidParams))
        );
        assert_eq!(call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 64), Reply::Ready(Ok(0)));
        assert_eq!(
            call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 64),
            Reply::Ready(Err(Error::AlreadyConfigured))
        );
        assert_eq!(
            call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, EpAddr::out_ep(USB_EP_COUNT as u8), 0, 8),
            Reply::Ready(Err(Error::InvalidParams))
        );
        assert_eq!(hw.enabled.borrow().as_slice(), &[(ep, 64)]);
    }

    #[test]
    fn test_out_transfer_ends_on_short_packet() {
        let hw = SimController::new();
        let usb = Usb::new(&hw, 0, Irq::new(14).unwrap());
        let mut io = IoContext::new();
        let ep = EpAddr::out_ep(2);
        call(&usb, &mut io, ipc_item::IPC_OPEN, ep, 0, 0);
        call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 8);
        let h = io.io_alloc(P).unwrap();
        assert_eq!(call(&usb, &mut io, ipc_item::IPC_READ, ep, h.raw(), 32), Reply::Pending);

        hw.receive(2, &[1; 8]);
        irq(&usb, &mut io);
        assert!(usb.ep_busy(ep));
        hw.receive(2, &[2; 3]);
        irq(&usb, &mut io);

        assert_eq!(io.receive().unwrap().result(), Ok(11));
        assert_eq!(io.io(h).unwrap().size(), 11);
        assert_eq!(hw.armed.borrow().len(), 2);
    }

    #[test]
    fn test_in_flight_buffer_cannot_shrink() {
        let hw = SimController::new();
        let usb = Usb::new(&hw, 0, Irq::new(14).unwrap());
        let mut io = IoContext::new();
        let ep = EpAddr::in_ep(1);
        call(&usb, &mut io, ipc_item::IPC_OPEN, ep, 0, 0);
        call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 8);
        let h = io.io_alloc(P).unwrap();
        io.io_mut(h).unwrap().fill(&[7; 20]).unwrap();
        assert_eq!(call(&usb, &mut io, ipc_item::IPC_WRITE, ep, h.raw(), 20), Reply::Pending);

        assert!(matches!(io.io_mut(h), Err(Error::InvalidState)));
        for _ in 0..3 {
            hw.push_event(UsbEvent::InComplete(1));
            irq(&usb, &mut io);
        }

        let sizes: std::vec::Vec<usize> = hw.sent.borrow().iter().map(|(_, p)| p.len()).collect();
        assert_eq!(sizes, [8, 8, 4]);
        assert_eq!(io.receive().unwrap().result(), Ok(20));
    }

    #[test]
    fn test_stall_fails_transfer() {
        let hw = SimController::new();
        let usb = Usb::new(&hw, 0, Irq::new(14).unwrap());
        let mut io = IoContext::new();
        let ep = EpAddr::out_ep(1);
        call(&usb, &mut io, ipc_item::IPC_OPEN, ep, 0, 0);
        call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 16);
        let h = io.io_alloc(P).unwrap();
        call(&usb, &mut io, ipc_item::IPC_READ, ep, h.raw(), 0);
        hw.push_event(UsbEvent::Stalled(ep));
        irq(&usb, &mut io);
        assert_eq!(io.receive().unwrap().result(), Err(Error::Hardware));
        assert!(!usb.ep_busy(ep));
    }

    #[test]
    fn test_close_cancels_endpoints() {
        let hw = SimController::new();
        let usb = Usb::new(&hw, 0, Irq::new(14).unwrap());
        let mut io = IoContext::new();
        let ep = EpAddr::out_ep(3);
        call(&usb, &mut io, ipc_item::IPC_OPEN, ep, 0, 0);
        call(&usb, &mut io, ipc_item::IPC_USB_EP_OPEN, ep, 0, 16);
        let h = io.io_alloc(P).unwrap();
        call(&usb, &mut io, ipc_item::IPC_READ, ep, h.raw(), 16);
        assert_eq!(call(&usb, &mut io, ipc_item::IPC_CLOSE, ep, 0, 0), Reply::Ready(Ok(0)));
        assert_eq!(io.receive().unwrap().result(), Err(Error::IoCancelled));
        assert!(hw.enabled.borrow().is_empty());
    }
}
