//! I/O descriptors and exactly-once completion
//!
//! Buffers that cross the process/interrupt boundary live in a fixed arena
//! and are referenced by [`IoHandle`], an index plus a generation counter.
//! A handle that outlived its slot fails validation instead of aliasing a
//! newer buffer.
//!
//! Slot lifecycle:
//!
//! ```text
//! Free --alloc--> Owned --start--> InFlight --complete--> Owned --free--> Free
//!                                      |                    ^
//!                                      +--> Undelivered ----+ (mailbox was full)
//! ```
//!
//! `complete` is only accepted from `InFlight`, which is what makes a second
//! completion of the same request impossible.

use crate::config::{IO_BUF_SIZE, IO_SLOTS, IO_STACK_WORDS};
use crate::error::{Error, Result};
use crate::ipc::{encode_result, IpcMessage, Mailbox};
use crate::types::{Cmd, ProcessHandle};

/// Reference to an I/O descriptor slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct IoHandle {
    index: u8,
    generation: u8,
}

impl IoHandle {
    /// Pack into one IPC message word
    #[inline]
    pub const fn raw(self) -> u32 {
        ((self.generation as u32) << 8) | self.index as u32
    }

    /// Unpack from an IPC message word
    #[inline]
    pub const fn from_raw(raw: u32) -> IoHandle {
        IoHandle {
            index: raw as u8,
            generation: (raw >> 8) as u8,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }
}

/// I/O buffer with driver parameters
pub struct Io {
    data: [u8; IO_BUF_SIZE],
    size: usize,
    stack: [u32; IO_STACK_WORDS],
}

impl Io {
    const fn new() -> Self {
        Io {
            data: [0; IO_BUF_SIZE],
            size: 0,
            stack: [0; IO_STACK_WORDS],
        }
    }

    /// Buffer capacity in bytes
    pub const CAPACITY: usize = IO_BUF_SIZE;

    /// Valid bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data[..self.size]
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whole backing buffer, regardless of `size`
    #[inline]
    pub fn buf_mut(&mut self) -> &mut [u8; IO_BUF_SIZE] {
        &mut self.data
    }

    /// Set the number of valid bytes
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        if size > IO_BUF_SIZE {
            return Err(Error::InvalidParams);
        }
        self.size = size;
        Ok(())
    }

    /// Replace the contents with `bytes`
    pub fn fill(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > IO_BUF_SIZE {
            return Err(Error::InvalidParams);
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.size = bytes.len();
        Ok(())
    }

    /// Append one byte, `false` when the buffer is full
    #[inline]
    pub fn push(&mut self, byte: u8) -> bool {
        if self.size >= IO_BUF_SIZE {
            return false;
        }
        self.data[self.size] = byte;
        self.size += 1;
        true
    }

    #[inline]
    pub fn byte(&self, offset: usize) -> u8 {
        self.data[offset]
    }

    #[inline]
    pub fn stack(&self) -> &[u32; IO_STACK_WORDS] {
        &self.stack
    }

    #[inline]
    pub fn stack_mut(&mut self) -> &mut [u32; IO_STACK_WORDS] {
        &mut self.stack
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    Owned,
    InFlight,
    Undelivered { msg: IpcMessage, seq: u32 },
}

struct Slot {
    generation: u8,
    owner: ProcessHandle,
    state: SlotState,
    io: Io,
}

impl Slot {
    const EMPTY: Slot = Slot {
        generation: 0,
        owner: ProcessHandle::KERNEL,
        state: SlotState::Free,
        io: Io::new(),
    };
}

/// IPC layer: mailbox plus I/O descriptor arena
///
/// Owned by the kernel context and lent to drivers for the duration of a
/// request or an interrupt.
pub struct IoContext {
    mailbox: Mailbox,
    slots: [Slot; IO_SLOTS],
    parked: usize,
    park_seq: u32,
}

impl IoContext {
    pub const fn new() -> Self {
        IoContext {
            mailbox: Mailbox::new(),
            slots: [Slot::EMPTY; IO_SLOTS],
            parked: 0,
            park_seq: 0,
        }
    }

    // ============ Descriptor arena ============

    /// Allocate a descriptor for `owner`
    pub fn io_alloc(&mut self, owner: ProcessHandle) -> Result<IoHandle> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.state == SlotState::Free)
            .ok_or(Error::OutOfMemory)?;
        slot.owner = owner;
        slot.state = SlotState::Owned;
        slot.io.size = 0;
        slot.io.stack = [0; IO_STACK_WORDS];
        Ok(IoHandle {
            index: index as u8,
            generation: slot.generation,
        })
    }

    /// Release a descriptor. Only its owner may free it, and only while no
    /// driver holds it.
    pub fn io_free(&mut self, handle: IoHandle, owner: ProcessHandle) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        if slot.owner != owner {
            return Err(Error::AccessDenied);
        }
        if slot.state != SlotState::Owned {
            return Err(Error::InvalidState);
        }
        slot.state = SlotState::Free;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(())
    }

    /// Borrow a live descriptor
    pub fn io(&self, handle: IoHandle) -> Result<&Io> {
        self.slot(handle).map(|s| &s.io)
    }

    /// Mutably borrow a descriptor its owner holds
    ///
    /// Fails with [`Error::InvalidState`] while a driver holds the descriptor
    /// or its completion is still parked.
    pub fn io_mut(&mut self, handle: IoHandle) -> Result<&mut Io> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            SlotState::Owned => Ok(&mut slot.io),
            _ => Err(Error::InvalidState),
        }
    }

    /// Mutably borrow an in-flight descriptor on behalf of the driver
    /// holding it
    pub(crate) fn io_held(&mut self, handle: IoHandle) -> Result<&mut Io> {
        let slot = self.slot_mut(handle)?;
        match slot.state {
            SlotState::InFlight => Ok(&mut slot.io),
            _ => Err(Error::InvalidState),
        }
    }

    /// Mutably borrow a descriptor `owner` may hand to a driver right now
    pub(crate) fn io_claimable(&mut self, handle: IoHandle, owner: ProcessHandle) -> Result<&mut Io> {
        let slot = self.slot_mut(handle)?;
        if slot.owner != owner {
            return Err(Error::AccessDenied);
        }
        match slot.state {
            SlotState::Owned => Ok(&mut slot.io),
            SlotState::InFlight => Err(Error::InProgress),
            _ => Err(Error::InvalidState),
        }
    }

    /// Process that owns the descriptor
    pub fn io_owner(&self, handle: IoHandle) -> Result<ProcessHandle> {
        self.slot(handle).map(|s| s.owner)
    }

    /// Whether a driver currently holds the descriptor
    pub fn io_in_flight(&self, handle: IoHandle) -> bool {
        matches!(self.slot(handle), Ok(s) if s.state == SlotState::InFlight)
    }

    /// Hand a descriptor to a driver for an asynchronous request
    pub fn io_start(&mut self, handle: IoHandle, owner: ProcessHandle) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        if slot.owner != owner {
            return Err(Error::AccessDenied);
        }
        match slot.state {
            SlotState::Owned => {
                slot.state = SlotState::InFlight;
                Ok(())
            }
            SlotState::InFlight => Err(Error::InProgress),
            _ => Err(Error::InvalidState),
        }
    }

    /// Complete an in-flight request and notify its owner, exactly once
    ///
    /// The completion carries `cmd`, the owner as destination, `param1`, the
    /// handle in `param2` and the size or error in `param3`. If the mailbox
    /// is full the message is parked in the slot and handed out later by
    /// [`receive`](Self::receive).
    pub fn io_complete(
        &mut self,
        handle: IoHandle,
        cmd: Cmd,
        param1: u32,
        result: Result<usize>,
    ) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        if slot.state != SlotState::InFlight {
            crate::error!("io: completion of idle descriptor {=u32}", handle.raw());
            return Err(Error::InvalidState);
        }
        let msg = IpcMessage::new(cmd, slot.owner).with_params(
            param1,
            handle.raw(),
            encode_result(result.map(|n| n as u32)),
        );
        slot.state = SlotState::Owned;

        let delivered = self.parked == 0 && self.mailbox.ipost(msg).is_ok();
        if !delivered {
            self.park(handle, msg);
        }
        Ok(())
    }

    // ============ Messages ============

    /// Post from process context
    pub fn post(&mut self, msg: IpcMessage) -> Result<()> {
        self.mailbox.post(msg).map_err(|_| Error::MailboxFull)
    }

    /// Post a notification from interrupt context
    ///
    /// Notifications are not tied to a descriptor; a full mailbox drops them
    /// and is counted in [`Mailbox::overruns`].
    pub fn ipost(&mut self, msg: IpcMessage) -> Result<()> {
        self.mailbox.ipost(msg).map_err(|_| Error::MailboxFull)
    }

    /// Take the next message for the scheduler
    pub fn receive(&mut self) -> Option<IpcMessage> {
        let msg = self.mailbox.receive();
        self.unpark();
        match msg {
            Some(msg) => Some(msg),
            // an empty ring can still have completions parked behind it
            None => self.mailbox.receive(),
        }
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Completions waiting for mailbox space
    pub fn parked(&self) -> usize {
        self.parked
    }

    // ============ Internals ============

    fn park(&mut self, handle: IoHandle, msg: IpcMessage) {
        let seq = self.park_seq;
        self.park_seq = self.park_seq.wrapping_add(1);
        self.slots[handle.index()].state = SlotState::Undelivered { msg, seq };
        self.parked += 1;
    }

    /// Move parked completions into the mailbox, oldest first
    fn unpark(&mut self) {
        while self.parked > 0 && !self.mailbox.is_full() {
            let oldest = self
                .slots
                .iter()
                .enumerate()
                .filter_map(|(i, s)| match s.state {
                    SlotState::Undelivered { msg, seq } => Some((i, msg, seq)),
                    _ => None,
                })
                .min_by_key(|&(_, _, seq)| seq.wrapping_sub(self.park_seq));
            let Some((index, msg, _)) = oldest else {
                self.parked = 0;
                return;
            };
            if self.mailbox.post(msg).is_err() {
                return;
            }
            self.slots[index].state = SlotState::Owned;
            self.parked -= 1;
        }
    }

    fn slot(&self, handle: IoHandle) -> Result<&Slot> {
        match self.slots.get(handle.index()) {
            Some(s) if s.generation == handle.generation && s.state != SlotState::Free => Ok(s),
            _ => Err(Error::InvalidParams),
        }
    }

    fn slot_mut(&mut self, handle: IoHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index()) {
            Some(s) if s.generation == handle.generation && s.state != SlotState::Free => Ok(s),
            _ => Err(Error::InvalidParams),
        }
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IPC_QUEUE_SIZE;
    use crate::types::{hal, ipc_item};

    const P: ProcessHandle = ProcessHandle(7);
    const WRITE: Cmd = Cmd::new(hal::UART, ipc_item::IPC_WRITE);

    #[test]
    fn test_alloc_until_exhausted() {
        let mut io = IoContext::new();
        for _ in 0..IO_SLOTS {
            io.io_alloc(P).unwrap();
        }
        assert_eq!(io.io_alloc(P), Err(Error::OutOfMemory));
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        io.io_free(h, P).unwrap();
        let h2 = io.io_alloc(P).unwrap();
        assert_eq!(h.index(), h2.index());
        assert!(io.io(h).is_err());
        assert!(io.io(h2).is_ok());
        assert_eq!(IoHandle::from_raw(h2.raw()), h2);
    }

    #[test]
    fn test_complete_exactly_once() {
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        assert_eq!(io.io_complete(h, WRITE, 0, Ok(1)), Err(Error::InvalidState));
        io.io_start(h, P).unwrap();
        assert_eq!(io.io_start(h, P), Err(Error::InProgress));
        io.io_complete(h, WRITE, 2, Ok(5)).unwrap();
        assert_eq!(io.io_complete(h, WRITE, 2, Ok(5)), Err(Error::InvalidState));

        let msg = io.receive().unwrap();
        assert_eq!(msg.process, P);
        assert_eq!(msg.param1, 2);
        assert_eq!(msg.param2, h.raw());
        assert_eq!(msg.result(), Ok(5));
        assert!(io.receive().is_none());
    }

    #[test]
    fn test_start_checks_owner() {
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        assert_eq!(io.io_start(h, ProcessHandle(8)), Err(Error::AccessDenied));
        assert_eq!(io.io_free(h, ProcessHandle(8)), Err(Error::AccessDenied));
    }

    #[test]
    fn test_held_descriptor_is_not_writable_by_owner() {
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        io.io_mut(h).unwrap().fill(&[1, 2, 3]).unwrap();
        io.io_start(h, P).unwrap();
        assert!(matches!(io.io_mut(h), Err(Error::InvalidState)));
        assert_eq!(io.io_held(h).unwrap().size(), 3);
        // read access stays available
        assert_eq!(io.io(h).unwrap().data(), &[1, 2, 3]);

        io.io_complete(h, WRITE, 0, Ok(3)).unwrap();
        assert!(matches!(io.io_held(h), Err(Error::InvalidState)));
        assert!(io.io_mut(h).is_ok());
    }

    #[test]
    fn test_claimable_checks_owner_and_state() {
        let mut io = IoContext::new();
        let h = io.io_alloc(P).unwrap();
        assert!(matches!(io.io_claimable(h, ProcessHandle(8)), Err(Error::AccessDenied)));
        assert!(io.io_claimable(h, P).is_ok());
        io.io_start(h, P).unwrap();
        assert!(matches!(io.io_claimable(h, P), Err(Error::InProgress)));
        assert!(matches!(
            io.io_claimable(IoHandle::from_raw(0xDEAD_0001), P),
            Err(Error::InvalidParams)
        ));
    }

    #[test]
    fn test_parked_completion_delivered_in_order() {
        let mut io = IoContext::new();
        let filler = IpcMessage::new(Cmd::new(hal::SYSTEM, 0), ProcessHandle::KERNEL);
        while io.ipost(filler).is_ok() {}

        let a = io.io_alloc(P).unwrap();
        let b = io.io_alloc(P).unwrap();
        io.io_start(a, P).unwrap();
        io.io_start(b, P).unwrap();
        io.io_complete(b, WRITE, 0, Ok(2)).unwrap();
        io.io_complete(a, WRITE, 0, Err(Error::IoCancelled)).unwrap();
        assert_eq!(io.parked(), 2);
        // parked descriptors stay unusable until delivered
        assert_eq!(io.io_free(a, P), Err(Error::InvalidState));

        let mut completions = std::vec::Vec::new();
        while let Some(msg) = io.receive() {
            if msg.cmd == WRITE {
                completions.push(msg);
            }
        }
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].param2, b.raw());
        assert_eq!(completions[1].param2, a.raw());
        assert_eq!(completions[1].result(), Err(Error::IoCancelled));
        assert_eq!(io.parked(), 0);
        assert!(io.mailbox().len() < IPC_QUEUE_SIZE);
        io.io_free(a, P).unwrap();
    }
}
