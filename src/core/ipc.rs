//! IPC messages and the interrupt-to-process mailbox
//!
//! A message is the only way information crosses from interrupt context to
//! process context. The mailbox is a bounded single-producer/single-consumer
//! ring: interrupt handlers post into it, the scheduler drains it. Posting
//! never blocks; a full ring hands the message back so the caller can park it
//! instead of losing it.

use heapless::spsc::Queue;

use crate::config::IPC_QUEUE_SIZE;
use crate::error::{Error, Result};
use crate::types::{Cmd, ProcessHandle};

/// Fixed-shape IPC message
///
/// `param1..param3` are reused contextually as handles, sizes, addresses or
/// small values depending on `cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub struct IpcMessage {
    pub cmd: Cmd,
    pub process: ProcessHandle,
    pub param1: u32,
    pub param2: u32,
    pub param3: u32,
}

impl IpcMessage {
    pub const fn new(cmd: Cmd, process: ProcessHandle) -> Self {
        IpcMessage {
            cmd,
            process,
            param1: 0,
            param2: 0,
            param3: 0,
        }
    }

    pub const fn with_params(mut self, param1: u32, param2: u32, param3: u32) -> Self {
        self.param1 = param1;
        self.param2 = param2;
        self.param3 = param3;
        self
    }

    /// Store a result in `param3`: sizes as-is, errors as negative codes
    pub fn set_result(&mut self, result: Result<u32>) {
        self.param3 = encode_result(result);
    }

    /// Decode the result carried in `param3`
    pub fn result(&self) -> Result<u32> {
        decode_result(self.param3)
    }
}

/// Encode a completion result into one message word
pub fn encode_result(result: Result<u32>) -> u32 {
    match result {
        Ok(size) => size,
        Err(e) => (-(e.code() as i32)) as u32,
    }
}

/// Decode a completion word produced by [`encode_result`]
pub fn decode_result(word: u32) -> Result<u32> {
    let signed = word as i32;
    if signed >= 0 {
        Ok(word)
    } else {
        let code = signed.unsigned_abs();
        Err(u16::try_from(code)
            .ok()
            .and_then(Error::from_code)
            .unwrap_or(Error::InvalidState))
    }
}

/// Bounded ISR-to-process message ring
pub struct Mailbox {
    queue: Queue<IpcMessage, IPC_QUEUE_SIZE>,
    overruns: u32,
}

impl Mailbox {
    pub const fn new() -> Self {
        Mailbox {
            queue: Queue::new(),
            overruns: 0,
        }
    }

    /// Post from process context
    #[inline]
    pub fn post(&mut self, msg: IpcMessage) -> core::result::Result<(), IpcMessage> {
        self.queue.enqueue(msg)
    }

    /// Post from interrupt context. Never blocks.
    #[inline]
    pub fn ipost(&mut self, msg: IpcMessage) -> core::result::Result<(), IpcMessage> {
        self.queue.enqueue(msg).map_err(|msg| {
            self.overruns = self.overruns.wrapping_add(1);
            crate::warn!("ipc: mailbox full, cmd {=u32:#x}", msg.cmd.raw());
            msg
        })
    }

    /// Take the oldest message
    #[inline]
    pub fn receive(&mut self) -> Option<IpcMessage> {
        self.queue.dequeue()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    /// Number of interrupt-side posts that found the ring full
    #[inline]
    pub fn overruns(&self) -> u32 {
        self.overruns
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
