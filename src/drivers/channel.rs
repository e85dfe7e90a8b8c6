//! In-flight transfer state shared by all drivers
//!
//! A [`Channel`] is the single rendezvous point between a driver's request
//! path (process context) and its interrupt handler: the request path arms
//! it, the handler advances it one hardware event at a time and finally
//! completes it. Completing always clears the transfer and returns the
//! channel to [`Phase::Idle`] before the completion is posted, so the owner
//! may start the next transfer as soon as it sees the message.

use crate::error::{Error, Result};
use crate::io::{IoContext, IoHandle};
use crate::ipc::IpcMessage;
use crate::types::{Cmd, ProcessHandle};

/// Transfer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(all(feature = "defmt", target_arch = "arm"), derive(defmt::Format))]
pub enum Phase {
    /// No transfer in flight
    Idle,
    /// Sending a target address (I2C register address)
    Addressing,
    /// Sending or receiving a length prefix
    Length,
    /// Moving payload
    Data,
}

/// One asynchronous request a driver is working on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub io: IoHandle,
    pub owner: ProcessHandle,
    /// Request command, echoed in the completion
    pub cmd: Cmd,
    /// Request `param1` (the port handle), echoed in the completion
    pub param1: u32,
    /// Units to move
    pub size: usize,
    /// Units moved so far
    pub done: usize,
}

impl Transfer {
    /// Transfer for a read/write request carrying `io` in `param2`
    pub fn from_request(msg: &IpcMessage, size: usize) -> Transfer {
        Transfer {
            io: IoHandle::from_raw(msg.param2),
            owner: msg.process,
            cmd: msg.cmd,
            param1: msg.param1,
            size,
            done: 0,
        }
    }
}

pub struct Channel {
    phase: Phase,
    transfer: Option<Transfer>,
}

impl Channel {
    pub const fn new() -> Self {
        Channel {
            phase: Phase::Idle,
            transfer: None,
        }
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[inline]
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.transfer.is_none()
    }

    #[inline]
    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    /// Claim the channel for `transfer`
    pub fn arm(&mut self, transfer: Transfer, first: Phase) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::InProgress);
        }
        self.transfer = Some(transfer);
        self.phase = first;
        Ok(())
    }

    /// Take the descriptor from its owner and claim the channel
    ///
    /// Nothing changes if either step fails.
    pub fn begin(&mut self, io: &mut IoContext, transfer: Transfer, first: Phase) -> Result<()> {
        if self.transfer.is_some() {
            return Err(Error::InProgress);
        }
        io.io_start(transfer.io, transfer.owner)?;
        self.arm(transfer, first)
    }

    /// Record `n` more units moved
    #[inline]
    pub fn advance(&mut self, n: usize) {
        if let Some(t) = self.transfer.as_mut() {
            t.done += n;
        }
    }

    /// Units still to move
    #[inline]
    pub fn remaining(&self) -> usize {
        self.transfer.map_or(0, |t| t.size.saturating_sub(t.done))
    }

    #[inline]
    pub fn done(&self) -> usize {
        self.transfer.map_or(0, |t| t.done)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.transfer.is_some_and(|t| t.done >= t.size)
    }

    /// Shrink the transfer to `size` units (a length prefix arrived)
    #[inline]
    pub fn resize(&mut self, size: usize) {
        if let Some(t) = self.transfer.as_mut() {
            t.size = size;
        }
    }

    /// End the transfer and post its completion
    ///
    /// Returns `false` if the channel was idle.
    pub fn complete(&mut self, io: &mut IoContext, result: Result<usize>) -> bool {
        let Some(t) = self.transfer.take() else {
            return false;
        };
        self.phase = Phase::Idle;
        if let Err(e) = io.io_complete(t.io, t.cmd, t.param1, result) {
            crate::error!("channel: completion lost: {}", e);
        }
        true
    }

    /// Complete successfully with the units moved so far
    pub fn finish(&mut self, io: &mut IoContext) -> bool {
        let done = self.done();
        self.complete(io, Ok(done))
    }

    /// Abort the transfer with [`Error::IoCancelled`]
    pub fn cancel(&mut self, io: &mut IoContext) -> bool {
        self.complete(io, Err(Error::IoCancelled))
    }
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}
