//! Core kernel modules
//!
//! Contains the interrupt dispatcher, the IPC layer, the I/O descriptor arena
//! and the kernel context that ties them together.

pub mod config;
pub mod critical;
pub mod error;
pub mod io;
pub mod ipc;
pub mod irq;
pub mod kernel;
pub mod types;
pub mod cs_cell;
