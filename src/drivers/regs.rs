//! Peripheral register access
//!
//! Drivers address registers by byte offset from the peripheral base. On
//! hardware that is a volatile access through a fixed address ([`Mmio`]);
//! on a host it is an in-memory register file ([`RamRegisters`]) that a
//! simulation or a test drives by hand.

use core::cell::Cell;

/// 32-bit register file
pub trait Registers {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);

    /// Read-modify-write. Not atomic with respect to interrupts.
    #[inline]
    fn modify(&self, offset: usize, f: impl FnOnce(u32) -> u32) {
        let v = self.read(offset);
        self.write(offset, f(v));
    }

    #[inline]
    fn set_bits(&self, offset: usize, bits: u32) {
        self.modify(offset, |v| v | bits);
    }

    #[inline]
    fn clear_bits(&self, offset: usize, bits: u32) {
        self.modify(offset, |v| v & !bits);
    }

    #[inline]
    fn is_set(&self, offset: usize, bits: u32) -> bool {
        self.read(offset) & bits != 0
    }
}

/// Memory-mapped register block at a fixed base address
#[derive(Clone, Copy)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// # Safety
    /// `base` must be the address of a peripheral register block that no
    /// other code accesses concurrently.
    pub const unsafe fn new(base: usize) -> Self {
        Mmio { base }
    }
}

impl Registers for Mmio {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: guaranteed by the contract of `Mmio::new`.
        unsafe { core::ptr::read_volatile((self.base + offset) as *const u32) }
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        // SAFETY: guaranteed by the contract of `Mmio::new`.
        unsafe { core::ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }
}

/// Register file backed by plain memory
///
/// `WORDS` 32-bit registers at offsets `0, 4, 8, ...`. Writes are stored as
/// is (no write-1-to-clear emulation); the last value written to each offset
/// stays readable.
pub struct RamRegisters<const WORDS: usize> {
    regs: [Cell<u32>; WORDS],
    writes: Cell<u32>,
}

impl<const WORDS: usize> RamRegisters<WORDS> {
    pub const fn new() -> Self {
        RamRegisters {
            regs: [const { Cell::new(0) }; WORDS],
            writes: Cell::new(0),
        }
    }

    /// Force a register value, as the hardware would
    #[inline]
    pub fn poke(&self, offset: usize, value: u32) {
        self.regs[offset / 4].set(value);
    }

    /// Current register value
    #[inline]
    pub fn peek(&self, offset: usize) -> u32 {
        self.regs[offset / 4].get()
    }

    /// Number of driver writes so far
    pub fn write_count(&self) -> u32 {
        self.writes.get()
    }
}

impl<const WORDS: usize> Default for RamRegisters<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> Registers for RamRegisters<WORDS> {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        self.regs[offset / 4].get()
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        self.writes.set(self.writes.get().wrapping_add(1));
        self.regs[offset / 4].set(value);
    }
}

impl<R: Registers + ?Sized> Registers for &R {
    #[inline]
    fn read(&self, offset: usize) -> u32 {
        (**self).read(offset)
    }

    #[inline]
    fn write(&self, offset: usize, value: u32) {
        (**self).write(offset, value)
    }
}
