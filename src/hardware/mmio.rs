//! Register access through a mapped BAR0 window.

use std::ptr::NonNull;

use dragon_regs::{Register, RegisterMap};
use tracing::trace;

use super::RegisterInterface;

/// Volatile 32-bit register access over an already mapped BAR.
///
/// Logical registers are translated with the family [`RegisterMap`]; a register
/// the board does not implement is skipped on write and reads as zero.
#[derive(Debug)]
pub struct MmioRegisters {
    base: NonNull<u32>,
    map: RegisterMap,
}

// SAFETY: every access is a single aligned volatile load or store of a device
// register; the hardware serializes them.
unsafe impl Send for MmioRegisters {}
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Wraps a BAR mapping of `window_bytes` bytes.
    ///
    /// Returns `None` when the window is too small for `map`.
    ///
    /// # Safety
    ///
    /// `base` must be 4-byte aligned, valid for volatile reads and writes of
    /// `window_bytes` bytes, and stay mapped for the lifetime of the value.
    pub unsafe fn new(base: NonNull<u32>, window_bytes: usize, map: RegisterMap) -> Option<Self> {
        let needed = (map.max_offset() as usize + 1) * 4;
        (window_bytes >= needed).then_some(Self { base, map })
    }

    fn slot(&self, reg: Register) -> Option<*mut u32> {
        let dw = self.map.offset(reg)? as usize;
        // SAFETY: `new` checked that every mapped offset lies inside the window.
        Some(unsafe { self.base.as_ptr().add(dw) })
    }
}

impl RegisterInterface for MmioRegisters {
    fn write_register(&self, reg: Register, value: u32) {
        match self.slot(reg) {
            // SAFETY: see `slot`.
            Some(ptr) => unsafe { ptr.write_volatile(value) },
            None => trace!(?reg, value, "register not present on this board"),
        }
    }

    fn read_register(&self, reg: Register) -> u32 {
        match self.slot(reg) {
            // SAFETY: see `slot`.
            Some(ptr) => unsafe { ptr.read_volatile() },
            None => 0,
        }
    }
}
