//! Hardware seams consumed by the buffer engine.
//!
//! The engine never touches BAR memory or page tables directly. It talks to two
//! collaborators:
//!
//! - [`RegisterInterface`]: 32-bit reads and writes of logical registers.
//! - [`DmaBackend`]: page allocation, bus mapping, pinning and cache
//!   synchronization for acquisition buffers.
//!
//! [`mmio::MmioRegisters`] drives a real BAR window; [`mock`] provides simulated
//! hardware for tests and the `dragon-sim` binary.

pub mod mmio;
pub mod mock;

use std::ptr::NonNull;

use dragon_regs::{order_bytes, Register};

use crate::error::DmaError;

/// Device register access.
///
/// Implementations must tolerate concurrent calls; the interrupt path only ever
/// reads through this trait.
pub trait RegisterInterface: Send + Sync {
    /// Writes `value` to `reg`. Registers absent from the board are ignored.
    fn write_register(&self, reg: Register, value: u32);

    /// Reads `reg`. Registers absent from the board read as zero.
    fn read_register(&self, reg: Register) -> u32;
}

/// Physically contiguous, page-aligned host memory handed out by a
/// [`DmaBackend`].
///
/// Dropping `HostPages` does not free the memory; it must be returned through
/// [`DmaBackend::free_pages`].
#[derive(Debug)]
pub struct HostPages {
    ptr: NonNull<u8>,
    order: u32,
}

// SAFETY: HostPages is an owning handle to a raw allocation. The engine never
// forms references into it while the device may be writing; access goes through
// the ownership protocol in `data::buffer_pool`.
unsafe impl Send for HostPages {}
unsafe impl Sync for HostPages {}

impl HostPages {
    /// Wraps an allocation of `order` pages starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must point to `order_bytes(order)` bytes that stay valid until the
    /// handle is passed back to the backend that produced it.
    pub unsafe fn from_raw(ptr: NonNull<u8>, order: u32) -> Self {
        Self { ptr, order }
    }

    /// CPU address of the first byte.
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Allocation order (log2 of the page count).
    #[must_use]
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Allocation size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        order_bytes(self.order)
    }

    /// Always false; an allocation holds at least one page.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

/// DMA memory primitives.
///
/// Mirrors the page allocator / streaming-mapping API of the host kernel:
/// buffers are allocated as page blocks, mapped for device-to-host transfers,
/// and pinned so they never move while mapped.
pub trait DmaBackend: Send + Sync {
    /// Allocates `2^order` contiguous pages reachable by a 32-bit DMA engine.
    fn alloc_pages(&self, order: u32) -> Result<HostPages, DmaError>;

    /// Returns pages obtained from [`DmaBackend::alloc_pages`].
    fn free_pages(&self, pages: HostPages);

    /// Maps `pages` for device writes and returns the bus address.
    fn map_single(&self, pages: &HostPages) -> Result<u64, DmaError>;

    /// Undoes [`DmaBackend::map_single`].
    fn unmap_single(&self, device_address: u64, len: usize);

    /// Marks the pages reserved so they are never swapped or migrated.
    fn pin(&self, pages: &HostPages);

    /// Undoes [`DmaBackend::pin`].
    fn unpin(&self, pages: &HostPages);

    /// Hands the mapping to the device: CPU caches are written back/invalidated.
    fn sync_for_device(&self, device_address: u64, len: usize);

    /// Hands the mapping back to the CPU after device writes.
    fn sync_for_cpu(&self, device_address: u64, len: usize);
}
