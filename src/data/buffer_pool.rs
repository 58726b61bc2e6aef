//! DMA-mapped acquisition buffers.
//!
//! # Ownership
//!
//! Each [`Buffer`] carries an atomic `cpu_owned` flag mirroring which side of
//! the streaming mapping currently owns its cache lines. The flag only changes
//! through [`Buffer::hand_to_device`] and [`Buffer::reclaim_for_cpu`], which
//! compare-and-swap it and issue the matching DMA sync exactly once per
//! transition, even when two callers race on the same buffer.
//!
//! # Lifetime
//!
//! Buffers are appended by [`BufferPool::ensure_capacity`] and destroyed only by
//! [`BufferPool::release_all`] (or drop). Indices are therefore stable: index
//! `i` names the same memory region from its allocation until the pool is
//! released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dragon_regs::page_order;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{AllocError, DmaError, DragonError, DragonResult};
use crate::hardware::{DmaBackend, HostPages};

/// Immutable geometry of one buffer, as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferDescriptor {
    /// Position in the pool.
    pub index: usize,
    /// Bus address the board writes to.
    pub device_address: u64,
    /// Usable bytes.
    pub length: usize,
    /// Offset to pass to a map request for this buffer.
    pub offset: u64,
}

/// One DMA-mapped, pinned region.
#[derive(Debug)]
pub struct Buffer {
    index: usize,
    pages: HostPages,
    device_address: u64,
    cpu_owned: AtomicBool,
}

impl Buffer {
    /// Position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Bus address handed to the board.
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    /// Allocation size in bytes.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the allocation is zero bytes.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Start of the host mapping.
    pub fn host_ptr(&self) -> *mut u8 {
        self.pages.as_ptr()
    }

    /// Whether the CPU may touch the contents.
    pub fn is_cpu_owned(&self) -> bool {
        self.cpu_owned.load(Ordering::Acquire)
    }

    /// Geometry reported to callers.
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            index: self.index,
            device_address: self.device_address,
            length: self.len(),
            offset: self.device_address,
        }
    }

    /// CPU → device. Returns whether this call performed the transition.
    pub fn hand_to_device(&self, dma: &dyn DmaBackend) -> bool {
        let flipped = self
            .cpu_owned
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            dma.sync_for_device(self.device_address, self.len());
        }
        flipped
    }

    /// Device → CPU. Returns whether this call performed the transition.
    pub fn reclaim_for_cpu(&self, dma: &dyn DmaBackend) -> bool {
        let flipped = self
            .cpu_owned
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if flipped {
            dma.sync_for_cpu(self.device_address, self.len());
        }
        flipped
    }
}

/// Fixed-ceiling, grow-only array of [`Buffer`]s. Sole owner of buffer memory.
pub struct BufferPool {
    dma: Arc<dyn DmaBackend>,
    buffers: Vec<Buffer>,
    max_count: usize,
    max_order: u32,
}

impl BufferPool {
    /// Empty pool allocating through `dma`, limited to `max_count` buffers of at
    /// most `max_order` pages each.
    pub fn new(dma: Arc<dyn DmaBackend>, max_count: usize, max_order: u32) -> Self {
        Self {
            dma,
            buffers: Vec::new(),
            max_count,
            max_order,
        }
    }

    /// Number of buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer at `index`.
    pub fn get(&self, index: usize) -> Option<&Buffer> {
        self.buffers.get(index)
    }

    /// Buffers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Buffer> {
        self.buffers.iter()
    }

    /// Descriptor for `index`, or [`DragonError::InvalidIndex`].
    pub fn query(&self, index: usize) -> DragonResult<BufferDescriptor> {
        self.get(index)
            .map(Buffer::descriptor)
            .ok_or(DragonError::InvalidIndex {
                index,
                capacity: self.len(),
            })
    }

    /// Buffer whose map offset is exactly `offset`.
    pub fn find_by_offset(&self, offset: u64) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.device_address == offset)
    }

    /// Grows the pool to at least `count` buffers of `buffer_bytes` each.
    ///
    /// Returns the resulting buffer count. A failure partway keeps every buffer
    /// allocated so far and reports that count in `OutOfMemory`.
    pub fn ensure_capacity(&mut self, count: usize, buffer_bytes: usize) -> Result<usize, AllocError> {
        if count > self.max_count {
            return Err(AllocError::TooMany {
                requested: count,
                max: self.max_count,
            });
        }
        let order = page_order(buffer_bytes);
        if order > self.max_order {
            return Err(AllocError::TooBig {
                bytes: buffer_bytes,
                order,
                max_order: self.max_order,
            });
        }
        if self.buffers.len() >= count {
            return Ok(self.buffers.len());
        }

        let start = self.buffers.len();
        self.buffers.reserve(count - start);
        while self.buffers.len() < count {
            match self.allocate_one(order) {
                Ok(buffer) => {
                    debug!(
                        index = buffer.index,
                        device_address = buffer.device_address,
                        "buffer allocated"
                    );
                    self.buffers.push(buffer);
                }
                Err(e) => {
                    warn!(
                        requested = count,
                        available = self.buffers.len(),
                        error = %e,
                        "buffer pool growth stopped early"
                    );
                    return Err(AllocError::OutOfMemory {
                        available: self.buffers.len(),
                    });
                }
            }
        }

        info!(
            added = count - start,
            total = count,
            order,
            "buffer pool grown"
        );
        Ok(count)
    }

    fn allocate_one(&self, order: u32) -> Result<Buffer, DmaError> {
        let pages = self.dma.alloc_pages(order)?;
        let device_address = match self.dma.map_single(&pages) {
            Ok(addr) if addr <= u64::from(u32::MAX) => addr,
            Ok(addr) => {
                error!(device_address = addr, "mapping outside 32-bit DMA window");
                self.dma.unmap_single(addr, pages.len());
                self.dma.free_pages(pages);
                return Err(DmaError::Map);
            }
            Err(e) => {
                error!(order, "DMA mapping failed");
                self.dma.free_pages(pages);
                return Err(e);
            }
        };
        self.dma.pin(&pages);

        Ok(Buffer {
            index: self.buffers.len(),
            pages,
            device_address,
            cpu_owned: AtomicBool::new(true),
        })
    }

    /// Unmaps, unpins and frees every buffer. Idempotent.
    pub fn release_all(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        let released = self.buffers.len();
        for buffer in self.buffers.drain(..) {
            let len = buffer.len();
            self.dma.unmap_single(buffer.device_address, len);
            self.dma.unpin(&buffer.pages);
            self.dma.free_pages(buffer.pages);
        }
        info!(released, "buffer pool released");
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.buffers.len())
            .field("max_count", &self.max_count)
            .field("max_order", &self.max_order)
            .finish()
    }
}
