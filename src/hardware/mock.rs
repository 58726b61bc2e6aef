//! Mock Hardware Implementations
//!
//! Provides a simulated Dragon board for testing without physical hardware.
//!
//! # Available Mocks
//!
//! - `MockRegisters` - Register file with a write log and the submission FIFO
//! - `MockDma` - Page-aligned heap memory posing as DMA32 pages, with fault injection
//! - `MockBoard` - Both of the above plus FPGA-side completion behaviour
//!
//! # Completion Model
//!
//! The FPGA fills buffers in the order their bus addresses were written to
//! [`Register::SubmitAddress`]. `MockBoard::complete_next` pops that FIFO,
//! writes a small frame header into the buffer through the mock DMA mapping,
//! latches [`Register::LastAddress`] and raises the interrupt. Asserting
//! [`Register::Reset`] flushes the FIFO, and nothing completes while
//! [`Register::Enable`] is clear.

use std::alloc::{self, Layout};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use dragon_regs::{order_bytes, DeviceFamily, Register, RegisterMap, PAGE_SIZE};
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{DmaBackend, HostPages, RegisterInterface};
use crate::device::{DeviceOptions, DragonDevice, IrqHandle};
use crate::error::DmaError;

/// First bus address handed out by [`MockDma`].
pub const MOCK_BUS_BASE: u64 = 0x1000_0000;

/// Device id reported by a default [`MockRegisters`].
pub const MOCK_DEVICE_ID: u32 = 0xD4A6_0001;

// =============================================================================
// MockRegisters - Simulated Register File
// =============================================================================

/// Register file of a simulated board.
///
/// Every write is logged in order so tests can assert exact programming
/// sequences.
pub struct MockRegisters {
    map: RegisterMap,
    device_id: u32,
    values: Mutex<HashMap<Register, u32>>,
    writes: Mutex<Vec<(Register, u32)>>,
    submitted: SegQueue<u32>,
}

impl MockRegisters {
    /// Register file laid out for `family`.
    pub fn new(family: DeviceFamily) -> Self {
        Self::with_device_id(family, MOCK_DEVICE_ID)
    }

    /// Register file reporting a specific id word.
    pub fn with_device_id(family: DeviceFamily, device_id: u32) -> Self {
        Self {
            map: family.descriptor().registers,
            device_id,
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            submitted: SegQueue::new(),
        }
    }

    /// All writes since construction or the last [`MockRegisters::clear_writes`].
    pub fn writes(&self) -> Vec<(Register, u32)> {
        self.writes.lock().clone()
    }

    /// Writes to one register, oldest first.
    pub fn writes_to(&self, reg: Register) -> Vec<u32> {
        self.writes
            .lock()
            .iter()
            .filter(|(r, _)| *r == reg)
            .map(|(_, v)| *v)
            .collect()
    }

    /// Forgets the write log; register values stay.
    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Last value latched in `reg`, if it was ever written.
    pub fn value(&self, reg: Register) -> Option<u32> {
        self.values.lock().get(&reg).copied()
    }

    /// Hardware-side update, bypassing the write log.
    pub fn set(&self, reg: Register, value: u32) {
        self.values.lock().insert(reg, value);
    }

    /// DMA is enabled and the core is out of reset.
    pub fn is_running(&self) -> bool {
        self.value(Register::Enable) == Some(1) && self.value(Register::Reset) != Some(1)
    }

    /// Pops the oldest address from the submission FIFO.
    pub fn take_submitted(&self) -> Option<u32> {
        self.submitted.pop()
    }

    /// Addresses waiting in the submission FIFO.
    pub fn pending_submissions(&self) -> usize {
        self.submitted.len()
    }
}

impl RegisterInterface for MockRegisters {
    fn write_register(&self, reg: Register, value: u32) {
        if !self.map.has(reg) {
            trace!(?reg, value, "mock: register absent, write dropped");
            return;
        }
        self.writes.lock().push((reg, value));
        self.values.lock().insert(reg, value);

        match (reg, value) {
            (Register::SubmitAddress, addr) => self.submitted.push(addr),
            (Register::Reset, 1) => {
                let mut flushed = 0usize;
                while self.submitted.pop().is_some() {
                    flushed += 1;
                }
                if flushed > 0 {
                    debug!(flushed, "mock: reset flushed submission FIFO");
                }
            }
            _ => {}
        }
    }

    fn read_register(&self, reg: Register) -> u32 {
        if !self.map.has(reg) {
            return 0;
        }
        match reg {
            Register::DeviceId => self.device_id,
            _ => self.value(reg).unwrap_or(0),
        }
    }
}

// =============================================================================
// MockDma - Simulated DMA32 Allocator and Mapper
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct Mapping {
    host: usize,
    len: usize,
}

/// Heap-backed stand-in for the page allocator and streaming DMA API.
///
/// Allocations are page aligned and zeroed. Bus addresses are assigned
/// sequentially from [`MOCK_BUS_BASE`] and always fit in 32 bits.
pub struct MockDma {
    next_bus: AtomicU64,
    live_allocs: AtomicUsize,
    mappings: Mutex<HashMap<u64, Mapping>>,
    pinned: Mutex<HashSet<usize>>,
    alloc_budget: Mutex<Option<usize>>,
    map_budget: Mutex<Option<usize>>,
    device_syncs: Mutex<HashMap<u64, usize>>,
    cpu_syncs: Mutex<HashMap<u64, usize>>,
}

impl MockDma {
    /// Allocator with no fault injection.
    pub fn new() -> Self {
        Self {
            next_bus: AtomicU64::new(MOCK_BUS_BASE),
            live_allocs: AtomicUsize::new(0),
            mappings: Mutex::new(HashMap::new()),
            pinned: Mutex::new(HashSet::new()),
            alloc_budget: Mutex::new(None),
            map_budget: Mutex::new(None),
            device_syncs: Mutex::new(HashMap::new()),
            cpu_syncs: Mutex::new(HashMap::new()),
        }
    }

    /// Lets `n` more page allocations succeed, then fails every one after.
    pub fn fail_alloc_after(&self, n: usize) {
        *self.alloc_budget.lock() = Some(n);
    }

    /// Lets `n` more mappings succeed, then fails every one after.
    pub fn fail_map_after(&self, n: usize) {
        *self.map_budget.lock() = Some(n);
    }

    /// Removes any injected fault.
    pub fn heal(&self) {
        *self.alloc_budget.lock() = None;
        *self.map_budget.lock() = None;
    }

    /// Page allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        self.live_allocs.load(Ordering::Acquire)
    }

    /// Bus mappings not yet unmapped.
    pub fn live_mappings(&self) -> usize {
        self.mappings.lock().len()
    }

    /// Allocations currently pinned.
    pub fn pinned_count(&self) -> usize {
        self.pinned.lock().len()
    }

    /// Number of `sync_for_device` calls seen for `device_address`.
    pub fn device_syncs(&self, device_address: u64) -> usize {
        self.device_syncs
            .lock()
            .get(&device_address)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `sync_for_cpu` calls seen for `device_address`.
    pub fn cpu_syncs(&self, device_address: u64) -> usize {
        self.cpu_syncs
            .lock()
            .get(&device_address)
            .copied()
            .unwrap_or(0)
    }

    /// Simulates the board writing `data` at the start of a mapped buffer.
    ///
    /// Returns `false` when `device_address` is not a live mapping.
    pub fn device_write(&self, device_address: u64, data: &[u8]) -> bool {
        let Some(mapping) = self.mappings.lock().get(&device_address).copied() else {
            return false;
        };
        let n = data.len().min(mapping.len);
        // SAFETY: the mapping refers to a live allocation of `mapping.len`
        // bytes; it is removed in `unmap_single` before the pages are freed.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), mapping.host as *mut u8, n);
        }
        true
    }

    fn take_budget(budget: &Mutex<Option<usize>>) -> bool {
        let mut budget = budget.lock();
        match budget.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn layout(order: u32) -> Result<Layout, DmaError> {
        Layout::from_size_align(order_bytes(order), PAGE_SIZE).map_err(|_| DmaError::Alloc { order })
    }
}

impl Default for MockDma {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBackend for MockDma {
    fn alloc_pages(&self, order: u32) -> Result<HostPages, DmaError> {
        if !Self::take_budget(&self.alloc_budget) {
            return Err(DmaError::Alloc { order });
        }
        let layout = Self::layout(order)?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DmaError::Alloc { order })?;
        self.live_allocs.fetch_add(1, Ordering::AcqRel);
        // SAFETY: `ptr` is a fresh allocation of exactly `order_bytes(order)`
        // bytes, released only through `free_pages`.
        Ok(unsafe { HostPages::from_raw(ptr, order) })
    }

    fn free_pages(&self, pages: HostPages) {
        let Ok(layout) = Self::layout(pages.order()) else {
            return;
        };
        // SAFETY: `pages` came from `alloc_pages` with the same layout.
        unsafe { alloc::dealloc(pages.as_ptr(), layout) };
        self.live_allocs.fetch_sub(1, Ordering::AcqRel);
    }

    fn map_single(&self, pages: &HostPages) -> Result<u64, DmaError> {
        if !Self::take_budget(&self.map_budget) {
            return Err(DmaError::Map);
        }
        let len = pages.len();
        let bus = self.next_bus.fetch_add(len as u64, Ordering::AcqRel);
        self.mappings.lock().insert(
            bus,
            Mapping {
                host: pages.as_ptr() as usize,
                len,
            },
        );
        Ok(bus)
    }

    fn unmap_single(&self, device_address: u64, _len: usize) {
        self.mappings.lock().remove(&device_address);
    }

    fn pin(&self, pages: &HostPages) {
        self.pinned.lock().insert(pages.as_ptr() as usize);
    }

    fn unpin(&self, pages: &HostPages) {
        self.pinned.lock().remove(&(pages.as_ptr() as usize));
    }

    fn sync_for_device(&self, device_address: u64, _len: usize) {
        *self.device_syncs.lock().entry(device_address).or_insert(0) += 1;
    }

    fn sync_for_cpu(&self, device_address: u64, _len: usize) {
        *self.cpu_syncs.lock().entry(device_address).or_insert(0) += 1;
    }
}

// =============================================================================
// MockBoard - Simulated FPGA
// =============================================================================

/// Size of the header `MockBoard` writes into each completed buffer.
pub const FRAME_HEADER_LEN: usize = 8;

/// Simulated board: register file, DMA memory and completion engine.
pub struct MockBoard {
    family: DeviceFamily,
    regs: Arc<MockRegisters>,
    dma: Arc<MockDma>,
    sequence: AtomicU32,
}

impl MockBoard {
    /// Idle board of `family` with empty FIFOs.
    pub fn new(family: DeviceFamily) -> Self {
        Self {
            family,
            regs: Arc::new(MockRegisters::new(family)),
            dma: Arc::new(MockDma::new()),
            sequence: AtomicU32::new(0),
        }
    }

    /// Register file.
    pub fn regs(&self) -> &Arc<MockRegisters> {
        &self.regs
    }

    /// DMA allocator.
    pub fn dma(&self) -> &Arc<MockDma> {
        &self.dma
    }

    /// Builds an engine instance on top of this board.
    pub fn device(&self, mut options: DeviceOptions) -> DragonDevice {
        options.family = self.family;
        DragonDevice::new(self.regs.clone(), self.dma.clone(), options)
    }

    /// Fills the oldest submitted buffer and raises the interrupt.
    ///
    /// The buffer receives an 8-byte header: the little-endian sequence
    /// number followed by its own bus address. Returns the completed address,
    /// or `None` when DMA is stopped or nothing is queued.
    pub fn complete_next(&self, irq: &IrqHandle) -> Option<u32> {
        if !self.regs.is_running() {
            return None;
        }
        let addr = self.regs.take_submitted()?;
        let seq = self.sequence.fetch_add(1, Ordering::AcqRel);

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&seq.to_le_bytes());
        header[4..].copy_from_slice(&addr.to_le_bytes());
        self.dma.device_write(u64::from(addr), &header);

        self.regs.set(Register::LastAddress, addr);
        irq.complete_one();
        Some(addr)
    }

    /// Completes up to `count` buffers; returns how many completed.
    pub fn complete_many(&self, irq: &IrqHandle, count: usize) -> usize {
        (0..count)
            .take_while(|_| self.complete_next(irq).is_some())
            .count()
    }

    /// Completes `count` buffers from a background thread, one every `interval`.
    pub fn complete_later(
        self: &Arc<Self>,
        irq: IrqHandle,
        interval: Duration,
        count: usize,
    ) -> JoinHandle<usize> {
        let board = Arc::clone(self);
        thread::spawn(move || {
            let mut done = 0;
            for _ in 0..count {
                thread::sleep(interval);
                if board.complete_next(&irq).is_some() {
                    done += 1;
                }
            }
            done
        })
    }
}

/// Parses the header written by [`MockBoard::complete_next`].
pub fn parse_frame_header(data: &[u8]) -> Option<(u32, u32)> {
    let seq = u32::from_le_bytes(data.get(..4)?.try_into().ok()?);
    let addr = u32::from_le_bytes(data.get(4..8)?.try_into().ok()?);
    Some((seq, addr))
}
