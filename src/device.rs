//! The acquisition buffer engine for one board.
//!
//! [`DragonDevice`] composes the parameter store, buffer pool, ready/done ring,
//! activity state machine and readiness channel behind the operations a
//! character-device front end exposes (set activity, set/query parameters,
//! request/release/query buffers, submit, consume, wait, map).
//!
//! # Locking
//!
//! Calling contexts acquire locks in the order activity → params → pool → ring
//! and never the reverse. The interrupt path ([`IrqHandle::complete_one`])
//! takes the ring lock, releases it, then takes the activity lock; it never
//! holds both. Buffer ownership flags are atomics flipped outside the ring lock.
//!
//! # Example
//!
//! ```
//! use dragon_daq::device::DeviceOptions;
//! use dragon_daq::hardware::mock::MockBoard;
//! use dragon_regs::DeviceFamily;
//!
//! let board = MockBoard::new(DeviceFamily::Legacy);
//! let dev = board.device(DeviceOptions::default());
//! dev.open_session()?;
//! dev.request_buffers(2)?;
//! dev.activate()?;
//! dev.submit(0)?;
//! board.complete_next(&dev.irq_handle());
//! assert_eq!(dev.consume()?.index, 0);
//! # Ok::<(), dragon_daq::error::DragonError>(())
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dragon_regs::{DeviceFamily, FamilyDescriptor, Register, MAX_BUFFER_ORDER};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::activity::{Activity, ActivityState, DrainOutcome, DrainTicket};
use crate::data::{BufferDescriptor, BufferPool, QueueKind, Ring};
use crate::error::{Desync, DragonError, DragonResult, SubmitError};
use crate::hardware::{DmaBackend, RegisterInterface};
use crate::notify::WaitChannel;
use crate::params::{AcquisitionParams, ParamStore};
use crate::stats::{EngineStats, StatsSnapshot};

/// Per-device settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceOptions {
    /// Board generation.
    pub family: DeviceFamily,
    /// Time the reset line is held asserted during teardown.
    pub reset_pulse: Duration,
    /// Upper bound on a deactivation drain.
    pub drain_timeout: Option<Duration>,
    /// Largest page order per buffer, capped at [`MAX_BUFFER_ORDER`].
    pub max_buffer_order: u32,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            family: DeviceFamily::default(),
            reset_pulse: Duration::from_millis(100),
            drain_timeout: None,
            max_buffer_order: MAX_BUFFER_ORDER,
        }
    }
}

struct DeviceInner {
    desc: &'static FamilyDescriptor,
    options: DeviceOptions,
    regs: Arc<dyn RegisterInterface>,
    dma: Arc<dyn DmaBackend>,
    activity: Activity,
    params: Mutex<ParamStore>,
    pool: RwLock<BufferPool>,
    ring: Mutex<Ring>,
    readable: WaitChannel,
    stats: EngineStats,
}

/// Handle to one board's buffer engine. Cheap to clone.
#[derive(Clone)]
pub struct DragonDevice {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for DragonDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DragonDevice")
            .field("family", &self.inner.desc.family)
            .field("state", &self.inner.activity.state())
            .field("buffers", &self.inner.pool.read().len())
            .finish()
    }
}

impl DragonDevice {
    /// Engine for the board behind `regs`, allocating buffers through `dma`.
    pub fn new(
        regs: Arc<dyn RegisterInterface>,
        dma: Arc<dyn DmaBackend>,
        options: DeviceOptions,
    ) -> Self {
        let desc = options.family.descriptor();
        let max_order = options.max_buffer_order.min(MAX_BUFFER_ORDER);
        let pool = BufferPool::new(dma.clone(), desc.max_buffer_count, max_order);
        Self {
            inner: Arc::new(DeviceInner {
                desc,
                options,
                regs,
                dma,
                activity: Activity::new(),
                params: Mutex::new(ParamStore::new(desc)),
                pool: RwLock::new(pool),
                ring: Mutex::new(Ring::new()),
                readable: WaitChannel::new(),
                stats: EngineStats::default(),
            }),
        }
    }

    /// Board generation.
    pub fn family(&self) -> DeviceFamily {
        self.inner.desc.family
    }

    /// Geometry and limits of the board generation.
    pub fn descriptor(&self) -> &'static FamilyDescriptor {
        self.inner.desc
    }

    /// Settings this engine was built with.
    pub fn options(&self) -> DeviceOptions {
        self.inner.options
    }

    /// Current activity state.
    pub fn state(&self) -> ActivityState {
        self.inner.activity.state()
    }

    /// Buffers submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.activity.in_flight()
    }

    /// Counters since the engine was created.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Capability handed to the interrupt handler.
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Handle that cancels a blocked [`DragonDevice::deactivate`].
    pub fn drain_interrupter(&self) -> DrainInterrupter {
        DrainInterrupter {
            inner: Arc::clone(&self.inner),
        }
    }

    // =========================================================================
    // Session
    // =========================================================================

    /// Starts a session: restores factory parameters and programs all of them.
    pub fn open_session(&self) -> DragonResult<()> {
        let inner = &self.inner;
        inner.activity.with_inactive(|| {
            let mut params = inner.params.lock();
            params.reset_session();
            params.apply(inner.regs.as_ref());
            Ok(())
        })?;
        info!(family = %inner.desc.family, "session opened");
        Ok(())
    }

    /// Ends a session: hard reset, then release every buffer.
    pub fn close_session(&self) -> DragonResult<()> {
        self.force_reset();
        self.release_buffers()?;
        info!(family = %self.inner.desc.family, "session closed");
        Ok(())
    }

    // =========================================================================
    // Activity
    // =========================================================================

    /// [`DragonDevice::activate`] or [`DragonDevice::deactivate`].
    pub fn set_activity(&self, active: bool) -> DragonResult<()> {
        if active {
            self.activate()
        } else {
            self.deactivate()
        }
    }

    /// Releases reset, enables DMA and moves to `Active`.
    pub fn activate(&self) -> DragonResult<()> {
        let regs = self.inner.regs.as_ref();
        self.inner.activity.activate(|| {
            regs.write_register(Register::Reset, 0);
            regs.write_register(Register::Enable, 1);
        })?;
        info!("acquisition activated");
        Ok(())
    }

    /// Stops acquisition after every in-flight buffer has completed.
    ///
    /// New submissions are refused as soon as this is called. Blocks until the
    /// in-flight count reaches zero, the configured drain timeout expires (the
    /// remaining ready buffers are then discarded), or the drain is cancelled.
    ///
    /// A [`DrainInterrupter`] ends the wait with [`DragonError::Interrupted`]
    /// and leaves the device `Draining`; call this again to resume or
    /// [`DragonDevice::force_reset`] to abandon the buffers. A
    /// [`DragonDevice::force_reset`] from another thread also ends the wait
    /// with [`DragonError::Interrupted`]; the reset then owns teardown.
    ///
    /// Only one caller drains at a time; a second one gets
    /// [`DragonError::Busy`]. Idempotent when already inactive.
    pub fn deactivate(&self) -> DragonResult<()> {
        let inner = &self.inner;
        let Some(ticket) = inner.activity.begin_drain()? else {
            return Ok(());
        };
        info!(in_flight = inner.activity.in_flight(), "draining acquisition");

        match inner.activity.wait_drained(ticket, inner.options.drain_timeout)? {
            DrainOutcome::Drained => {}
            DrainOutcome::TimedOut { in_flight } => {
                warn!(in_flight, "drain timed out, discarding ready buffers");
            }
        }
        let ticket = inner.activity.claim_teardown(ticket)?;
        if self.teardown(ticket) {
            info!("acquisition deactivated");
        }
        Ok(())
    }

    /// Stops acquisition immediately, abandoning in-flight buffers.
    ///
    /// Works from any state; used after an interrupted drain and when a
    /// session closes. Any drain still waiting returns
    /// [`DragonError::Interrupted`] and does not touch the hardware.
    pub fn force_reset(&self) {
        let (previous, ticket) = self.inner.activity.force_draining();
        self.teardown(ticket);
        if previous != ActivityState::Inactive {
            warn!(%previous, "hard reset");
        }
    }

    /// Disable, reset pulse, discard the ready queue, go inactive.
    ///
    /// Runs while the state is `Draining`, so no other caller can submit or
    /// reconfigure during the pulse. Returns `false` when a hard reset took
    /// over before the state was committed.
    fn teardown(&self, ticket: DrainTicket) -> bool {
        let inner = &self.inner;
        let regs = inner.regs.as_ref();
        regs.write_register(Register::Enable, 0);
        regs.write_register(Register::Reset, 1);
        thread::sleep(inner.options.reset_pulse);
        regs.write_register(Register::Reset, 0);

        let discarded = {
            let pool = inner.pool.read();
            let stale = inner.ring.lock().drain(QueueKind::Ready);
            for &index in &stale {
                if let Some(buffer) = pool.get(index) {
                    buffer.reclaim_for_cpu(inner.dma.as_ref());
                }
            }
            stale.len()
        };
        if discarded > 0 {
            inner.stats.record_discarded(discarded);
            warn!(discarded, "ready buffers discarded");
        }
        inner.activity.finish(ticket).is_some()
    }

    // =========================================================================
    // Parameters
    // =========================================================================

    /// Validates, commits and programs new parameters. Returns the normalized
    /// value.
    pub fn set_params(&self, proposed: &AcquisitionParams) -> DragonResult<AcquisitionParams> {
        let inner = &self.inner;
        inner.activity.with_inactive(|| {
            let mut params = inner.params.lock();
            let normalized = params.set(proposed)?;
            params.apply(inner.regs.as_ref());
            Ok(normalized)
        })
    }

    /// Committed parameters.
    pub fn query_params(&self) -> AcquisitionParams {
        self.inner.params.lock().current()
    }

    /// Writes the DAC word directly, in any state.
    pub fn set_dac(&self, value: u32) {
        self.inner
            .params
            .lock()
            .write_dac(self.inner.regs.as_ref(), value);
        debug!(value, "DAC written");
    }

    /// Board identification word.
    pub fn device_id(&self) -> u32 {
        self.inner.regs.read_register(Register::DeviceId)
    }

    // =========================================================================
    // Buffer pool
    // =========================================================================

    /// Grows the pool to at least `count` buffers sized for the current
    /// parameters. Returns the buffer count.
    pub fn request_buffers(&self, count: usize) -> DragonResult<usize> {
        let inner = &self.inner;
        inner.activity.with_inactive(|| {
            let bytes = inner.params.lock().current().buffer_bytes();
            let mut pool = inner.pool.write();
            let result = pool.ensure_capacity(count, bytes);
            inner.ring.lock().grow_to(pool.len());
            Ok(result?)
        })
    }

    /// Frees every buffer and empties both queues. Idempotent.
    pub fn release_buffers(&self) -> DragonResult<()> {
        let inner = &self.inner;
        inner.activity.with_inactive(|| {
            let mut pool = inner.pool.write();
            inner.ring.lock().clear();
            pool.release_all();
            Ok(())
        })
    }

    /// Buffers in the pool.
    pub fn buffer_count(&self) -> usize {
        self.inner.pool.read().len()
    }

    /// Geometry of buffer `index`.
    pub fn query_buffer(&self, index: usize) -> DragonResult<BufferDescriptor> {
        self.inner.pool.read().query(index)
    }

    /// Whether the CPU currently owns buffer `index`.
    pub fn is_cpu_owned(&self, index: usize) -> Option<bool> {
        self.inner.pool.read().get(index).map(|b| b.is_cpu_owned())
    }

    /// Indices on one queue, head first.
    pub fn queued(&self, kind: QueueKind) -> Vec<usize> {
        self.inner.ring.lock().snapshot(kind)
    }

    // =========================================================================
    // Ring
    // =========================================================================

    /// Queues buffer `index` for the board to fill.
    pub fn submit(&self, index: usize) -> DragonResult<()> {
        let inner = &self.inner;
        let device_address = inner.activity.submit(|| {
            let required = inner.params.lock().current().buffer_bytes();
            let pool = inner.pool.read();
            let buffer = pool.get(index).ok_or(SubmitError::InvalidIndex {
                index,
                capacity: pool.len(),
            })?;
            if buffer.len() < required {
                return Err(SubmitError::UndersizedBuffer {
                    index,
                    length: buffer.len(),
                    required,
                }
                .into());
            }

            inner
                .ring
                .lock()
                .push_back(QueueKind::Ready, index)
                .map_err(|_| SubmitError::AlreadyQueued { index })?;
            buffer.hand_to_device(inner.dma.as_ref());

            // Pool addresses are DMA32 mappings.
            let device_address = buffer.device_address();
            inner
                .regs
                .write_register(Register::SubmitAddress, device_address as u32);
            Ok(device_address)
        })?;

        inner.stats.record_submit();
        debug!(index, device_address, "buffer submitted");
        Ok(())
    }

    /// Takes the oldest completed buffer back for the CPU.
    pub fn consume(&self) -> DragonResult<BufferDescriptor> {
        let inner = &self.inner;
        let pool = inner.pool.read();
        let (index, now_empty) = {
            let mut ring = inner.ring.lock();
            let index = ring.pop_front(QueueKind::Done).ok_or(DragonError::Empty)?;
            (index, ring.is_empty(QueueKind::Done))
        };
        let buffer = pool.get(index).ok_or(DragonError::InvalidIndex {
            index,
            capacity: pool.len(),
        })?;
        buffer.reclaim_for_cpu(inner.dma.as_ref());
        inner.stats.record_consume();

        // The last-address register tracks the newest completion, so it only
        // identifies this buffer once the done queue has been emptied.
        if now_empty {
            let reported = inner.regs.read_register(Register::LastAddress);
            if u64::from(reported) != buffer.device_address() & u64::from(u32::MAX) {
                let desync = Desync {
                    index,
                    expected: buffer.device_address(),
                    reported,
                };
                inner.stats.record_desync();
                warn!(%desync, "buffer ring out of step with hardware");
            }
        }

        debug!(index, "buffer consumed");
        Ok(buffer.descriptor())
    }

    fn done_ready(&self) -> bool {
        !self.inner.ring.lock().is_empty(QueueKind::Done)
    }

    /// Blocks until the done queue is non-empty or `timeout` expires.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> bool {
        self.inner
            .readable
            .wait_until(|| self.done_ready(), timeout)
    }

    /// Async form of [`DragonDevice::wait_readable`].
    pub async fn wait_readable_async(&self, timeout: Option<Duration>) -> bool {
        let wait = self.inner.readable.wait_until_async(|| self.done_ready());
        match timeout {
            None => {
                wait.await;
                true
            }
            Some(t) => tokio::time::timeout(t, wait).await.is_ok(),
        }
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// Maps exactly one buffer for reading.
    ///
    /// `offset` must be a buffer's map offset (see [`BufferDescriptor::offset`])
    /// and `length` must be non-zero and no larger than that buffer.
    pub fn map_buffer(&self, offset: u64, length: usize) -> DragonResult<BufferMapping> {
        let pool = self.inner.pool.read();
        let buffer = pool
            .find_by_offset(offset)
            .filter(|b| length > 0 && length <= b.len())
            .ok_or(DragonError::InvalidMapping { offset, length })?;
        Ok(BufferMapping {
            index: buffer.index(),
            ptr: buffer.host_ptr(),
            len: length,
        })
    }
}

/// Restricted capability for the interrupt handler.
#[derive(Clone)]
pub struct IrqHandle {
    inner: Arc<DeviceInner>,
}

impl IrqHandle {
    /// One hardware completion: moves the ready head to the done tail, wakes
    /// readers and retires one in-flight buffer.
    pub fn complete_one(&self) {
        let inner = &self.inner;
        let Some(index) = inner.ring.lock().promote() else {
            inner.stats.record_spurious();
            warn!("completion interrupt with empty ready queue");
            return;
        };
        inner.stats.record_completion();
        inner.readable.signal();
        inner.activity.complete();
        debug!(index, "buffer completed");
    }
}

impl std::fmt::Debug for IrqHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrqHandle").finish_non_exhaustive()
    }
}

/// Cancels a blocked drain, like a signal delivered to the waiting caller.
#[derive(Clone)]
pub struct DrainInterrupter {
    inner: Arc<DeviceInner>,
}

impl DrainInterrupter {
    /// Returns `false` when no drain is in progress.
    pub fn interrupt(&self) -> bool {
        self.inner.activity.interrupt()
    }
}

impl std::fmt::Debug for DrainInterrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainInterrupter").finish_non_exhaustive()
    }
}

/// Read view of one buffer's memory.
#[derive(Debug)]
pub struct BufferMapping {
    index: usize,
    ptr: *mut u8,
    len: usize,
}

impl BufferMapping {
    /// Pool index of the mapped buffer.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Mapped bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrows the mapped bytes.
    ///
    /// # Safety
    ///
    /// The buffer must be CPU-owned (consumed and not resubmitted) for the
    /// lifetime of the slice, and the pool must not be released meanwhile.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}
