//! Engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free event counters, updated from both calling and interrupt contexts.
#[derive(Debug, Default)]
pub struct EngineStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    consumed: AtomicU64,
    spurious_completions: AtomicU64,
    desyncs: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Buffers queued to the board.
    pub submitted: u64,
    /// Completion interrupts that retired a buffer.
    pub completed: u64,
    /// Buffers taken back by the CPU.
    pub consumed: u64,
    /// Interrupts that found the ready queue empty.
    pub spurious_completions: u64,
    /// Consumes whose address disagreed with the hardware last-address register.
    pub desyncs: u64,
    /// Buffers dropped from the ready queue by a timed-out drain or hard reset.
    pub discarded: u64,
}

impl EngineStats {
    /// One buffer queued.
    pub fn record_submit(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// One buffer retired by an interrupt.
    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// One buffer taken back.
    pub fn record_consume(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// An interrupt found nothing to complete.
    pub fn record_spurious(&self) {
        self.spurious_completions.fetch_add(1, Ordering::Relaxed);
    }

    /// A consume disagreed with the hardware.
    pub fn record_desync(&self) {
        self.desyncs.fetch_add(1, Ordering::Relaxed);
    }

    /// `n` ready buffers dropped.
    pub fn record_discarded(&self, n: usize) {
        self.discarded.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            spurious_completions: self.spurious_completions.load(Ordering::Relaxed),
            desyncs: self.desyncs.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
