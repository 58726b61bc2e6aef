//! Acquisition activity state machine.
//!
//! ```text
//!            activate              deactivate / force_reset
//! Inactive ───────────▶ Active ─────────────────────────────▶ Draining
//!    ▲                                                            │
//!    └──────────── in-flight == 0 (or timeout), hardware reset ◀──┘
//! ```
//!
//! State, the in-flight counter and the interrupt flag live under one mutex
//! paired with a condition variable. Drain waits re-check their predicate on
//! every wake, so spurious wakeups and racing completions are harmless.
//!
//! Exactly one caller owns a drain at a time, identified by a [`DrainTicket`].
//! A hard reset takes ownership from whoever holds it, and only the current
//! owner may move the state back to `Inactive`.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{DragonError, DragonResult, SubmitError};

/// Current acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityState {
    /// Stopped; parameters and buffers may change.
    #[default]
    Inactive,
    /// DMA enabled; buffers may be submitted.
    Active,
    /// Stopping; waiting for in-flight buffers or tearing down.
    Draining,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActivityState::Inactive => "inactive",
            ActivityState::Active => "active",
            ActivityState::Draining => "draining",
        })
    }
}

/// How a drain wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every submitted buffer completed.
    Drained,
    /// The timeout expired with buffers still owned by the device.
    TimedOut {
        /// Buffers the device still owned.
        in_flight: usize,
    },
}

/// Proof that the holder owns the current drain.
///
/// Issued when a drain starts or a hard reset begins. A later hard reset
/// supersedes every outstanding ticket, so only the newest holder may finish
/// teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct DrainTicket(u64);

#[derive(Debug, Default)]
struct Inner {
    state: ActivityState,
    in_flight: usize,
    interrupted: bool,
    /// Bumped whenever drain ownership changes hands through a reset or a
    /// teardown claim.
    epoch: u64,
    /// A caller holds the drain: waiting on it or tearing down.
    owned: bool,
}

impl Inner {
    fn issue(&mut self) -> DrainTicket {
        self.epoch += 1;
        self.owned = true;
        DrainTicket(self.epoch)
    }

    fn interrupted_error(&self) -> DragonError {
        DragonError::Interrupted {
            in_flight: self.in_flight,
        }
    }
}

/// Activity lock, in-flight counter and drain condition.
#[derive(Debug, Default)]
pub struct Activity {
    inner: Mutex<Inner>,
    drained: Condvar,
}

impl Activity {
    /// Inactive, nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    pub fn state(&self) -> ActivityState {
        self.inner.lock().state
    }

    /// Buffers submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Runs `enable` under the activity lock and moves to `Active`.
    pub fn activate(&self, enable: impl FnOnce()) -> DragonResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ActivityState::Inactive => {}
            ActivityState::Active => return Err(DragonError::AlreadyActive),
            state @ ActivityState::Draining => return Err(DragonError::Busy { state }),
        }
        enable();
        inner.state = ActivityState::Active;
        inner.interrupted = false;
        Ok(())
    }

    /// Runs `f` with the activity lock held, provided the state is `Inactive`.
    pub fn with_inactive<T>(&self, f: impl FnOnce() -> DragonResult<T>) -> DragonResult<T> {
        let inner = self.inner.lock();
        if inner.state != ActivityState::Inactive {
            return Err(DragonError::Busy { state: inner.state });
        }
        let out = f();
        drop(inner);
        out
    }

    /// Runs `f` with the activity lock held, provided the state is `Active`,
    /// and counts one more buffer in flight when it succeeds.
    pub fn submit<T>(&self, f: impl FnOnce() -> DragonResult<T>) -> DragonResult<T> {
        let mut inner = self.inner.lock();
        if inner.state != ActivityState::Active {
            return Err(SubmitError::NotActive.into());
        }
        let out = f()?;
        inner.in_flight += 1;
        Ok(out)
    }

    /// One buffer left the device. Called from the interrupt path.
    pub fn complete(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if inner.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    /// Takes ownership of a drain.
    ///
    /// - `Inactive`: nothing to drain, returns `None`.
    /// - `Active`: moves to `Draining` and starts a new drain.
    /// - `Draining` left behind by an interrupted wait: resumes it.
    /// - `Draining` with another owner: [`DragonError::Busy`].
    pub fn begin_drain(&self) -> DragonResult<Option<DrainTicket>> {
        let mut inner = self.inner.lock();
        match inner.state {
            ActivityState::Inactive => Ok(None),
            ActivityState::Active => {
                inner.state = ActivityState::Draining;
                Ok(Some(inner.issue()))
            }
            ActivityState::Draining if !inner.owned => {
                inner.owned = true;
                Ok(Some(DrainTicket(inner.epoch)))
            }
            state @ ActivityState::Draining => Err(DragonError::Busy { state }),
        }
    }

    /// Enters `Draining` from any state and takes the drain away from any
    /// current owner, whose wait or teardown claim then fails with
    /// [`DragonError::Interrupted`].
    ///
    /// Returns the previous state and a ticket for the caller's own teardown.
    pub fn force_draining(&self) -> (ActivityState, DrainTicket) {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = ActivityState::Draining;
        inner.interrupted = false;
        let ticket = inner.issue();
        self.drained.notify_all();
        (previous, ticket)
    }

    /// Blocks until nothing is in flight, the optional `timeout` expires, or
    /// the wait is cancelled.
    ///
    /// [`Activity::interrupt`] releases ownership and leaves the state
    /// `Draining`, so a later [`Activity::begin_drain`] resumes the wait. A
    /// [`Activity::force_draining`] invalidates `ticket` for good. Both end
    /// the wait with [`DragonError::Interrupted`].
    pub fn wait_drained(
        &self,
        ticket: DrainTicket,
        timeout: Option<Duration>,
    ) -> DragonResult<DrainOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = self.inner.lock();
        loop {
            if inner.epoch != ticket.0 {
                return Err(inner.interrupted_error());
            }
            if inner.interrupted {
                inner.interrupted = false;
                inner.owned = false;
                return Err(inner.interrupted_error());
            }
            if inner.in_flight == 0 {
                return Ok(DrainOutcome::Drained);
            }
            match deadline {
                None => self.drained.wait(&mut inner),
                Some(deadline) => {
                    if self.drained.wait_until(&mut inner, deadline).timed_out()
                        && inner.epoch == ticket.0
                        && inner.in_flight != 0
                        && !inner.interrupted
                    {
                        return Ok(DrainOutcome::TimedOut {
                            in_flight: inner.in_flight,
                        });
                    }
                }
            }
        }
    }

    /// Converts a drain ticket into a teardown ticket.
    ///
    /// Fails with [`DragonError::Interrupted`] when a hard reset took the
    /// drain over after the wait ended.
    pub fn claim_teardown(&self, ticket: DrainTicket) -> DragonResult<DrainTicket> {
        let mut inner = self.inner.lock();
        if inner.epoch != ticket.0 || inner.state != ActivityState::Draining {
            return Err(inner.interrupted_error());
        }
        Ok(inner.issue())
    }

    /// Cancels a drain wait in progress. Returns `false` when no drain has
    /// an owner.
    pub fn interrupt(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != ActivityState::Draining || !inner.owned {
            return false;
        }
        inner.interrupted = true;
        self.drained.notify_all();
        true
    }

    /// Completes teardown: `Inactive` with nothing in flight.
    ///
    /// Returns the in-flight count that was discarded, or `None` when a later
    /// hard reset superseded `ticket`; that reset finishes instead.
    pub fn finish(&self, ticket: DrainTicket) -> Option<usize> {
        let mut inner = self.inner.lock();
        if inner.epoch != ticket.0 {
            return None;
        }
        let discarded = inner.in_flight;
        inner.state = ActivityState::Inactive;
        inner.in_flight = 0;
        inner.interrupted = false;
        inner.owned = false;
        self.drained.notify_all();
        Some(discarded)
    }
}
