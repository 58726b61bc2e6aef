//! Error types for the acquisition buffer engine.
//!
//! This module defines the primary error type, `DragonError`, plus the focused
//! error enums returned by the individual engine operations. Using the
//! `thiserror` crate, each operation reports exactly the failures it can
//! produce, and every one of them converts into `DragonError` with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Params`** (`ParamError`): a proposed `AcquisitionParams` field is out of
//!   range. Nothing is committed.
//! - **`Busy`**: the operation is not allowed while acquisition is active or
//!   draining (parameter changes, buffer allocation and release).
//! - **`InvalidIndex`**: a buffer index is not below the pool capacity.
//! - **`Alloc`** (`AllocError`): pool growth failed; `OutOfMemory` keeps and
//!   reports the buffers allocated before the failure.
//! - **`Submit`** (`SubmitError`): a buffer could not be queued to hardware.
//! - **`Empty`**: no completed buffer is waiting in the done queue.
//! - **`Interrupted`**: a blocking drain was cancelled from outside.
//! - **`InvalidMapping`**: a map request does not cover exactly one buffer.
//! - **`Config`** (`ConfigError`): configuration failed to load or validate.
//! - Manager-level failures: `DeviceBusy`, `NoSuchDevice`, `TooManyDevices`.
//!
//! `Desync` is deliberately not a `DragonError` variant: it is a diagnostic that
//! is logged while the consume operation still succeeds.

use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the engine error type.
pub type DragonResult<T> = std::result::Result<T, DragonError>;

/// Crate-level error.
#[derive(Error, Debug)]
pub enum DragonError {
    #[error("Invalid acquisition parameters: {0}")]
    Params(#[from] ParamError),

    #[error("Device is busy: acquisition is {state}")]
    Busy { state: crate::activity::ActivityState },

    #[error("Buffer index {index} out of range (capacity {capacity})")]
    InvalidIndex { index: usize, capacity: usize },

    #[error("Buffer allocation failed: {0}")]
    Alloc(#[from] AllocError),

    #[error("Buffer submission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("No completed buffer available")]
    Empty,

    #[error("Acquisition is already active")]
    AlreadyActive,

    #[error("Drain interrupted with {in_flight} buffers still in flight")]
    Interrupted { in_flight: usize },

    #[error("Mapping request offset {offset:#x} length {length} does not match a buffer")]
    InvalidMapping { offset: u64, length: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device {0} is already open")]
    DeviceBusy(String),

    #[error("No device with minor number {0}")]
    NoSuchDevice(u32),

    #[error("Device limit of {0} reached")]
    TooManyDevices(u32),
}

/// Rejected parameter field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("frame_length {value} outside {min}..={max}")]
    FrameLength { value: u32, min: u32, max: u32 },

    #[error("frames_per_buffer {value} invalid (max {max}, {bytes} bytes exceeds ceiling {ceiling})")]
    FramesPerBuffer {
        value: u32,
        max: u32,
        bytes: u64,
        ceiling: u32,
    },

    #[error("switch_period {value} outside 1..={max}")]
    SwitchPeriod { value: u32, max: u32 },

    #[error("sync_offset {value} exceeds {max}")]
    SyncOffset { value: u32, max: u32 },

    #[error("sync_width {value} exceeds {max}")]
    SyncWidth { value: u32, max: u32 },
}

/// Buffer pool growth failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("buffer of {bytes} bytes needs page order {order}, limit is {max_order}")]
    TooBig {
        bytes: usize,
        order: u32,
        max_order: u32,
    },

    #[error("{requested} buffers requested, limit is {max}")]
    TooMany { requested: usize, max: usize },

    #[error("DMA allocation failed; {available} buffers available")]
    OutOfMemory { available: usize },
}

/// Reason a buffer could not be queued to hardware.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    #[error("buffer index {index} out of range (capacity {capacity})")]
    InvalidIndex { index: usize, capacity: usize },

    #[error("acquisition is not active")]
    NotActive,

    #[error("buffer {index} holds {length} bytes, parameters need {required}")]
    UndersizedBuffer {
        index: usize,
        length: usize,
        required: usize,
    },

    #[error("buffer {index} is already queued")]
    AlreadyQueued { index: usize },
}

/// Failure reported by a DMA backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DmaError {
    #[error("page allocation of order {order} failed")]
    Alloc { order: u32 },

    #[error("bus mapping failed")]
    Map,
}

/// Hardware reported a different completed buffer than the done queue holds.
///
/// Logged by `consume`; never returned.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("desync: consumed buffer {index} at {expected:#x}, hardware last address {reported:#x}")]
pub struct Desync {
    /// Buffer that was consumed.
    pub index: usize,
    /// Its bus address.
    pub expected: u64,
    /// Address in the last-address register.
    pub reported: u32,
}
