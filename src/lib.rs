//! Acquisition buffer engine for the Dragon FPGA data-acquisition board.
//!
//! The board streams frames into host memory by DMA. This crate owns the
//! lifecycle of those buffers: a bounded pool of DMA-mapped regions, the
//! ready/done queues shared between callers and the completion interrupt, the
//! CPU/device ownership hand-off of every buffer, and the activity state
//! machine that gates reconfiguration and drains in-flight buffers before the
//! board is reset.
//!
//! Register encoding lives in the `dragon-regs` crate; page allocation and bus
//! mapping are behind [`hardware::DmaBackend`].
#![allow(unsafe_code)] // DMA memory and MMIO access; every block carries a SAFETY note

pub mod activity;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod hardware;
pub mod manager;
pub mod notify;
pub mod params;
pub mod stats;

pub use activity::ActivityState;
pub use config::DragonConfig;
pub use data::{BufferDescriptor, QueueKind};
pub use device::{DeviceOptions, DragonDevice, IrqHandle};
pub use error::{DragonError, DragonResult};
pub use manager::{DeviceManager, Session};
pub use params::AcquisitionParams;
pub use stats::StatsSnapshot;
