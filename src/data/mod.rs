//! Buffer storage and queueing.
//!
//! - `buffer_pool`: the DMA-mapped buffers and their ownership flags.
//! - `ring`: the ready/done queues linking buffer indices.

pub mod buffer_pool;
pub mod ring;

pub use buffer_pool::{Buffer, BufferDescriptor, BufferPool};
pub use ring::{QueueKind, Ring};
