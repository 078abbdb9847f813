//! Device stream and event runtime.
//!
//! Collectives never wait on the host for device work. Instead they order
//! communication against compute on the device itself: an event recorded on
//! the caller's compute stream is waited on by the communication stream,
//! and the reverse for fences. The [`DeviceRuntime`] trait is the seam to
//! the driver; `xcoll-cuda` implements it over CUDA and [`SimDevice`]
//! simulates it on the host.

pub mod sim;
pub mod sync;

pub use sim::{SimDevice, StreamOp};
pub use sync::{DeviceSync, EventPool, PooledEvent, StreamBinding};

use crate::error::Result;

/// Opaque stream handle issued by a `DeviceRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Opaque event handle issued by a `DeviceRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamPriority {
    #[default]
    Normal,
    High,
}

/// Driver-level stream and event operations for one process.
///
/// Device ordinals are the `N` of `Device::Cuda(N)`. None of these calls
/// may block the host on device work.
pub trait DeviceRuntime: Send + Sync {
    /// Create a new non-default stream on `device`.
    fn create_stream(&self, device: u32, priority: StreamPriority) -> Result<StreamId>;

    /// The stream the caller is currently issuing compute work on.
    fn current_stream(&self, device: u32) -> Result<StreamId>;

    fn create_event(&self, device: u32) -> Result<EventId>;

    /// Capture the work queued on `stream` so far into `event`.
    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()>;

    /// Make `stream` wait for the last record of `event` before running
    /// anything queued after this call.
    fn block_stream(&self, event: EventId, stream: StreamId) -> Result<()>;

    fn destroy_event(&self, event: EventId) -> Result<()>;
}
