//! CUDA driver backend for xcoll's device stream and event ordering.
//!
//! [`CudaRuntime`] implements [`xcoll::DeviceRuntime`], so a `TeamContext`
//! built with it orders device-resident collectives after the caller's CUDA
//! compute stream on a dedicated communication stream.

pub mod error;
pub mod runtime;

pub use error::{CudaSyncError, Result};
pub use runtime::CudaRuntime;
