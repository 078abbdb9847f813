use crate::types::{CollectiveType, Rank};

pub type Result<T> = std::result::Result<T, XcollError>;

#[derive(Debug, thiserror::Error)]
pub enum XcollError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("buffers span more than one device: {first} and {second}")]
    DeviceMismatch {
        first: crate::types::Device,
        second: crate::types::Device,
    },

    #[error("transport init failed at {stage}: {reason}")]
    TransportInit { stage: &'static str, reason: String },

    #[error("{operation} post failed: {reason}")]
    Post {
        operation: CollectiveType,
        reason: String,
    },

    #[error("{operation} failed while progressing: {reason}")]
    RuntimeProgress {
        operation: CollectiveType,
        reason: String,
    },

    #[error("invalid rank {rank}: group size is {size}")]
    InvalidRank { rank: Rank, size: u32 },

    #[error(
        "count {count} is not evenly divisible by group size {size} (required by {operation})"
    )]
    IndivisibleCount {
        count: usize,
        size: usize,
        operation: CollectiveType,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("unsupported data type: {dtype:?} for operation {op}")]
    UnsupportedDType {
        dtype: crate::types::DataType,
        op: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("peer {rank} disconnected")]
    PeerDisconnected { rank: Rank },

    #[error("bootstrap allgather failed: {0}")]
    Bootstrap(String),

    #[error("device runtime error: {message}")]
    DeviceError {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl XcollError {
    /// Create a `DeviceError` with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `DeviceError` with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::DeviceError {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap any error raised during context bring-up.
    pub(crate) fn init(stage: &'static str, err: impl std::fmt::Display) -> Self {
        Self::TransportInit {
            stage,
            reason: err.to_string(),
        }
    }
}
