use cudarc::driver::DriverError;
use xcoll::{StreamId, XcollError};

pub type Result<T> = std::result::Result<T, CudaSyncError>;

#[derive(Debug, thiserror::Error)]
pub enum CudaSyncError {
    #[error("CUDA driver error during {op}: {source}")]
    Driver {
        op: &'static str,
        #[source]
        source: DriverError,
    },

    #[error("device {ordinal} out of range: {count} device(s) opened")]
    InvalidDevice { ordinal: u32, count: u32 },

    #[error("unknown stream {0}")]
    UnknownStream(u64),

    #[error("unknown event {0}")]
    UnknownEvent(u64),

    #[error("stream {stream} is on device {stream_device}, event on device {event_device}")]
    DeviceMismatch {
        stream: u64,
        stream_device: u32,
        event_device: u32,
    },
}

impl CudaSyncError {
    pub(crate) fn driver(op: &'static str) -> impl FnOnce(DriverError) -> Self {
        move |source| CudaSyncError::Driver { op, source }
    }

    pub(crate) fn unknown_stream(id: StreamId) -> Self {
        CudaSyncError::UnknownStream(id.0)
    }
}

impl From<CudaSyncError> for XcollError {
    fn from(e: CudaSyncError) -> Self {
        let message = e.to_string();
        XcollError::device_with_source(message, e)
    }
}
