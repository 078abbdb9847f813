use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use cudarc::driver::result::{event, stream};
use cudarc::driver::{CudaContext, CudaStream, sys};
use xcoll::{DeviceRuntime, EventId, StreamId, StreamPriority};

use crate::error::{CudaSyncError, Result};

enum StreamHandle {
    /// The device's legacy default stream.
    Default,
    /// A caller-owned stream registered as the compute stream.
    Borrowed(Arc<CudaStream>),
    /// Created here, destroyed on drop.
    Owned(sys::CUstream),
}

impl StreamHandle {
    fn raw(&self) -> sys::CUstream {
        match self {
            StreamHandle::Default => std::ptr::null_mut(),
            StreamHandle::Borrowed(s) => s.cu_stream(),
            StreamHandle::Owned(s) => *s,
        }
    }
}

struct Handles {
    next_id: u64,
    streams: HashMap<StreamId, (u32, StreamHandle)>,
    events: HashMap<EventId, (u32, sys::CUevent)>,
    current: HashMap<u32, StreamId>,
}

impl Handles {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn stream(&self, id: StreamId) -> Result<(u32, sys::CUstream)> {
        self.streams
            .get(&id)
            .map(|(d, h)| (*d, h.raw()))
            .ok_or_else(|| CudaSyncError::unknown_stream(id))
    }

    fn event(&self, id: EventId) -> Result<(u32, sys::CUevent)> {
        self.events
            .get(&id)
            .copied()
            .ok_or(CudaSyncError::UnknownEvent(id.0))
    }
}

/// [`DeviceRuntime`] over the CUDA driver API.
///
/// Holds the primary context of every opened device. Streams and events are
/// raw driver handles behind opaque ids; the compute stream of each device
/// starts as its legacy default stream until the caller registers its own.
pub struct CudaRuntime {
    contexts: Vec<Arc<CudaContext>>,
    handles: Mutex<Handles>,
}

// SAFETY: the raw stream and event handles are only touched under the
// `handles` lock, and the driver API is thread-safe once the owning context
// is bound to the calling thread, which every method does first.
unsafe impl Send for CudaRuntime {}
unsafe impl Sync for CudaRuntime {}

impl CudaRuntime {
    /// Open devices `0..num_devices`.
    pub fn new(num_devices: u32) -> Result<Self> {
        let mut contexts = Vec::with_capacity(num_devices as usize);
        let mut handles = Handles {
            next_id: 0,
            streams: HashMap::new(),
            events: HashMap::new(),
            current: HashMap::new(),
        };
        for ordinal in 0..num_devices {
            let ctx = CudaContext::new(ordinal as usize)
                .map_err(CudaSyncError::driver("context create"))?;
            contexts.push(ctx);
            let id = StreamId(handles.next());
            handles.streams.insert(id, (ordinal, StreamHandle::Default));
            handles.current.insert(ordinal, id);
        }
        tracing::debug!(devices = num_devices, "CUDA runtime opened");
        Ok(Self {
            contexts,
            handles: Mutex::new(handles),
        })
    }

    /// Number of devices visible to the driver.
    pub fn device_count() -> Result<u32> {
        cudarc::driver::result::init().map_err(CudaSyncError::driver("init"))?;
        let n = cudarc::driver::result::device::get_count()
            .map_err(CudaSyncError::driver("device count"))?;
        Ok(n.max(0) as u32)
    }

    /// Make `stream` the compute stream collectives are ordered after on its
    /// device. Returns the id it is known by; a previously registered stream
    /// is released and its id stops resolving.
    pub fn set_current_stream(&self, device: u32, stream: Arc<CudaStream>) -> Result<StreamId> {
        self.bind(device)?;
        let mut h = self.lock();
        let id = StreamId(h.next());
        h.streams.insert(id, (device, StreamHandle::Borrowed(stream)));
        if let Some(prev) = h.current.insert(device, id)
            && matches!(h.streams.get(&prev), Some((_, StreamHandle::Borrowed(_))))
        {
            h.streams.remove(&prev);
        }
        Ok(id)
    }

    /// Streams currently known to the runtime, default streams included.
    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    /// The raw driver stream behind `id`.
    pub fn raw_stream(&self, id: StreamId) -> Result<sys::CUstream> {
        Ok(self.lock().stream(id)?.1)
    }

    fn lock(&self) -> MutexGuard<'_, Handles> {
        // A poisoned lock still guards valid handles.
        self.handles.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn context(&self, device: u32) -> Result<&Arc<CudaContext>> {
        self.contexts
            .get(device as usize)
            .ok_or(CudaSyncError::InvalidDevice {
                ordinal: device,
                count: self.contexts.len() as u32,
            })
    }

    fn bind(&self, device: u32) -> Result<()> {
        self.context(device)?
            .bind_to_thread()
            .map_err(CudaSyncError::driver("bind context"))
    }

    fn create_raw_stream(&self, priority: StreamPriority) -> Result<sys::CUstream> {
        match priority {
            StreamPriority::Normal => stream::create(stream::StreamKind::NonBlocking)
                .map_err(CudaSyncError::driver("stream create")),
            StreamPriority::High => {
                let (mut least, mut greatest) = (0, 0);
                // SAFETY: out-pointers to live locals; a context is bound.
                unsafe { sys::cuCtxGetStreamPriorityRange(&mut least, &mut greatest) }
                    .result()
                    .map_err(CudaSyncError::driver("stream priority range"))?;
                let mut raw = std::ptr::null_mut();
                // SAFETY: as above.
                unsafe {
                    sys::cuStreamCreateWithPriority(
                        &mut raw,
                        sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                        greatest,
                    )
                }
                .result()
                .map_err(CudaSyncError::driver("stream create"))?;
                Ok(raw)
            }
        }
    }

    fn create_stream_inner(&self, device: u32, priority: StreamPriority) -> Result<StreamId> {
        self.bind(device)?;
        let raw = self.create_raw_stream(priority)?;
        let mut h = self.lock();
        let id = StreamId(h.next());
        h.streams.insert(id, (device, StreamHandle::Owned(raw)));
        Ok(id)
    }

    fn current_stream_inner(&self, device: u32) -> Result<StreamId> {
        self.context(device)?;
        self.lock()
            .current
            .get(&device)
            .copied()
            .ok_or(CudaSyncError::InvalidDevice {
                ordinal: device,
                count: self.contexts.len() as u32,
            })
    }

    fn create_event_inner(&self, device: u32) -> Result<EventId> {
        self.bind(device)?;
        let raw = event::create(sys::CUevent_flags::CU_EVENT_DISABLE_TIMING)
            .map_err(CudaSyncError::driver("event create"))?;
        let mut h = self.lock();
        let id = EventId(h.next());
        h.events.insert(id, (device, raw));
        Ok(id)
    }

    fn record_event_inner(&self, ev: EventId, s: StreamId) -> Result<()> {
        let h = self.lock();
        let (event_device, raw_event) = h.event(ev)?;
        let (stream_device, raw_stream) = h.stream(s)?;
        if event_device != stream_device {
            return Err(CudaSyncError::DeviceMismatch {
                stream: s.0,
                stream_device,
                event_device,
            });
        }
        self.bind(stream_device)?;
        // SAFETY: both handles are live while the lock is held.
        unsafe { event::record(raw_event, raw_stream) }
            .map_err(CudaSyncError::driver("event record"))
    }

    fn block_stream_inner(&self, ev: EventId, s: StreamId) -> Result<()> {
        let h = self.lock();
        let (_, raw_event) = h.event(ev)?;
        let (stream_device, raw_stream) = h.stream(s)?;
        self.bind(stream_device)?;
        // SAFETY: both handles are live while the lock is held.
        unsafe {
            stream::wait_event(
                raw_stream,
                raw_event,
                sys::CUevent_wait_flags::CU_EVENT_WAIT_DEFAULT,
            )
        }
        .map_err(CudaSyncError::driver("stream wait event"))
    }

    fn destroy_event_inner(&self, ev: EventId) -> Result<()> {
        let mut h = self.lock();
        let (device, raw) = h.events.remove(&ev).ok_or(CudaSyncError::UnknownEvent(ev.0))?;
        self.bind(device)?;
        // SAFETY: removed from the table, so no other call can reach it.
        unsafe { event::destroy(raw) }.map_err(CudaSyncError::driver("event destroy"))
    }
}

impl DeviceRuntime for CudaRuntime {
    fn create_stream(&self, device: u32, priority: StreamPriority) -> xcoll::Result<StreamId> {
        Ok(self.create_stream_inner(device, priority)?)
    }

    fn current_stream(&self, device: u32) -> xcoll::Result<StreamId> {
        Ok(self.current_stream_inner(device)?)
    }

    fn create_event(&self, device: u32) -> xcoll::Result<EventId> {
        Ok(self.create_event_inner(device)?)
    }

    fn record_event(&self, event: EventId, stream: StreamId) -> xcoll::Result<()> {
        Ok(self.record_event_inner(event, stream)?)
    }

    fn block_stream(&self, event: EventId, stream: StreamId) -> xcoll::Result<()> {
        Ok(self.block_stream_inner(event, stream)?)
    }

    fn destroy_event(&self, event: EventId) -> xcoll::Result<()> {
        Ok(self.destroy_event_inner(event)?)
    }
}

impl Drop for CudaRuntime {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(|p| p.into_inner());
        for (id, (device, raw)) in handles.events.drain() {
            let destroyed = self
                .contexts
                .get(device as usize)
                .map(|ctx| ctx.bind_to_thread())
                .transpose()
                .and_then(|_| unsafe { event::destroy(raw) });
            if let Err(e) = destroyed {
                tracing::warn!(event = id.0, error = %e, "leaked CUDA event");
            }
        }
        for (id, (device, handle)) in handles.streams.drain() {
            let StreamHandle::Owned(raw) = handle else {
                continue;
            };
            let destroyed = self
                .contexts
                .get(device as usize)
                .map(|ctx| ctx.bind_to_thread())
                .transpose()
                .and_then(|_| unsafe { stream::destroy(raw) });
            if let Err(e) = destroyed {
                tracing::warn!(stream = id.0, error = %e, "leaked CUDA stream");
            }
        }
    }
}
