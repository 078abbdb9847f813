//! Ordering collective device work against caller compute.
//!
//! Each context owns one [`DeviceSync`]: a lazily created communication
//! stream plus a pool of reusable events. Every device-resident post goes
//! through [`DeviceSync::order_after_compute`], which records a pooled event
//! on the caller's current stream and makes the communication stream wait
//! on it. Requests hold the event until they are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{DeviceRuntime, EventId, StreamId, StreamPriority};
use crate::error::{Result, XcollError};
use crate::types::Device;

struct PoolInner {
    free: VecDeque<(u32, EventId)>,
    all: Vec<(u32, EventId)>,
}

/// Reusable device events for one context.
///
/// Grows when no free event exists for the requested device and never
/// shrinks until [`EventPool::destroy_all`] at context teardown.
pub struct EventPool {
    runtime: Arc<dyn DeviceRuntime>,
    inner: Mutex<PoolInner>,
}

impl EventPool {
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self {
            runtime,
            inner: Mutex::new(PoolInner {
                free: VecDeque::new(),
                all: Vec::new(),
            }),
        }
    }

    /// Take the first free event for `device`, creating one if none is free.
    pub fn acquire(self: &Arc<Self>, device: u32) -> Result<PooledEvent> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| XcollError::LockPoisoned("event pool"))?;
        let reused = inner
            .free
            .iter()
            .position(|(d, _)| *d == device)
            .and_then(|i| inner.free.remove(i));
        let event = match reused {
            Some((_, event)) => event,
            None => {
                let event = self.runtime.create_event(device)?;
                inner.all.push((device, event));
                tracing::debug!(device, total = inner.all.len(), "event pool grew");
                event
            }
        };
        Ok(PooledEvent {
            event,
            device,
            pool: Arc::clone(self),
        })
    }

    /// Events created over the pool's lifetime.
    pub fn created(&self) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| XcollError::LockPoisoned("event pool"))?
            .all
            .len())
    }

    /// Events currently sitting in the pool.
    pub fn available(&self) -> Result<usize> {
        Ok(self
            .inner
            .lock()
            .map_err(|_| XcollError::LockPoisoned("event pool"))?
            .free
            .len())
    }

    fn release(&self, device: u32, event: EventId) {
        match self.inner.lock() {
            Ok(mut inner) => inner.free.push_back((device, event)),
            Err(_) => tracing::warn!(event = event.0, "event pool poisoned, event leaked"),
        }
    }

    /// Destroy every event the pool created. Events still held by a
    /// `PooledEvent` are destroyed too, so call this only once no request
    /// is alive.
    pub fn destroy_all(&self) -> Result<()> {
        let events = {
            let mut inner = self
                .inner
                .lock()
                .map_err(|_| XcollError::LockPoisoned("event pool"))?;
            inner.free.clear();
            std::mem::take(&mut inner.all)
        };
        let mut first_err = None;
        for (_, event) in events {
            if let Err(e) = self.runtime.destroy_event(event) {
                tracing::warn!(event = event.0, error = %e, "failed to destroy event");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// An event borrowed from an [`EventPool`]. Goes back to the pool on drop.
pub struct PooledEvent {
    event: EventId,
    device: u32,
    pool: Arc<EventPool>,
}

impl PooledEvent {
    pub fn id(&self) -> EventId {
        self.event
    }

    pub fn device(&self) -> u32 {
        self.device
    }
}

impl std::fmt::Debug for PooledEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledEvent")
            .field("event", &self.event)
            .field("device", &self.device)
            .finish()
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        self.pool.release(self.device, self.event);
    }
}

/// The context's communication stream, bound to one device on first use.
#[derive(Default)]
pub struct StreamBinding {
    slot: Mutex<Option<(u32, StreamId)>>,
}

impl StreamBinding {
    pub fn get(&self) -> Result<Option<(u32, StreamId)>> {
        Ok(*self
            .slot
            .lock()
            .map_err(|_| XcollError::LockPoisoned("stream binding"))?)
    }

    /// Return the bound stream, creating it with `create` if unbound.
    /// A bound stream on another device is a `DeviceMismatch`.
    pub fn get_or_create(
        &self,
        device: u32,
        create: impl FnOnce() -> Result<StreamId>,
    ) -> Result<StreamId> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| XcollError::LockPoisoned("stream binding"))?;
        match *slot {
            Some((bound, stream)) if bound == device => Ok(stream),
            Some((bound, _)) => Err(XcollError::DeviceMismatch {
                first: Device::Cuda(bound),
                second: Device::Cuda(device),
            }),
            None => {
                let stream = create()?;
                *slot = Some((device, stream));
                Ok(stream)
            }
        }
    }
}

/// Per-context stream and event state.
pub struct DeviceSync {
    runtime: Arc<dyn DeviceRuntime>,
    pool: Arc<EventPool>,
    binding: StreamBinding,
    priority: StreamPriority,
}

impl DeviceSync {
    pub fn new(runtime: Arc<dyn DeviceRuntime>, high_priority: bool) -> Self {
        Self {
            pool: Arc::new(EventPool::new(Arc::clone(&runtime))),
            runtime,
            binding: StreamBinding::default(),
            priority: if high_priority {
                StreamPriority::High
            } else {
                StreamPriority::Normal
            },
        }
    }

    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    pub fn pool(&self) -> &Arc<EventPool> {
        &self.pool
    }

    /// The bound communication stream, if one was created.
    pub fn comm_stream(&self) -> Result<Option<StreamId>> {
        Ok(self.binding.get()?.map(|(_, s)| s))
    }

    /// Device ordinal and stream of the bound communication stream.
    pub fn comm_binding(&self) -> Result<Option<(u32, StreamId)>> {
        self.binding.get()
    }

    pub fn ensure_comm_stream(&self, device: u32) -> Result<StreamId> {
        self.binding.get_or_create(device, || {
            let stream = self.runtime.create_stream(device, self.priority)?;
            tracing::debug!(
                device,
                stream = stream.0,
                priority = ?self.priority,
                "created communication stream"
            );
            Ok(stream)
        })
    }

    /// Record a pooled event on the caller's current stream and make the
    /// communication stream wait on it. Everything queued on the compute
    /// stream so far runs before anything queued on the comm stream after
    /// this call.
    pub fn order_after_compute(&self, device: u32) -> Result<PooledEvent> {
        let comm = self.ensure_comm_stream(device)?;
        let compute = self.runtime.current_stream(device)?;
        let event = self.pool.acquire(device)?;
        self.runtime.record_event(event.id(), compute)?;
        self.runtime.block_stream(event.id(), comm)?;
        Ok(event)
    }

    /// Re-record `event` on the communication stream to mark where the
    /// collective's device work ends.
    pub fn record_completion(&self, event: &PooledEvent) -> Result<()> {
        let comm = self.comm_stream()?.ok_or_else(|| {
            XcollError::Configuration("no communication stream to record completion on".into())
        })?;
        self.runtime.record_event(event.id(), comm)
    }

    /// Make the caller's current stream wait on `event`.
    pub fn fence(&self, event: &PooledEvent) -> Result<()> {
        let current = self.runtime.current_stream(event.device())?;
        self.runtime.block_stream(event.id(), current)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.pool.destroy_all()
    }
}
