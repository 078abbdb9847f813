//! Host-side simulation of a device runtime.
//!
//! Nothing executes; every stream keeps an ordered log of what was queued on
//! it. Waits capture the position the event was recorded at when the wait
//! was issued, so tests can ask whether one queued op is guaranteed to run
//! before another.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{DeviceRuntime, EventId, StreamId, StreamPriority};
use crate::error::{Result, XcollError};

/// One entry in a stream's log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    Kernel(String),
    Record(EventId),
    /// Wait on `event`. `after` is the stream and op count the event
    /// captured at wait time, `None` when it was never recorded.
    Wait {
        event: EventId,
        after: Option<(StreamId, usize)>,
    },
}

struct SimStream {
    device: u32,
    priority: StreamPriority,
    ops: Vec<StreamOp>,
}

struct SimEvent {
    device: u32,
    recorded: Option<(StreamId, usize)>,
}

#[derive(Default)]
struct SimState {
    next_id: u64,
    streams: HashMap<StreamId, SimStream>,
    events: HashMap<EventId, SimEvent>,
    current: HashMap<u32, StreamId>,
    events_created: u64,
}

impl SimState {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn stream_mut(&mut self, id: StreamId) -> Result<&mut SimStream> {
        self.streams
            .get_mut(&id)
            .ok_or_else(|| XcollError::device(format!("unknown stream {}", id.0)))
    }

    fn new_stream(&mut self, device: u32, priority: StreamPriority) -> StreamId {
        let id = StreamId(self.next());
        self.streams.insert(
            id,
            SimStream {
                device,
                priority,
                ops: Vec::new(),
            },
        );
        id
    }
}

/// Simulated devices, each starting with one default stream as its current
/// compute stream.
pub struct SimDevice {
    num_devices: u32,
    state: Mutex<SimState>,
}

impl SimDevice {
    pub fn new(num_devices: u32) -> Self {
        let mut state = SimState::default();
        for device in 0..num_devices {
            let id = state.new_stream(device, StreamPriority::Normal);
            state.current.insert(device, id);
        }
        Self {
            num_devices,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| XcollError::LockPoisoned("sim device"))
    }

    fn check_device(&self, device: u32) -> Result<()> {
        if device >= self.num_devices {
            return Err(XcollError::device(format!(
                "device {device} out of range ({} devices)",
                self.num_devices
            )));
        }
        Ok(())
    }

    /// Queue a compute kernel on `stream`. Returns its position in the log.
    pub fn launch(&self, stream: StreamId, label: impl Into<String>) -> Result<usize> {
        let mut st = self.lock()?;
        let s = st.stream_mut(stream)?;
        s.ops.push(StreamOp::Kernel(label.into()));
        Ok(s.ops.len() - 1)
    }

    /// Switch the caller's compute stream on the stream's device.
    pub fn set_current_stream(&self, stream: StreamId) -> Result<()> {
        let mut st = self.lock()?;
        let device = st.stream_mut(stream)?.device;
        st.current.insert(device, stream);
        Ok(())
    }

    pub fn ops(&self, stream: StreamId) -> Result<Vec<StreamOp>> {
        Ok(self.lock()?.stream_mut(stream)?.ops.clone())
    }

    pub fn stream_priority(&self, stream: StreamId) -> Result<StreamPriority> {
        Ok(self.lock()?.stream_mut(stream)?.priority)
    }

    pub fn stream_device(&self, stream: StreamId) -> Result<u32> {
        Ok(self.lock()?.stream_mut(stream)?.device)
    }

    /// Streams created beyond the per-device defaults.
    pub fn streams_created(&self) -> Result<usize> {
        let st = self.lock()?;
        Ok(st.streams.len() - self.num_devices as usize)
    }

    pub fn events_created(&self) -> Result<u64> {
        Ok(self.lock()?.events_created)
    }

    pub fn live_events(&self) -> Result<usize> {
        Ok(self.lock()?.events.len())
    }

    /// Position of the first kernel with `label` on `stream`.
    pub fn find_kernel(&self, stream: StreamId, label: &str) -> Result<Option<usize>> {
        let st = self.lock()?;
        let s = st
            .streams
            .get(&stream)
            .ok_or_else(|| XcollError::device(format!("unknown stream {}", stream.0)))?;
        Ok(s.ops
            .iter()
            .position(|op| matches!(op, StreamOp::Kernel(l) if l == label)))
    }

    /// Whether op `first` (stream, index) must complete before op `then`
    /// starts, following program order on each stream and the recorded
    /// positions captured by waits.
    pub fn precedes(&self, first: (StreamId, usize), then: (StreamId, usize)) -> Result<bool> {
        let st = self.lock()?;
        let mut frontier = vec![then];
        let mut seen: HashSet<(StreamId, usize)> = HashSet::new();
        while let Some((stream, limit)) = frontier.pop() {
            if !seen.insert((stream, limit)) {
                continue;
            }
            if stream == first.0 && first.1 < limit {
                return Ok(true);
            }
            let Some(s) = st.streams.get(&stream) else {
                continue;
            };
            for op in s.ops.iter().take(limit) {
                if let StreamOp::Wait {
                    after: Some(pos), ..
                } = op
                {
                    frontier.push(*pos);
                }
            }
        }
        Ok(false)
    }
}

impl DeviceRuntime for SimDevice {
    fn create_stream(&self, device: u32, priority: StreamPriority) -> Result<StreamId> {
        self.check_device(device)?;
        Ok(self.lock()?.new_stream(device, priority))
    }

    fn current_stream(&self, device: u32) -> Result<StreamId> {
        self.check_device(device)?;
        let st = self.lock()?;
        st.current
            .get(&device)
            .copied()
            .ok_or_else(|| XcollError::device(format!("no current stream on device {device}")))
    }

    fn create_event(&self, device: u32) -> Result<EventId> {
        self.check_device(device)?;
        let mut st = self.lock()?;
        let id = EventId(st.next());
        st.events.insert(
            id,
            SimEvent {
                device,
                recorded: None,
            },
        );
        st.events_created += 1;
        Ok(id)
    }

    fn record_event(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut st = self.lock()?;
        let device = st.stream_mut(stream)?.device;
        let event_device = st
            .events
            .get(&event)
            .ok_or_else(|| XcollError::device(format!("unknown event {}", event.0)))?
            .device;
        if event_device != device {
            return Err(XcollError::device(format!(
                "event {} belongs to device {event_device}, stream to device {device}",
                event.0
            )));
        }
        let s = st.stream_mut(stream)?;
        s.ops.push(StreamOp::Record(event));
        let pos = (stream, s.ops.len() - 1);
        if let Some(ev) = st.events.get_mut(&event) {
            ev.recorded = Some(pos);
        }
        Ok(())
    }

    fn block_stream(&self, event: EventId, stream: StreamId) -> Result<()> {
        let mut st = self.lock()?;
        let after = st
            .events
            .get(&event)
            .ok_or_else(|| XcollError::device(format!("unknown event {}", event.0)))?
            .recorded;
        st.stream_mut(stream)?
            .ops
            .push(StreamOp::Wait { event, after });
        Ok(())
    }

    fn destroy_event(&self, event: EventId) -> Result<()> {
        let mut st = self.lock()?;
        st.events
            .remove(&event)
            .map(|_| ())
            .ok_or_else(|| XcollError::device(format!("event {} destroyed twice", event.0)))
    }
}
