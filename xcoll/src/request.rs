//! In-flight collectives and the progress driver.
//!
//! A [`CollRequest`] is `InProgress` from the moment its post succeeds and
//! moves forward exactly once, to `Completed` or `Failed`. Nothing blocks:
//! callers poll [`CollRequest::progress`] (or await [`CollRequest::wait`])
//! and read the outcome with [`CollRequest::test`].

use std::sync::Arc;
use std::task::Poll;

use crate::context::ContextShared;
use crate::device::{EventId, PooledEvent};
use crate::error::{Result, XcollError};
use crate::library::CollectiveLibrary;
use crate::memory::Tensor;
use crate::types::{CollectiveType, Device, Progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    InProgress,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::InProgress)
    }
}

/// Work that runs once the library reports completion.
pub(crate) enum RequestKind {
    Plain,
    /// Results land in one flat scratch tensor and are split into the
    /// per-rank outputs afterwards.
    Allgather { flat: Tensor },
}

pub struct CollRequest<L: CollectiveLibrary> {
    ctx: Arc<ContextShared<L>>,
    device: Device,
    coll_type: CollectiveType,
    src: Vec<Tensor>,
    dst: Vec<Tensor>,
    kind: RequestKind,
    handle: Option<L::Coll>,
    status: RequestStatus,
    failure: Option<String>,
    event: Option<PooledEvent>,
}

/// Everything a posted collective hands to its request.
pub(crate) struct Posted<L: CollectiveLibrary> {
    pub device: Device,
    pub coll_type: CollectiveType,
    pub src: Vec<Tensor>,
    pub dst: Vec<Tensor>,
    pub kind: RequestKind,
    pub handle: L::Coll,
    pub event: Option<PooledEvent>,
}

impl<L: CollectiveLibrary> CollRequest<L> {
    pub(crate) fn posted(ctx: Arc<ContextShared<L>>, posted: Posted<L>) -> Self {
        Self {
            ctx,
            device: posted.device,
            coll_type: posted.coll_type,
            src: posted.src,
            dst: posted.dst,
            kind: posted.kind,
            handle: Some(posted.handle),
            status: RequestStatus::InProgress,
            failure: None,
            event: posted.event,
        }
    }

    /// Drive the library once and test this request.
    ///
    /// Returns `RuntimeProgress` on the call that observes a failure; the
    /// request then reads `Failed` and further calls do nothing.
    pub fn progress(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Ok(());
        }
        let shared = &self.ctx;
        let outcome = shared
            .lib_context()
            .and_then(|ctx| shared.library.context_progress(ctx))
            .and_then(|()| match self.handle.as_mut() {
                Some(handle) => shared.library.collective_test(handle),
                None => Err(XcollError::InvalidArgument(
                    "request has no library handle".into(),
                )),
            });
        match outcome {
            Ok(Progress::InProgress) => Ok(()),
            Ok(Progress::Done) => match self.post_complete() {
                Ok(()) => {
                    self.finalize_handle();
                    self.status = RequestStatus::Completed;
                    tracing::trace!(coll = %self.coll_type, device = %self.device, "request completed");
                    Ok(())
                }
                Err(e) => Err(self.fail(e)),
            },
            Err(e) => Err(self.fail(e)),
        }
    }

    fn post_complete(&self) -> Result<()> {
        match &self.kind {
            RequestKind::Plain => Ok(()),
            RequestKind::Allgather { flat } => unflatten(flat, &self.dst),
        }
    }

    fn fail(&mut self, err: XcollError) -> XcollError {
        let reason = err.to_string();
        tracing::warn!(
            rank = self.ctx.rank,
            coll = %self.coll_type,
            error = %reason,
            "collective failed"
        );
        self.finalize_handle();
        self.status = RequestStatus::Failed;
        self.failure = Some(reason.clone());
        XcollError::RuntimeProgress {
            operation: self.coll_type,
            reason,
        }
    }

    fn finalize_handle(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = self.ctx.library.collective_finalize(handle)
        {
            tracing::warn!(coll = %self.coll_type, error = %e, "collective finalize failed");
        }
    }

    /// Current status. Never blocks and never calls into the library.
    pub fn test(&self) -> RequestStatus {
        self.status
    }

    /// Make the caller's current device stream wait for this collective.
    ///
    /// Only device-resident collectives without blocking wait that are still
    /// in progress have anything to wait for; otherwise this does nothing.
    pub fn fence(&self) -> Result<()> {
        if !self.device.is_device()
            || self.ctx.policy.blocking_wait(self.coll_type)
            || self.status != RequestStatus::InProgress
        {
            return Ok(());
        }
        match &self.event {
            Some(event) => self.ctx.sync.fence(event),
            None => Ok(()),
        }
    }

    /// Poll until the request is terminal, yielding to the executor between
    /// polls.
    pub async fn wait(&mut self) -> Result<RequestStatus> {
        futures::future::poll_fn(|cx| match self.progress() {
            Err(e) => Poll::Ready(Err(e)),
            Ok(()) if self.status.is_terminal() => Poll::Ready(Ok(self.status)),
            Ok(()) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        })
        .await
    }

    pub fn coll_type(&self) -> CollectiveType {
        self.coll_type
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn inputs(&self) -> &[Tensor] {
        &self.src
    }

    pub fn outputs(&self) -> &[Tensor] {
        &self.dst
    }

    /// The library handle, until the request reaches a terminal state.
    pub fn handle(&self) -> Option<&L::Coll> {
        self.handle.as_ref()
    }

    /// Pooled completion event held by a device-resident request.
    pub fn event_id(&self) -> Option<EventId> {
        self.event.as_ref().map(PooledEvent::id)
    }

    pub(crate) fn pooled_event(&self) -> Option<&PooledEvent> {
        self.event.as_ref()
    }
}

impl<L: CollectiveLibrary> Drop for CollRequest<L> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            tracing::debug!(coll = %self.coll_type, "dropping unfinished request");
        }
        self.finalize_handle();
        // Return the event before the context reference goes away.
        self.event.take();
    }
}

/// Copy slice `r` of `flat` into `outputs[r]`.
pub(crate) fn unflatten(flat: &Tensor, outputs: &[Tensor]) -> Result<()> {
    let mut offset = 0;
    for out in outputs {
        let len = out.len_bytes()?;
        let bytes = flat.read_range(offset, len)?;
        out.write_at(0, &bytes)?;
        offset += len;
    }
    Ok(())
}
