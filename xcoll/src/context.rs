//! Building and tearing down a collective context.
//!
//! Bring-up runs in stages: library, context configuration, execution
//! context, team creation. Each completed stage is recorded in a
//! [`PartialContext`] so that any later failure tears down exactly what
//! exists, in reverse order, before the error reaches the caller.

use std::sync::Arc;

use crate::bootstrap::{EpRange, OobEndpoint};
use crate::config::CollPolicy;
use crate::device::{DeviceRuntime, DeviceSync};
use crate::error::{Result, XcollError};
use crate::library::{
    CollectiveLibrary, ContextParams, LibParams, TeamCompletion, TeamParams, ThreadMode,
};
use crate::p2p::PointToPoint;
use crate::types::{Progress, Rank};

/// Prefix the library reads its context configuration under.
pub const CONFIG_PREFIX: &str = "XCOLL";

/// Library handles created so far, torn down in reverse order.
pub(crate) struct PartialContext<L: CollectiveLibrary> {
    lib: Option<L::Lib>,
    ctx: Option<L::Context>,
    team: Option<L::Team>,
}

impl<L: CollectiveLibrary> PartialContext<L> {
    fn new() -> Self {
        Self {
            lib: None,
            ctx: None,
            team: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.lib.is_none() && self.ctx.is_none() && self.team.is_none()
    }

    /// Destroy team, context and library, whichever exist. Every stage is
    /// attempted; the first error is returned.
    pub(crate) fn unwind(&mut self, library: &L) -> Result<()> {
        let mut first_err = None;
        if let Some(team) = self.team.take()
            && let Err(e) = library.team_destroy(team)
        {
            tracing::warn!(error = %e, "team destroy failed");
            first_err.get_or_insert(e);
        }
        if let Some(ctx) = self.ctx.take()
            && let Err(e) = library.context_destroy(ctx)
        {
            tracing::warn!(error = %e, "context destroy failed");
            first_err.get_or_insert(e);
        }
        if let Some(lib) = self.lib.take()
            && let Err(e) = library.lib_cleanup(lib)
        {
            tracing::warn!(error = %e, "library cleanup failed");
            first_err.get_or_insert(e);
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// State shared between a `TeamContext` and its outstanding requests.
pub(crate) struct ContextShared<L: CollectiveLibrary> {
    pub(crate) library: L,
    handles: PartialContext<L>,
    p2p: Arc<dyn PointToPoint>,
    pub(crate) rank: Rank,
    pub(crate) size: u32,
    pub(crate) policy: CollPolicy,
    pub(crate) sync: DeviceSync,
}

impl<L: CollectiveLibrary> ContextShared<L> {
    pub(crate) fn lib_context(&self) -> Result<&L::Context> {
        self.handles
            .ctx
            .as_ref()
            .ok_or_else(|| XcollError::InvalidArgument("context already closed".into()))
    }

    pub(crate) fn team(&self) -> Result<&L::Team> {
        self.handles
            .team
            .as_ref()
            .ok_or_else(|| XcollError::InvalidArgument("context already closed".into()))
    }

    fn teardown(&mut self) -> Result<()> {
        if self.handles.is_empty() {
            return Ok(());
        }
        let events = self.sync.shutdown();
        let handles = self.handles.unwind(&self.library);
        tracing::debug!(rank = self.rank, "collective context closed");
        events.and(handles)
    }
}

impl<L: CollectiveLibrary> Drop for ContextShared<L> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(rank = self.rank, error = %e, "deferred context teardown failed");
        }
    }
}

/// A team of ranks ready to run collectives.
pub struct TeamContext<L: CollectiveLibrary> {
    pub(crate) shared: Arc<ContextShared<L>>,
}

impl<L: CollectiveLibrary> TeamContext<L> {
    /// Build a context, polling team creation until it completes.
    ///
    /// Every rank of `p2p` must call this concurrently. With
    /// `policy.init_max_polls` set, giving up after that many polls is a
    /// `TransportInit` error.
    pub fn init(
        library: L,
        p2p: Arc<dyn PointToPoint>,
        runtime: Arc<dyn DeviceRuntime>,
        policy: CollPolicy,
    ) -> Result<Self> {
        let max_polls = policy.init_max_polls;
        let mut init = Self::init_nb(library, p2p, runtime, policy)?;
        let mut polls: u64 = 0;
        while init.test()? == Progress::InProgress {
            polls += 1;
            if let Some(max) = max_polls
                && polls >= max
            {
                return Err(XcollError::TransportInit {
                    stage: "team create",
                    reason: format!("still in progress after {max} polls"),
                });
            }
            std::thread::yield_now();
        }
        init.into_context()
    }

    /// Start building a context. Team creation is posted but not awaited;
    /// poll the returned [`TeamInit`].
    pub fn init_nb(
        library: L,
        p2p: Arc<dyn PointToPoint>,
        runtime: Arc<dyn DeviceRuntime>,
        policy: CollPolicy,
    ) -> Result<TeamInit<L>> {
        let rank = p2p.rank();
        let size = p2p.size();
        let mut partial = PartialContext::<L>::new();

        let fail = |partial: &mut PartialContext<L>, stage: &'static str, err: XcollError| {
            tracing::warn!(rank, stage, error = %err, "context initialization failed");
            // Unwind errors are logged by `unwind`; the stage error wins.
            let _ = partial.unwind(&library);
            XcollError::init(stage, err)
        };

        let lib = match library.lib_init(&LibParams::default()) {
            Ok(lib) => lib,
            Err(e) => return Err(fail(&mut partial, "library init", e)),
        };
        let lib = partial.lib.insert(lib);

        let mut config = match library.context_config_read(lib, CONFIG_PREFIX) {
            Ok(c) => c,
            Err(e) => return Err(fail(&mut partial, "context config", e)),
        };
        if let Err(e) = policy.apply_to(&mut config) {
            return Err(fail(&mut partial, "context config", e));
        }
        for (tl, key, value) in config.iter() {
            tracing::trace!(prefix = config.prefix(), %tl, key, value, "context option");
        }

        let oob = OobEndpoint::with_direction(Arc::clone(&p2p), policy.oob_direction);
        let params = ContextParams {
            thread_mode: ThreadMode::Multiple,
            completion: TeamCompletion::Blocking,
            tls: policy.tls,
            oob: oob.clone(),
        };
        let ctx = match library.context_create(lib, params, &config) {
            Ok(ctx) => ctx,
            Err(e) => return Err(fail(&mut partial, "context create", e)),
        };
        let ctx = partial.ctx.insert(ctx);

        let team_params = TeamParams {
            range: EpRange::strided(0, 1, size),
            oob,
        };
        let team = match library.team_create_post(ctx, team_params) {
            Ok(team) => team,
            Err(e) => return Err(fail(&mut partial, "team create", e)),
        };
        partial.team = Some(team);
        tracing::debug!(rank, size, "team creation posted");

        Ok(TeamInit {
            library: Some(library),
            partial,
            p2p,
            runtime,
            policy,
            done: false,
            failed: false,
        })
    }

    pub fn rank(&self) -> Rank {
        self.shared.rank
    }

    pub fn size(&self) -> u32 {
        self.shared.size
    }

    pub fn policy(&self) -> &CollPolicy {
        &self.shared.policy
    }

    pub fn library(&self) -> &L {
        &self.shared.library
    }

    pub fn device_sync(&self) -> &DeviceSync {
        &self.shared.sync
    }

    pub fn transport(&self) -> &Arc<dyn PointToPoint> {
        &self.shared.p2p
    }

    /// Requests created on this context that have not been dropped yet.
    pub fn outstanding_requests(&self) -> usize {
        Arc::strong_count(&self.shared) - 1
    }

    /// Tear down team, context and library. When requests are still alive
    /// the teardown runs once the last of them is dropped, and its errors
    /// are only logged.
    pub fn close(self) -> Result<()> {
        match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => shared.teardown(),
            Err(shared) => {
                tracing::debug!(
                    rank = shared.rank,
                    outstanding = Arc::strong_count(&shared) - 1,
                    "context close deferred until outstanding requests are dropped"
                );
                Ok(())
            }
        }
    }
}

/// A context whose team creation is still in flight.
///
/// Dropping it before completion tears down everything created so far.
pub struct TeamInit<L: CollectiveLibrary> {
    library: Option<L>,
    partial: PartialContext<L>,
    p2p: Arc<dyn PointToPoint>,
    runtime: Arc<dyn DeviceRuntime>,
    policy: CollPolicy,
    done: bool,
    failed: bool,
}

impl<L: CollectiveLibrary> TeamInit<L> {
    /// Test team creation once without blocking.
    pub fn test(&mut self) -> Result<Progress> {
        if self.done {
            return Ok(Progress::Done);
        }
        let (Some(library), Some(team), false) =
            (self.library.as_ref(), self.partial.team.as_mut(), self.failed)
        else {
            return Err(XcollError::TransportInit {
                stage: "team create",
                reason: "initialization already failed".into(),
            });
        };
        match library.team_create_test(team) {
            Ok(Progress::Done) => {
                self.done = true;
                Ok(Progress::Done)
            }
            Ok(Progress::InProgress) => Ok(Progress::InProgress),
            Err(e) => {
                self.failed = true;
                tracing::warn!(rank = self.p2p.rank(), error = %e, "team creation failed");
                let _ = self.partial.unwind(library);
                Err(XcollError::init("team create", e))
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Finish a completed initialization.
    pub fn into_context(mut self) -> Result<TeamContext<L>> {
        if !self.done {
            return Err(XcollError::InvalidArgument(
                "team creation has not completed".into(),
            ));
        }
        let library = self.library.take().ok_or_else(|| {
            XcollError::InvalidArgument("initialization already consumed".into())
        })?;
        let handles = std::mem::replace(&mut self.partial, PartialContext::new());
        let rank = self.p2p.rank();
        let size = self.p2p.size();
        let policy = self.policy.clone();
        if rank == 0 {
            policy.log_report(size);
        }
        let sync = DeviceSync::new(Arc::clone(&self.runtime), policy.high_priority_stream);
        Ok(TeamContext {
            shared: Arc::new(ContextShared {
                library,
                handles,
                p2p: Arc::clone(&self.p2p),
                rank,
                size,
                policy,
                sync,
            }),
        })
    }
}

impl<L: CollectiveLibrary> Drop for TeamInit<L> {
    fn drop(&mut self) {
        if let Some(library) = self.library.as_ref()
            && !self.partial.is_empty()
        {
            tracing::debug!(rank = self.p2p.rank(), "unwinding unfinished context");
            let _ = self.partial.unwind(library);
        }
    }
}
