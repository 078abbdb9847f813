use std::sync::Arc;

use xcoll::{
    CollPolicy, CollRequest, DeviceRuntime, LocalMesh, PointToPoint, RequestStatus, SimDevice,
    SoftLibrary, TeamContext, TeamInit,
};

/// Polls before a test gives up on a request.
pub const MAX_POLLS: usize = 100_000;

/// N ranks in one process, each with its own simulated device runtime.
pub struct Cluster {
    pub lib: SoftLibrary,
    pub mesh: Vec<Arc<LocalMesh>>,
    pub devices: Vec<Arc<SimDevice>>,
    pub ctxs: Vec<TeamContext<SoftLibrary>>,
}

impl Cluster {
    pub fn close(self) -> SoftLibrary {
        for ctx in self.ctxs {
            ctx.close().unwrap();
        }
        self.lib
    }
}

pub fn cluster(n: u32) -> Cluster {
    cluster_with(n, CollPolicy::default())
}

/// Bring up `n` contexts from one thread by polling every rank's team
/// creation round-robin.
pub fn cluster_with(n: u32, policy: CollPolicy) -> Cluster {
    let lib = SoftLibrary::new();
    let mesh = LocalMesh::create(n);
    let devices: Vec<Arc<SimDevice>> = (0..n).map(|_| Arc::new(SimDevice::new(2))).collect();
    let mut inits: Vec<TeamInit<SoftLibrary>> = mesh
        .iter()
        .zip(&devices)
        .map(|(m, d)| {
            TeamContext::init_nb(
                lib.clone(),
                Arc::clone(m) as Arc<dyn PointToPoint>,
                Arc::clone(d) as Arc<dyn DeviceRuntime>,
                policy.clone(),
            )
            .unwrap()
        })
        .collect();
    for _ in 0..MAX_POLLS {
        if inits.iter().all(TeamInit::is_done) {
            break;
        }
        for init in &mut inits {
            init.test().unwrap();
        }
    }
    let ctxs = inits
        .into_iter()
        .map(|i| i.into_context().unwrap())
        .collect();
    Cluster {
        lib,
        mesh,
        devices,
        ctxs,
    }
}

/// Progress every request round-robin until all are terminal.
pub fn drive(reqs: &mut [CollRequest<SoftLibrary>]) {
    for _ in 0..MAX_POLLS {
        if reqs.iter().all(|r| r.test().is_terminal()) {
            return;
        }
        for r in reqs.iter_mut() {
            r.progress().unwrap();
        }
    }
    panic!("requests did not complete within {MAX_POLLS} polls");
}

/// Drive to completion and assert every request completed.
pub fn drive_ok(reqs: &mut [CollRequest<SoftLibrary>]) {
    drive(reqs);
    for (rank, r) in reqs.iter().enumerate() {
        assert_eq!(r.test(), RequestStatus::Completed, "rank {rank}");
    }
}
