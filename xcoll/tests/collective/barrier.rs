use xcoll::{CollPolicy, Device, ReduceOp, RequestStatus, Tensor, XcollError};

use super::helpers::{cluster, cluster_with, drive_ok};

#[test]
fn host_barrier_needs_every_rank() {
    let c = cluster(3);
    let mut early: Vec<_> = c.ctxs[..2].iter().map(|ctx| ctx.barrier().unwrap()).collect();
    for _ in 0..100 {
        for r in &mut early {
            r.progress().unwrap();
        }
    }
    assert!(early.iter().all(|r| r.test() == RequestStatus::InProgress));

    early.push(c.ctxs[2].barrier().unwrap());
    drive_ok(&mut early);
    assert!(early.iter().all(|r| r.device() == Device::Host));
    assert!(early.iter().all(|r| r.event_id().is_none()));
}

#[test]
fn device_barrier_without_stream_is_a_configuration_error() {
    let policy = CollPolicy {
        gpu_barrier: true,
        ..CollPolicy::default()
    };
    let c = cluster_with(2, policy);
    assert!(matches!(
        c.ctxs[0].barrier(),
        Err(XcollError::Configuration(_))
    ));
}

#[test]
fn device_barrier_runs_on_bound_stream() {
    let policy = CollPolicy {
        gpu_barrier: true,
        ..CollPolicy::default()
    };
    let c = cluster_with(2, policy);
    let dev = Device::Cuda(1);
    let tensors: Vec<Tensor> = (0..2).map(|_| Tensor::from_slice(dev, &[1i32])).collect();
    let mut warmup: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Sum).unwrap())
        .collect();
    drive_ok(&mut warmup);

    let mut reqs: Vec<_> = c.ctxs.iter().map(|ctx| ctx.barrier().unwrap()).collect();
    for r in &reqs {
        assert_eq!(r.device(), dev);
        assert!(r.event_id().is_some());
    }
    drive_ok(&mut reqs);
}
