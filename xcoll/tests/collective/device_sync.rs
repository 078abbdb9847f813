use xcoll::{
    CollPolicy, CollRequest, CollectiveType, Device, DeviceRuntime, ReduceOp, RequestStatus,
    SoftLibrary, StreamOp, StreamPriority, Tensor, XcollError,
};

use super::helpers::{Cluster, cluster, cluster_with, drive_ok};

fn post_allreduce(c: &Cluster, dev: Device) -> Vec<CollRequest<SoftLibrary>> {
    c.ctxs
        .iter()
        .map(|ctx| {
            let t = Tensor::from_slice(dev, &[1.0f32, 2.0]);
            ctx.allreduce(&[t], ReduceOp::Sum).unwrap()
        })
        .collect()
}

#[test]
fn events_are_reused_after_requests_drop() {
    let c = cluster(2);
    let dev = Device::Cuda(0);

    let mut first = post_allreduce(&c, dev);
    let mut second = post_allreduce(&c, dev);
    drive_ok(&mut first);
    drive_ok(&mut second);
    for ctx in &c.ctxs {
        let pool = ctx.device_sync().pool();
        assert_eq!(pool.created().unwrap(), 2);
        assert_eq!(pool.available().unwrap(), 0);
    }
    drop(first);
    drop(second);

    for _ in 0..5 {
        let mut reqs = post_allreduce(&c, dev);
        drive_ok(&mut reqs);
    }
    for (ctx, sim) in c.ctxs.iter().zip(&c.devices) {
        let pool = ctx.device_sync().pool();
        assert_eq!(pool.created().unwrap(), 2);
        assert_eq!(pool.available().unwrap(), 2);
        assert_eq!(sim.events_created().unwrap(), 2);
    }

    let devices = c.devices.clone();
    c.close();
    for sim in devices {
        assert_eq!(sim.live_events().unwrap(), 0);
    }
}

#[test]
fn host_collectives_touch_no_device_state() {
    let c = cluster(2);
    let mut reqs = post_allreduce(&c, Device::Host);
    drive_ok(&mut reqs);
    for (ctx, sim) in c.ctxs.iter().zip(&c.devices) {
        assert_eq!(ctx.device_sync().comm_stream().unwrap(), None);
        assert_eq!(sim.events_created().unwrap(), 0);
        assert_eq!(sim.streams_created().unwrap(), 0);
    }
}

#[test]
fn fence_makes_compute_wait_on_collective() {
    let c = cluster(2);
    let dev = Device::Cuda(0);
    let mut reqs = post_allreduce(&c, dev);

    let sim = &c.devices[0];
    let compute = sim.current_stream(0).unwrap();
    let comm = c.ctxs[0].device_sync().comm_stream().unwrap().unwrap();
    reqs[0].fence().unwrap();
    let consumer = sim.launch(compute, "consumer").unwrap();
    let ops = sim.ops(compute).unwrap();
    let event = reqs[0].event_id().unwrap();
    // The wait captures the completion record, the last op on the comm stream.
    let end = sim.ops(comm).unwrap().len() - 1;
    assert!(matches!(sim.ops(comm).unwrap()[end], StreamOp::Record(e) if e == event));
    assert_eq!(
        ops[consumer - 1],
        StreamOp::Wait {
            event,
            after: Some((comm, end))
        }
    );

    drive_ok(&mut reqs);
    let before = sim.ops(compute).unwrap().len();
    reqs[0].fence().unwrap();
    assert_eq!(sim.ops(compute).unwrap().len(), before);
}

#[test]
fn blocking_wait_skips_stream_blocking() {
    let mut policy = CollPolicy::default();
    policy.set_blocking_wait(CollectiveType::Allreduce, true);
    let c = cluster_with(2, policy);
    let mut reqs = post_allreduce(&c, Device::Cuda(0));

    for (r, (ctx, sim)) in reqs.iter().zip(c.ctxs.iter().zip(&c.devices)) {
        let comm = ctx.device_sync().comm_stream().unwrap().unwrap();
        let ops = sim.ops(comm).unwrap();
        assert_eq!(ops.len(), 1);
        assert!(matches!(ops[0], StreamOp::Wait { .. }));
        assert!(!r.handle().unwrap().blocks_stream());

        let compute = sim.current_stream(0).unwrap();
        let before = sim.ops(compute).unwrap().len();
        r.fence().unwrap();
        assert_eq!(sim.ops(compute).unwrap().len(), before);
    }
    drive_ok(&mut reqs);
}

#[test]
fn non_blocking_wait_blocks_stream() {
    let c = cluster(2);
    let reqs = post_allreduce(&c, Device::Cuda(0));
    for r in &reqs {
        assert!(r.handle().unwrap().blocks_stream());
        assert_eq!(r.test(), RequestStatus::InProgress);
    }
}

#[test]
fn second_device_is_rejected_once_bound() {
    let c = cluster(2);
    let mut reqs = post_allreduce(&c, Device::Cuda(0));
    drive_ok(&mut reqs);
    let t = Tensor::from_slice(Device::Cuda(1), &[1.0f32]);
    assert!(matches!(
        c.ctxs[0].allreduce(&[t], ReduceOp::Sum),
        Err(XcollError::DeviceMismatch {
            first: Device::Cuda(0),
            second: Device::Cuda(1)
        })
    ));
}

#[test]
fn stream_priority_follows_policy() {
    for (high, expected) in [(true, StreamPriority::High), (false, StreamPriority::Normal)] {
        let policy = CollPolicy {
            high_priority_stream: high,
            ..CollPolicy::default()
        };
        let c = cluster_with(1, policy);
        let mut reqs = post_allreduce(&c, Device::Cuda(1));
        drive_ok(&mut reqs);
        let comm = c.ctxs[0].device_sync().comm_stream().unwrap().unwrap();
        assert_eq!(c.devices[0].stream_priority(comm).unwrap(), expected);
        assert_eq!(c.devices[0].stream_device(comm).unwrap(), 1);
    }
}

#[test]
fn comm_stream_is_created_once_per_context() {
    let c = cluster(2);
    for _ in 0..3 {
        let mut reqs = post_allreduce(&c, Device::Cuda(0));
        drive_ok(&mut reqs);
    }
    for sim in &c.devices {
        assert_eq!(sim.streams_created().unwrap(), 1);
    }
}
