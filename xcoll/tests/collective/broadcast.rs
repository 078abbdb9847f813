use xcoll::{Device, DeviceRuntime, StreamOp, Tensor, XcollError};

use super::helpers::{cluster, drive_ok};

#[test]
fn broadcast_from_every_root() {
    let n = 4u32;
    let c = cluster(n);
    for root in 0..n {
        let tensors: Vec<Tensor> = (0..n)
            .map(|r| Tensor::from_slice(Device::Host, &[r as u64 + 100, r as u64]))
            .collect();
        let mut reqs: Vec<_> = c
            .ctxs
            .iter()
            .zip(&tensors)
            .map(|(ctx, t)| ctx.broadcast(std::slice::from_ref(t), root).unwrap())
            .collect();
        drive_ok(&mut reqs);
        for t in &tensors {
            assert_eq!(t.to_vec::<u64>().unwrap(), vec![root as u64 + 100, root as u64]);
        }
    }
}

#[test]
fn device_broadcast_is_ordered_after_prior_compute() {
    let c = cluster(2);
    let dev = Device::Cuda(0);
    let tensors: Vec<Tensor> = (0..2)
        .map(|r| Tensor::from_slice(dev, &[r as f32; 3]))
        .collect();

    let compute: Vec<_> = c
        .devices
        .iter()
        .map(|sim| sim.current_stream(0).unwrap())
        .collect();
    let kernels: Vec<usize> = c
        .devices
        .iter()
        .zip(&compute)
        .map(|(sim, s)| sim.launch(*s, "producer").unwrap())
        .collect();

    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.broadcast(std::slice::from_ref(t), 0).unwrap())
        .collect();

    for (rank, ctx) in c.ctxs.iter().enumerate() {
        let sim = &c.devices[rank];
        let comm = ctx.device_sync().comm_stream().unwrap().unwrap();
        let ops = sim.ops(comm).unwrap();
        // The comm stream waits first, then marks where the broadcast ends.
        assert!(matches!(ops[0], StreamOp::Wait { after: Some(_), .. }));
        assert!(matches!(ops[1], StreamOp::Record(_)));
        assert!(
            sim.precedes((compute[rank], kernels[rank]), (comm, 1))
                .unwrap()
        );
        // A kernel launched after the post is not ordered before it.
        let late = sim.launch(compute[rank], "late").unwrap();
        assert!(!sim.precedes((compute[rank], late), (comm, 1)).unwrap());
    }

    drive_ok(&mut reqs);
    for t in &tensors {
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![0.0; 3]);
    }
}

#[test]
fn broadcast_rejects_out_of_range_root() {
    let c = cluster(3);
    let t = Tensor::from_slice(Device::Host, &[1u8]);
    assert!(matches!(
        c.ctxs[1].broadcast(&[t], 3),
        Err(XcollError::InvalidRank { rank: 3, size: 3 })
    ));
    assert_eq!(c.lib.live_resources().colls, 0);
}
