use xcoll::{DataType, Device, RequestStatus, Tensor, XcollError};

use super::helpers::{cluster, drive_ok};

fn outputs(n: u32, device: Device, numel: usize) -> Vec<Tensor> {
    (0..n)
        .map(|_| Tensor::zeros(device, DataType::I32, numel))
        .collect()
}

#[test]
fn host_allgather_fills_outputs_in_rank_order() {
    for n in [1u32, 2, 3, 5] {
        let c = cluster(n);
        let inputs: Vec<Tensor> = (0..n)
            .map(|r| Tensor::from_slice(Device::Host, &[r as i32 * 10, r as i32 * 10 + 1]))
            .collect();
        let outs: Vec<Vec<Tensor>> = (0..n).map(|_| outputs(n, Device::Host, 2)).collect();
        let mut reqs: Vec<_> = c
            .ctxs
            .iter()
            .enumerate()
            .map(|(r, ctx)| ctx.allgather(&inputs[r], &outs[r]).unwrap())
            .collect();
        for (r, req) in reqs.iter().enumerate() {
            assert!(req.inputs()[0].shares_storage(&inputs[r]));
            assert_eq!(req.outputs().len(), n as usize);
        }
        drive_ok(&mut reqs);
        for per_rank in &outs {
            for (src, t) in per_rank.iter().enumerate() {
                let s = src as i32 * 10;
                assert_eq!(t.to_vec::<i32>().unwrap(), vec![s, s + 1], "n={n}");
            }
        }
        drop(reqs);
        assert!(c.close().live_resources().is_empty());
    }
}

#[test]
fn device_allgather_completes_and_holds_event() {
    let c = cluster(3);
    let dev = Device::Cuda(1);
    let inputs: Vec<Tensor> = (0..3)
        .map(|r| Tensor::from_slice(dev, &[r as i32; 4]))
        .collect();
    let outs: Vec<Vec<Tensor>> = (0..3).map(|_| outputs(3, dev, 4)).collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .enumerate()
        .map(|(r, ctx)| ctx.allgather(&inputs[r], &outs[r]).unwrap())
        .collect();
    for r in &reqs {
        assert_eq!(r.device(), dev);
        assert!(r.event_id().is_some());
        assert_eq!(r.outputs().len(), 3);
    }
    drive_ok(&mut reqs);
    for per_rank in &outs {
        for (src, t) in per_rank.iter().enumerate() {
            assert_eq!(t.to_vec::<i32>().unwrap(), vec![src as i32; 4]);
        }
    }
    for (ctx, sim) in c.ctxs.iter().zip(&c.devices) {
        let (ordinal, _) = ctx.device_sync().comm_binding().unwrap().unwrap();
        assert_eq!(ordinal, 1);
        assert_eq!(sim.streams_created().unwrap(), 1);
    }
}

#[test]
fn allgather_rejects_bad_outputs() {
    let c = cluster(2);
    let ctx = &c.ctxs[0];
    let input = Tensor::zeros(Device::Host, DataType::I32, 2);

    let too_few = outputs(1, Device::Host, 2);
    assert!(matches!(
        ctx.allgather(&input, &too_few),
        Err(XcollError::InvalidArgument(_))
    ));

    let short = outputs(2, Device::Host, 1);
    assert!(matches!(
        ctx.allgather(&input, &short),
        Err(XcollError::BufferSizeMismatch {
            expected: 8,
            actual: 4
        })
    ));

    let mixed = vec![
        Tensor::zeros(Device::Host, DataType::I32, 2),
        Tensor::zeros(Device::Cuda(0), DataType::I32, 2),
    ];
    assert!(matches!(
        ctx.allgather(&input, &mixed),
        Err(XcollError::DeviceMismatch { .. })
    ));
    assert_eq!(c.lib.live_resources().colls, 0);
    assert_eq!(ctx.outstanding_requests(), 0);
}

#[test]
fn completed_request_releases_library_handle() {
    let c = cluster(2);
    let inputs: Vec<Tensor> = (0..2)
        .map(|r| Tensor::from_slice(Device::Host, &[r as i32]))
        .collect();
    let outs: Vec<Vec<Tensor>> = (0..2).map(|_| outputs(2, Device::Host, 1)).collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .enumerate()
        .map(|(r, ctx)| ctx.allgather(&inputs[r], &outs[r]).unwrap())
        .collect();
    assert_eq!(c.lib.live_resources().colls, 2);
    drive_ok(&mut reqs);
    assert_eq!(c.lib.live_resources().colls, 0);
    assert!(reqs.iter().all(|r| r.handle().is_none()));
    assert_eq!(reqs[0].test(), RequestStatus::Completed);
}
