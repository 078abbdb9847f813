use xcoll::{DataType, Device, ReduceOp, RequestStatus, Tensor, XcollError};

use super::helpers::{cluster, drive_ok};

#[test]
fn allreduce_sum_and_max() {
    let c = cluster(4);
    let sums: Vec<Tensor> = (0..4)
        .map(|r| Tensor::from_slice(Device::Host, &[r as f32, 1.0, -(r as f32)]))
        .collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&sums)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Sum).unwrap())
        .collect();
    drive_ok(&mut reqs);
    for t in &sums {
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![6.0, 4.0, -6.0]);
    }

    let maxes: Vec<Tensor> = (0..4)
        .map(|r| Tensor::from_slice(Device::Host, &[r as i64 * 3 % 5, -(r as i64)]))
        .collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&maxes)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Max).unwrap())
        .collect();
    drive_ok(&mut reqs);
    for t in &maxes {
        assert_eq!(t.to_vec::<i64>().unwrap(), vec![4, 0]);
    }
}

#[test]
fn request_is_in_progress_until_driven() {
    let c = cluster(2);
    let tensors: Vec<Tensor> = (0..2)
        .map(|_| Tensor::from_slice(Device::Host, &[1u32, 2]))
        .collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Sum).unwrap())
        .collect();
    for r in &reqs {
        assert_eq!(r.test(), RequestStatus::InProgress);
        assert!(r.handle().is_some());
    }
    // Nothing is reduced until the request is progressed.
    assert_eq!(tensors[0].to_vec::<u32>().unwrap(), vec![1, 2]);
    drive_ok(&mut reqs);
    assert_eq!(tensors[1].to_vec::<u32>().unwrap(), vec![2, 4]);
}

#[test]
fn allreduce_rejects_half_precision() {
    let c = cluster(2);
    let t = Tensor::zeros(Device::Host, DataType::F16, 8);
    assert!(matches!(
        c.ctxs[0].allreduce(&[t], ReduceOp::Sum),
        Err(XcollError::UnsupportedDType {
            dtype: DataType::F16,
            ..
        })
    ));
    assert_eq!(c.lib.live_resources().colls, 0);
}

#[test]
fn allreduce_takes_exactly_one_tensor() {
    let c = cluster(2);
    let a = Tensor::zeros(Device::Host, DataType::F32, 2);
    let b = Tensor::zeros(Device::Host, DataType::F32, 2);
    assert!(matches!(
        c.ctxs[0].allreduce(&[a, b], ReduceOp::Sum),
        Err(XcollError::InvalidArgument(_))
    ));
    assert!(matches!(
        c.ctxs[0].allreduce(&[], ReduceOp::Sum),
        Err(XcollError::InvalidArgument(_))
    ));
}

#[test]
fn single_rank_allreduce_is_identity() {
    let c = cluster(1);
    let t = Tensor::from_slice(Device::Host, &[3.5f64, -1.0]);
    let mut reqs = vec![c.ctxs[0].allreduce(std::slice::from_ref(&t), ReduceOp::Prod).unwrap()];
    drive_ok(&mut reqs);
    assert_eq!(t.to_vec::<f64>().unwrap(), vec![3.5, -1.0]);
}
