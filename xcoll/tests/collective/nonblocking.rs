use xcoll::{
    CollPolicy, CollRequest, CollectiveOps, DataType, Device, ReduceOp, RequestStatus, Tensor,
};

use super::helpers::{MAX_POLLS, cluster, cluster_with, drive_ok};

fn status_rank(s: RequestStatus) -> u8 {
    match s {
        RequestStatus::InProgress => 0,
        RequestStatus::Completed | RequestStatus::Failed => 1,
    }
}

#[test]
fn status_only_moves_forward() {
    let c = cluster(3);
    let tensors: Vec<Tensor> = (0..3)
        .map(|r| Tensor::from_slice(Device::Host, &[r as i32; 16]))
        .collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Sum).unwrap())
        .collect();
    let mut seen: Vec<RequestStatus> = reqs.iter().map(CollRequest::test).collect();
    for _ in 0..MAX_POLLS {
        for (r, last) in reqs.iter_mut().zip(seen.iter_mut()) {
            r.progress().unwrap();
            let now = r.test();
            assert!(status_rank(now) >= status_rank(*last));
            if last.is_terminal() {
                assert_eq!(now, *last);
            }
            *last = now;
        }
        if seen.iter().all(|s| s.is_terminal()) {
            break;
        }
    }
    assert!(seen.iter().all(|s| *s == RequestStatus::Completed));
    // Progressing a finished request is a no-op.
    for r in &mut reqs {
        r.progress().unwrap();
        assert_eq!(r.test(), RequestStatus::Completed);
    }
    assert_eq!(tensors[0].to_vec::<i32>().unwrap(), vec![3; 16]);
}

#[test]
fn many_outstanding_requests_complete_in_any_poll_order() {
    let c = cluster(2);
    let tensors: Vec<Vec<Tensor>> = (0..2)
        .map(|_| {
            (0..8)
                .map(|i| Tensor::from_slice(Device::Host, &[i as u64]))
                .collect()
        })
        .collect();
    let mut reqs: Vec<_> = Vec::new();
    for i in 0..8 {
        for (rank, ctx) in c.ctxs.iter().enumerate() {
            reqs.push(
                ctx.allreduce(std::slice::from_ref(&tensors[rank][i]), ReduceOp::Sum)
                    .unwrap(),
            );
        }
    }
    assert_eq!(c.ctxs[0].outstanding_requests(), 8);
    reqs.reverse();
    drive_ok(&mut reqs);
    for per_rank in &tensors {
        for (i, t) in per_rank.iter().enumerate() {
            assert_eq!(t.to_vec::<u64>().unwrap(), vec![2 * i as u64]);
        }
    }
}

#[tokio::test]
async fn wait_resolves_requests() {
    let c = cluster(2);
    let tensors: Vec<Tensor> = (0..2)
        .map(|r| Tensor::from_slice(Device::Host, &[r as f64 + 0.5]))
        .collect();
    let reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.allreduce(std::slice::from_ref(t), ReduceOp::Max).unwrap())
        .collect();
    let statuses = futures::future::join_all(reqs.into_iter().map(|mut r| async move {
        r.wait().await.unwrap()
    }))
    .await;
    assert_eq!(statuses, vec![RequestStatus::Completed; 2]);
    assert_eq!(tensors[0].to_vec::<f64>().unwrap(), vec![1.5]);
}

#[test]
fn close_is_deferred_while_requests_live() {
    let c = cluster(2);
    let lib = c.lib.clone();
    let tensors: Vec<Tensor> = (0..2)
        .map(|_| Tensor::zeros(Device::Host, DataType::U8, 4))
        .collect();
    let mut reqs: Vec<_> = c
        .ctxs
        .iter()
        .zip(&tensors)
        .map(|(ctx, t)| ctx.broadcast(std::slice::from_ref(t), 1).unwrap())
        .collect();
    drive_ok(&mut reqs);

    c.close();
    // Both requests still hold their context.
    let live = lib.live_resources();
    assert_eq!(live.teams, 2);
    assert_eq!(live.colls, 0);

    drop(reqs.pop());
    assert_eq!(lib.live_resources().teams, 1);
    drop(reqs);
    assert!(lib.live_resources().is_empty());
}

#[test]
fn free_releases_an_unfinished_request() {
    let c = cluster(2);
    let ctx = &c.ctxs[0];
    let req = CollectiveOps::barrier(ctx).unwrap();
    assert_eq!(CollectiveOps::test(ctx, &req), RequestStatus::InProgress);
    assert_eq!(c.lib.live_resources().colls, 1);
    ctx.free(req);
    assert_eq!(c.lib.live_resources().colls, 0);
    assert_eq!(ctx.outstanding_requests(), 0);
}

#[test]
fn serialized_alltoalls_start_in_post_order() {
    let policy = CollPolicy {
        serialize: true,
        ..CollPolicy::default()
    };
    let c = cluster_with(2, policy);
    let make = |v: u8| {
        (0..2)
            .map(|_| {
                (
                    Tensor::from_slice(Device::Host, &[v, v + 1]),
                    Tensor::zeros(Device::Host, DataType::U8, 2),
                )
            })
            .collect::<Vec<_>>()
    };
    let first = make(10);
    let second = make(20);
    let (r0, r1) = (&c.ctxs[0], &c.ctxs[1]);

    // Rank 0's first alltoall waits for rank 1, so its second stays queued.
    let a0 = r0.alltoall(&first[0].0, &first[0].1).unwrap();
    let mut b0 = r0.alltoall(&second[0].0, &second[0].1).unwrap();
    assert!(!a0.handle().unwrap().is_queued());
    let h = b0.handle().unwrap();
    assert!(h.is_serialized());
    assert!(h.is_queued());
    for _ in 0..10 {
        b0.progress().unwrap();
    }
    assert_eq!(b0.test(), RequestStatus::InProgress);
    assert!(b0.handle().unwrap().is_queued());

    // Rank 1 finds rank 0's block already delivered, so nothing is held back.
    let a1 = r1.alltoall(&first[1].0, &first[1].1).unwrap();
    let b1 = r1.alltoall(&second[1].0, &second[1].1).unwrap();
    assert!(!b1.handle().unwrap().is_queued());

    let mut a = vec![a0, a1];
    let mut b = vec![b0, b1];
    drive_ok(&mut a);
    drive_ok(&mut b);
    for (rank, (_, out)) in first.iter().enumerate() {
        let v = 10 + rank as u8;
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![v, v]);
    }
    for (rank, (_, out)) in second.iter().enumerate() {
        let v = 20 + rank as u8;
        assert_eq!(out.to_vec::<u8>().unwrap(), vec![v, v]);
    }
}
