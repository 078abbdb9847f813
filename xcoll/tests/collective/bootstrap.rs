use std::sync::Arc;

use xcoll::{
    EpRange, LocalMesh, OobAllgather, OobEndpoint, PointToPoint, Progress, RingDirection,
};

use super::helpers::MAX_POLLS;

fn start_all(
    mesh: &[Arc<LocalMesh>],
    direction: RingDirection,
    block: impl Fn(usize) -> Vec<u8>,
) -> Vec<OobAllgather> {
    mesh.iter()
        .enumerate()
        .map(|(r, m)| {
            OobEndpoint::with_direction(Arc::clone(m) as Arc<dyn PointToPoint>, direction)
                .allgather(&block(r), EpRange::Undefined, 0)
                .unwrap()
        })
        .collect()
}

fn run(states: &mut [OobAllgather]) {
    for _ in 0..MAX_POLLS {
        if states.iter().all(OobAllgather::is_done) {
            return;
        }
        for s in states.iter_mut() {
            s.test().unwrap();
        }
    }
    panic!("bootstrap allgather did not finish");
}

#[test]
fn allgather_matches_rank_order_for_any_size() {
    for direction in [RingDirection::Forward, RingDirection::Reverse] {
        for n in 1..=5u32 {
            let mesh = LocalMesh::create(n);
            let block = |r: usize| vec![r as u8, 0xA0 | r as u8, 7];
            let mut states = start_all(&mesh, direction, block);
            run(&mut states);
            let expected: Vec<u8> = (0..n as usize).flat_map(block).collect();
            for (rank, s) in states.iter().enumerate() {
                assert_eq!(s.output(), expected, "n={n} rank={rank} {direction:?}");
                assert_eq!(s.iteration(), n - 1);
            }
            for m in &mesh {
                assert_eq!(m.pending_messages().unwrap(), 0);
            }
        }
    }
}

#[test]
fn four_ranks_eight_byte_blocks() {
    let mesh = LocalMesh::create(4);
    let blocks: Vec<[u8; 8]> = vec![*b"AAAAAAAA", *b"BBBBBBBB", *b"CCCCCCCC", *b"DDDDDDDD"];
    let mut states = start_all(&mesh, RingDirection::Forward, |r| blocks[r].to_vec());
    run(&mut states);
    for s in states {
        assert_eq!(
            s.into_output(),
            b"AAAAAAAABBBBBBBBCCCCCCCCDDDDDDDD".to_vec()
        );
    }
}

#[test]
fn repeated_polls_issue_no_duplicate_operations() {
    let mesh = LocalMesh::create(3);
    let ep0 = OobEndpoint::new(Arc::clone(&mesh[0]) as Arc<dyn PointToPoint>);
    let mut s0 = ep0.allgather(&[0; 4], EpRange::Undefined, 0).unwrap();
    let posted = mesh[0].stats();
    assert_eq!(posted.sends_posted, 1);
    assert_eq!(posted.recvs_posted, 1);

    let mut last_iter = s0.iteration();
    for _ in 0..50 {
        assert_eq!(s0.test().unwrap(), Progress::InProgress);
        assert!(s0.iteration() >= last_iter);
        last_iter = s0.iteration();
    }
    assert_eq!(mesh[0].stats(), posted);
    assert_eq!(s0.iteration(), 1);

    let mut rest: Vec<OobAllgather> = mesh[1..]
        .iter()
        .enumerate()
        .map(|(i, m)| {
            OobEndpoint::new(Arc::clone(m) as Arc<dyn PointToPoint>)
                .allgather(&[i as u8 + 1; 4], EpRange::Undefined, 0)
                .unwrap()
        })
        .collect();
    let mut iters = vec![s0.iteration()];
    for _ in 0..MAX_POLLS {
        if s0.is_done() && rest.iter().all(OobAllgather::is_done) {
            break;
        }
        s0.test().unwrap();
        assert!(s0.iteration() >= *iters.last().unwrap());
        iters.push(s0.iteration());
        for s in &mut rest {
            s.test().unwrap();
        }
    }
    assert!(s0.is_done());
    assert_eq!(mesh[0].stats().sends_posted, 2);
    assert_eq!(s0.test().unwrap(), Progress::Done);
    assert_eq!(mesh[0].stats().sends_posted, 2);
}

#[test]
fn ranks_on_threads_rendezvous() {
    let mesh = LocalMesh::create(4);
    let outputs: Vec<Vec<u8>> = std::thread::scope(|s| {
        let handles: Vec<_> = mesh
            .iter()
            .enumerate()
            .map(|(r, m)| {
                let ep = OobEndpoint::new(Arc::clone(m) as Arc<dyn PointToPoint>);
                s.spawn(move || {
                    let mut st = ep.allgather(&[r as u8; 2], EpRange::Undefined, 0).unwrap();
                    while st.test().unwrap() == Progress::InProgress {
                        std::thread::yield_now();
                    }
                    st.into_output()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for out in outputs {
        assert_eq!(out, vec![0, 0, 1, 1, 2, 2, 3, 3]);
    }
}

#[test]
fn strided_subgroup_uses_range_positions() {
    let mesh = LocalMesh::create(4);
    let range = EpRange::strided(1, 2, 2);
    let mut states: Vec<OobAllgather> = [1usize, 3]
        .iter()
        .enumerate()
        .map(|(pos, &rank)| {
            OobEndpoint::new(Arc::clone(&mesh[rank]) as Arc<dyn PointToPoint>)
                .allgather(&[rank as u8], range.clone(), pos as u32)
                .unwrap()
        })
        .collect();
    run(&mut states);
    for s in &states {
        assert_eq!(s.output(), &[1, 3]);
    }
    assert_eq!(mesh[0].stats().sends_posted, 0);
}
