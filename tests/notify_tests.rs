mod util;
use util::*;

use mesh_ddd::algs::communicator::NoComm;
use mesh_ddd::algs::notify::{NOTIFY_FAILURE_EXCEPTION, Notify, NotifyDesc};
use mesh_ddd::prelude::*;
use proptest::prelude::*;

fn one_round(comm: &LocalComm, degree: usize, sends: &[NotifyDesc]) -> Result<Vec<NotifyDesc>, DddError> {
    let mut n = Notify::new(degree, 1 << 16);
    n.begin(sends.len()).copy_from_slice(sends);
    let res = n.notify(comm).map(|_| n.received().to_vec());
    n.end();
    res
}

#[test]
fn single_edge_among_four() {
    let got = run_ranks(4, |comm| {
        let sends = if comm.rank() == 0 {
            vec![NotifyDesc::new(3, 64)]
        } else {
            vec![]
        };
        one_round(&comm, 2, &sends).unwrap()
    });
    assert!(got[0].is_empty());
    assert!(got[1].is_empty());
    assert!(got[2].is_empty());
    assert_eq!(got[3], vec![NotifyDesc::new(0, 64)]);
}

#[test]
fn single_process_without_edges_is_a_no_op() {
    let mut n = Notify::default();
    n.begin(0);
    assert_eq!(n.notify(&NoComm).unwrap(), 0);
    assert!(n.received().is_empty());
}

#[test]
fn all_to_all_with_wide_tree() {
    let size = 6;
    let got = run_ranks(size, |comm| {
        let me = comm.rank();
        let sends: Vec<_> = (0..size).map(|to| NotifyDesc::new(to, me * 10 + to)).collect();
        one_round(&comm, 3, &sends).unwrap()
    });
    for (me, recv) in got.iter().enumerate() {
        let want: Vec<_> = (0..size).map(|from| NotifyDesc::new(from, from * 10 + me)).collect();
        assert_eq!(recv, &want, "rank {me}");
    }
}

#[test]
fn exception_reaches_everybody() {
    let got = run_ranks(5, |comm| {
        let mut n = Notify::default();
        n.begin(1)[0] = NotifyDesc::new((comm.rank() + 1) % 5, 8);
        if comm.rank() == 3 {
            n.raise(7);
        }
        n.notify(&comm)
    });
    for r in got {
        assert_eq!(r, Err(DddError::NotifyAborted { code: 7 }));
    }
}

#[test]
fn highest_exception_wins() {
    let got = run_ranks(7, |comm| {
        let mut n = Notify::default();
        n.begin(0);
        match comm.rank() {
            1 => n.raise(3),
            6 => n.raise(9),
            _ => {}
        }
        n.notify(&comm)
    });
    assert!(got.iter().all(|r| *r == Err(DddError::NotifyAborted { code: 9 })));
}

#[test]
fn overflow_on_a_leaf_aborts_everybody() {
    let got = run_ranks(4, |comm| {
        let me = comm.rank();
        let capacity = if me == 1 { 1 } else { 1 << 16 };
        let mut n = Notify::new(2, capacity);
        n.begin(1)[0] = NotifyDesc::new((me + 1) % 4, 8);
        let first = n.notify(&comm);
        n.end();
        // the channels stay matched for the next round
        let second = one_round(&comm, 2, &[NotifyDesc::new((me + 1) % 4, 16)]);
        (first, second)
    });
    for (me, (first, second)) in got.into_iter().enumerate() {
        if me == 1 {
            assert_eq!(first, Err(DddError::NotifyOverflow { needed: 2, capacity: 1 }));
        } else {
            assert_eq!(
                first,
                Err(DddError::NotifyAborted { code: NOTIFY_FAILURE_EXCEPTION })
            );
        }
        assert_eq!(second.unwrap(), vec![NotifyDesc::new((me + 3) % 4, 16)]);
    }
}

#[test]
fn overflow_while_merging_at_the_root() {
    let got = run_ranks(5, |comm| {
        let me = comm.rank();
        let capacity = if me == 0 { 4 } else { 1 << 16 };
        let mut n = Notify::new(2, capacity);
        n.begin(1)[0] = NotifyDesc::new((me + 1) % 5, 8);
        n.notify(&comm)
    });
    assert!(matches!(got[0], Err(DddError::NotifyOverflow { capacity: 4, .. })));
    for r in &got[1..] {
        assert_eq!(*r, Err(DddError::NotifyAborted { code: NOTIFY_FAILURE_EXCEPTION }));
    }
}

#[test]
fn bad_destination_aborts_everybody() {
    let got = run_ranks(5, |comm| {
        let me = comm.rank();
        let to = if me == 4 { 9 } else { (me + 1) % 5 };
        one_round(&comm, 2, &[NotifyDesc::new(to, 8)])
    });
    assert_eq!(got[4], Err(DddError::InvalidRank { rank: 9, size: 5 }));
    for r in &got[..4] {
        assert_eq!(*r, Err(DddError::NotifyAborted { code: NOTIFY_FAILURE_EXCEPTION }));
    }
}

#[test]
fn rounds_can_follow_each_other() {
    let got = run_ranks(3, |comm| {
        let me = comm.rank();
        let first = one_round(&comm, 2, &[NotifyDesc::new((me + 1) % 3, 1)]).unwrap();
        let second = one_round(&comm, 2, &[NotifyDesc::new((me + 2) % 3, 2)]).unwrap();
        (first, second)
    });
    for (me, (first, second)) in got.into_iter().enumerate() {
        assert_eq!(first, vec![NotifyDesc::new((me + 2) % 3, 1)]);
        assert_eq!(second, vec![NotifyDesc::new((me + 1) % 3, 2)]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Edge (i -> j, s) is declared by i iff j discovers (i, s).
    #[test]
    fn discovery_is_symmetric(
        n in 1usize..7,
        degree in 1usize..4,
        raw in proptest::collection::vec((0usize..16, 0usize..16, 1usize..512), 0..24),
    ) {
        let mut edges: Vec<(usize, usize, usize)> =
            raw.into_iter().map(|(f, t, s)| (f % n, t % n, s)).collect();
        edges.sort_by_key(|&(f, t, _)| (f, t));
        edges.dedup_by_key(|e| (e.0, e.1));

        let got = run_ranks(n, |comm| {
            let me = comm.rank();
            let sends: Vec<_> = edges
                .iter()
                .filter(|e| e.0 == me)
                .map(|&(_, t, s)| NotifyDesc::new(t, s))
                .collect();
            one_round(&comm, degree, &sends).unwrap()
        });

        for (j, recv) in got.iter().enumerate() {
            let want: Vec<(usize, usize)> = edges
                .iter()
                .filter(|e| e.1 == j)
                .map(|&(f, _, s)| (f, s))
                .collect();
            let have: Vec<(usize, usize)> = recv.iter().map(|d| (d.proc, d.size)).collect();
            assert_permutation(&have, &want);
        }
    }
}
