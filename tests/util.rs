#![allow(dead_code)]
use mesh_ddd::algs::communicator::LocalComm;
use mesh_ddd::{DddContext, config::DddConfig};

/// Run `f` on every rank of a fresh `n`-rank world, one thread per rank.
/// Results come back in rank order.
pub fn run_ranks<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalComm) -> T + Sync,
{
    let comms = LocalComm::world(n);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Like [`run_ranks`], but hands each rank a ready context built from `cfg`.
pub fn run_contexts<T, F>(n: usize, cfg: DddConfig, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(&mut DddContext<LocalComm>) -> T + Sync,
{
    run_ranks(n, |comm| {
        let mut ctx = DddContext::new(comm, cfg.clone()).expect("context");
        f(&mut ctx)
    })
}

/// Assert vec is a permutation of another vec (order-agnostic).
pub fn assert_permutation<T: Ord + Copy + std::fmt::Debug>(got: &[T], want: &[T]) {
    let mut a = got.to_vec();
    a.sort_unstable();
    let mut b = want.to_vec();
    b.sort_unstable();
    assert_eq!(a, b, "not a permutation\n got={:?}\nwant={:?}", got, want);
}
