mod util;
use util::*;

use std::time::Duration;

use mesh_ddd::algs::communicator::NoComm;
use mesh_ddd::algs::lowcomm::frame::{WORD, header_size};
use mesh_ddd::prelude::*;

type Row = [u8; 16];

fn row(seed: u8) -> Row {
    std::array::from_fn(|i| seed.wrapping_mul(31).wrapping_add(i as u8))
}

/// Allocator that refuses exactly one request (the `fail_at`-th, counting from 0).
struct FailOnce {
    calls: usize,
    fail_at: usize,
}

impl BufferAllocator for FailOnce {
    fn allocate(&mut self, size: usize) -> Option<Vec<u8>> {
        let call = self.calls;
        self.calls += 1;
        (call != self.fail_at).then(|| vec![0u8; size])
    }

    fn release(&mut self, _buf: Vec<u8>) {}
}

#[test]
fn table_and_chunk_arrive_byte_identical() {
    let got = run_contexts(2, DddConfig::default(), |ctx| {
        let t = ctx.transport_mut().declare_type("rows+blob");
        let rows = ctx.transport_mut().add_table(t, "rows", 16).unwrap();
        let blob = ctx.transport_mut().add_chunk(t, "blob").unwrap();

        let mut send = None;
        if ctx.rank() == 0 {
            let tr = ctx.transport_mut();
            let h = tr.new_send(t, 1).unwrap();
            tr.set_table_size(h, rows, 3).unwrap();
            tr.set_chunk_size(h, blob, 5).unwrap();
            let size = tr.freeze(h).unwrap();
            assert_eq!(size, 2 * WORD + 3 * WORD * 2 + 3 * 16 + 5);
            send = Some(h);
        }
        assert_eq!(ctx.connect(t).unwrap(), ctx.rank());

        if let Some(h) = send {
            let tr = ctx.transport_mut();
            tr.allocate(h).unwrap();
            tr.write_table(h, rows, &[row(0), row(1), row(2)]).unwrap();
            tr.component_mut(h, blob).unwrap().copy_from_slice(b"hello");
            ctx.send(h).unwrap();
        }
        let recvs = ctx.communicate().unwrap();
        let out = recvs.first().map(|&h| {
            let tr = ctx.transport();
            assert_eq!(tr.peer(h).unwrap(), 0);
            assert_eq!(tr.state(h).unwrap(), MsgState::Ready);
            assert_eq!(tr.table_len(h, rows).unwrap(), 3);
            (
                tr.component(h, rows).unwrap().to_vec(),
                tr.component(h, blob).unwrap().to_vec(),
            )
        });
        ctx.cleanup();
        out
    });
    assert!(got[0].is_none());
    let (table, chunk) = got[1].clone().unwrap();
    assert_eq!(table, [row(0), row(1), row(2)].concat());
    assert_eq!(chunk, b"hello");
}

#[test]
fn shrunk_table_is_seen_shrunk() {
    let got = run_contexts(2, DddConfig::default(), |ctx| {
        let t = ctx.transport_mut().declare_type("ids");
        let ids = ctx.transport_mut().add_table(t, "ids", 8).unwrap();
        let me = ctx.rank();
        let tr = ctx.transport_mut();
        let h = tr.new_send(t, 1 - me).unwrap();
        tr.set_table_size(h, ids, 10).unwrap();
        tr.freeze(h).unwrap();
        ctx.connect(t).unwrap();

        let tr = ctx.transport_mut();
        tr.allocate(h).unwrap();
        let valid: Vec<u64> = (0..(me as u64 + 2)).collect();
        tr.write_table(h, ids, &valid).unwrap();
        tr.set_table_len(h, ids, valid.len()).unwrap();
        ctx.send(h).unwrap();

        let recvs = ctx.communicate().unwrap();
        let out = ctx.transport().read_table::<u64>(recvs[0], ids).unwrap();
        ctx.cleanup();
        out
    });
    assert_eq!(got[0], vec![0, 1, 2]);
    assert_eq!(got[1], vec![0, 1]);
}

#[test]
fn failed_allocation_reclaims_one_finished_send() {
    let got = run_ranks(3, |comm| {
        // call 0: receive buffer, call 1: first send, call 2: refused
        let alloc = if comm.rank() == 0 {
            FailOnce { calls: 0, fail_at: 2 }
        } else {
            FailOnce { calls: 0, fail_at: usize::MAX }
        };
        let mut tr: Transport<LocalComm> = Transport::with_allocator(Box::new(alloc));
        let mut notify = Notify::default();
        let t = tr.declare_type("blob");
        let c = tr.add_chunk(t, "bytes").unwrap();

        let mut hs = Vec::new();
        if comm.rank() == 0 {
            for dest in [1, 2] {
                let h = tr.new_send(t, dest).unwrap();
                tr.set_chunk_size(h, c, 32).unwrap();
                tr.freeze(h).unwrap();
                hs.push(h);
            }
        }
        tr.connect(&comm, &mut notify, t).unwrap();
        for h in hs {
            tr.allocate(h).unwrap();
            tr.component_mut(h, c).unwrap().fill(comm.rank() as u8 + 7);
            tr.send(&comm, h).unwrap();
        }
        let recvs = tr.communicate().unwrap();
        let payload = recvs.first().map(|&h| tr.component(h, c).unwrap().to_vec());
        let stats = tr.stats();
        tr.cleanup();
        (stats, payload)
    });

    let (stats0, _) = &got[0];
    assert_eq!(stats0.alloc_failures, 1);
    assert_eq!(stats0.reclaimed_sends, 1);
    assert_eq!(stats0.messages_sent, 2);
    for (stats, payload) in &got[1..] {
        assert_eq!(stats.alloc_failures, 0);
        assert_eq!(payload.as_deref(), Some(&[7u8; 32][..]));
    }
}

#[test]
fn allocation_fails_when_nothing_can_be_reclaimed() {
    let cfg = DddConfig::default().with_send_memory_limit(64);
    let mut ctx = DddContext::new(NoComm, cfg).unwrap();
    let tr = ctx.transport_mut();
    let t = tr.declare_type("big");
    let c = tr.add_chunk(t, "bytes").unwrap();
    let h = tr.new_send(t, 0).unwrap();
    tr.set_chunk_size(h, c, 4096).unwrap();
    let size = tr.freeze(h).unwrap();
    assert_eq!(
        tr.prepare_send(h),
        Err(DddError::OutOfMemory { requested: size })
    );
}

#[test]
fn header_mismatch_is_fatal() {
    let got = run_ranks(2, |comm| {
        let mut tr: Transport<LocalComm> = Transport::new();
        let mut notify = Notify::default();
        let t = tr.declare_type("skewed");
        // The ranks disagree on the shape of the type.
        let c = tr.add_chunk(t, "a").unwrap();
        if comm.rank() == 0 {
            tr.add_chunk(t, "b").unwrap();
            let h = tr.new_send(t, 1).unwrap();
            tr.set_chunk_size(h, c, 4).unwrap();
            tr.freeze(h).unwrap();
            tr.connect(&comm, &mut notify, t).unwrap();
            tr.prepare_send(h).unwrap();
            tr.send(&comm, h).unwrap();
        } else {
            tr.connect(&comm, &mut notify, t).unwrap();
        }
        let res = tr.communicate().map(|r| r.len());
        tr.cleanup();
        res
    });
    assert_eq!(got[0], Ok(0));
    let err = got[1].clone().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        DddError::HeaderMismatch { peer: 0, components: 2, .. }
    ));
}

#[test]
fn size_formula_matches_header_helper() {
    let mut tr: Transport<NoComm> = Transport::new();
    let t = tr.declare_type("three");
    let a = tr.add_table(t, "a", 12).unwrap();
    tr.add_chunk(t, "b").unwrap();
    let c = tr.add_table(t, "c", 1).unwrap();
    let h = tr.new_send(t, 0).unwrap();
    tr.set_table_size(h, a, 2).unwrap();
    tr.set_table_size(h, c, 7).unwrap();
    assert_eq!(tr.freeze(h).unwrap(), header_size(3) + 24 + 7);
}

#[test]
fn connect_rejects_local_misuse() {
    let mut tr: Transport<NoComm> = Transport::new();
    let mut notify = Notify::default();
    let t = tr.declare_type("x");
    let u = tr.declare_type("y");
    tr.add_chunk(t, "c").unwrap();
    tr.add_chunk(u, "c").unwrap();

    let h = tr.new_send(t, 0).unwrap();
    assert!(matches!(
        tr.connect(&NoComm, &mut notify, t),
        Err(DddError::InvalidState { found: "NEW", .. })
    ));
    tr.freeze(h).unwrap();
    let h2 = tr.new_send(t, 0).unwrap();
    tr.freeze(h2).unwrap();
    assert_eq!(
        tr.connect(&NoComm, &mut notify, t),
        Err(DddError::DuplicateSend { dest: 0 })
    );
    tr.cleanup();

    let h = tr.new_send(u, 0).unwrap();
    tr.freeze(h).unwrap();
    assert!(matches!(
        tr.connect(&NoComm, &mut notify, t),
        Err(DddError::ConnectTypeMismatch { .. })
    ));
}

#[test]
fn serial_self_message_needs_a_real_backend() {
    let mut ctx = DddContext::new(NoComm, DddConfig::default()).unwrap();
    let tr = ctx.transport_mut();
    let t = tr.declare_type("self");
    let c = tr.add_chunk(t, "c").unwrap();
    let h = tr.new_send(t, 0).unwrap();
    tr.set_chunk_size(h, c, 3).unwrap();
    tr.freeze(h).unwrap();
    assert!(matches!(
        ctx.connect(t),
        Err(DddError::InvalidState { found: "no-op communicator", .. })
    ));
    assert_eq!(ctx.transport().n_sends(), 0);
    assert_eq!(ctx.transport().n_recvs(), 0);
}

#[test]
fn self_message_on_single_rank_world() {
    let got = run_contexts(1, DddConfig::default(), |ctx| {
        let t = ctx.transport_mut().declare_type("self");
        let c = ctx.transport_mut().add_chunk(t, "c").unwrap();
        let tr = ctx.transport_mut();
        let h = tr.new_send(t, 0).unwrap();
        tr.set_chunk_size(h, c, 3).unwrap();
        tr.freeze(h).unwrap();
        assert_eq!(ctx.connect(t).unwrap(), 1);
        let tr = ctx.transport_mut();
        tr.prepare_send(h).unwrap();
        tr.component_mut(h, c).unwrap().copy_from_slice(b"me!");
        ctx.send(h).unwrap();
        let recvs = ctx.communicate().unwrap();
        let data = ctx.transport().component(recvs[0], c).unwrap().to_vec();
        ctx.cleanup();
        data
    });
    assert_eq!(got[0], b"me!".to_vec());
}

#[test]
fn connect_abort_is_seen_by_all() {
    let got = run_contexts(3, DddConfig::default(), |ctx| {
        let t = ctx.transport_mut().declare_type("aborted");
        let c = ctx.transport_mut().add_chunk(t, "c").unwrap();
        let me = ctx.rank();
        if me == 1 {
            return (ctx.connect_abort(5), 0);
        }
        let tr = ctx.transport_mut();
        let h = tr.new_send(t, (me + 1) % 3).unwrap();
        tr.set_chunk_size(h, c, 8).unwrap();
        tr.freeze(h).unwrap();
        let res = ctx.connect(t);
        (res, ctx.transport().n_sends())
    });
    for (res, left) in got {
        assert_eq!(res, Err(DddError::NotifyAborted { code: 5 }));
        assert_eq!(left, 0);
    }
}

#[test]
fn cleanup_mid_round_leaves_transport_reusable() {
    let got = run_contexts(2, DddConfig::default(), |ctx| {
        let t = ctx.transport_mut().declare_type("twice");
        let c = ctx.transport_mut().add_chunk(t, "c").unwrap();
        let me = ctx.rank();
        let mut last = None;
        for round in 0..2u8 {
            let tr = ctx.transport_mut();
            let h = tr.new_send(t, 1 - me).unwrap();
            tr.set_chunk_size(h, c, 1).unwrap();
            tr.freeze(h).unwrap();
            ctx.connect(t).unwrap();
            let tr = ctx.transport_mut();
            tr.prepare_send(h).unwrap();
            tr.component_mut(h, c).unwrap()[0] = round;
            ctx.send(h).unwrap();
            if round == 0 {
                // drop everything without waiting for the transfer
                ctx.cleanup();
                continue;
            }
            let recvs = ctx.communicate().unwrap();
            last = Some(ctx.transport().component(recvs[0], c).unwrap()[0]);
            ctx.cleanup();
        }
        last
    });
    assert_eq!(got, vec![Some(1), Some(1)]);
}

#[test]
fn communicate_times_out_on_silent_peer() {
    let cfg = DddConfig::default().with_poll_timeout(Duration::from_millis(50));
    let got = run_contexts(2, cfg, |ctx| {
        let t = ctx.transport_mut().declare_type("silent");
        let c = ctx.transport_mut().add_chunk(t, "c").unwrap();
        if ctx.rank() == 1 {
            let tr = ctx.transport_mut();
            let h = tr.new_send(t, 0).unwrap();
            tr.set_chunk_size(h, c, 4).unwrap();
            tr.freeze(h).unwrap();
        }
        ctx.connect(t).unwrap();
        // rank 1 never sends
        let res = if ctx.rank() == 0 {
            ctx.communicate().map(|r| r.len())
        } else {
            Ok(0)
        };
        ctx.cleanup();
        res
    });
    assert!(matches!(got[0], Err(DddError::Timeout { millis: 50 })));
    assert_eq!(got[1], Ok(0));
}

#[test]
fn connect_times_out_when_peer_never_joins() {
    let mut world = LocalComm::world(2);
    let cfg = DddConfig::default().with_poll_timeout(Duration::from_millis(50));
    let mut ctx = DddContext::new(world.remove(0), cfg).unwrap();
    let t = ctx.transport_mut().declare_type("lonely");
    let c = ctx.transport_mut().add_chunk(t, "c").unwrap();
    let tr = ctx.transport_mut();
    let h = tr.new_send(t, 1).unwrap();
    tr.set_chunk_size(h, c, 4).unwrap();
    tr.freeze(h).unwrap();
    // rank 1 never takes part
    assert_eq!(ctx.connect(t), Err(DddError::Timeout { millis: 50 }));
    assert_eq!(ctx.transport().n_sends(), 0);
}

#[test]
fn cancel_flag_stops_a_waiting_connect() {
    let mut world = LocalComm::world(3);
    let mut ctx = DddContext::new(world.remove(2), DddConfig::default()).unwrap();
    let t = ctx.transport_mut().declare_type("cancelled");
    ctx.transport_mut().add_chunk(t, "c").unwrap();
    ctx.cancel_flag().store(true, std::sync::atomic::Ordering::Relaxed);
    assert_eq!(ctx.connect(t), Err(DddError::Cancelled));
}

#[test]
fn queue_dump_names_peers() {
    let mut tr: Transport<NoComm> = Transport::new();
    let t = tr.declare_type("dump");
    tr.add_chunk(t, "c").unwrap();
    tr.new_send(t, 0).unwrap();
    let text = tr.print_queues();
    assert!(text.starts_with("send queue (1):"));
    assert!(text.contains("dump"));
    assert!(text.contains("recv queue (0):"));
}
