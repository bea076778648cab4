//! Degree-bounded spanning tree and the two tree collectives built on it.
//!
//! Rank `r` has parent `(r - 1) / d` and children `r*d + 1 ..= r*d + d`
//! (those below `size`). The up-flow ("concentrate") lets a process combine
//! its own data with what its children already combined; the down-flow
//! ("spread") pushes filtered data from a process to each child.
//!
//! Payloads have variable length, so every tree message is a two-stage
//! handshake: an 8-byte [`WireLen`] on `tag`, then the payload on `tag + 1`.

use crate::algs::communicator::{CommTag, Communicator, PollGuard, Wait};
use crate::algs::wire::{WireI64, WireLen, cast_slice, cast_slice_mut, expect_exact_len};
use crate::ddd_error::DddError;
use std::ops::Range;

/// Reduction tags (sizes on the base tag, payload on `+1`).
pub const REDUCE_UP_TAG: CommTag = CommTag::new(0xD200);
pub const REDUCE_DOWN_TAG: CommTag = CommTag::new(0xD210);

/// Position of one rank in the implied spanning tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SpanningTree {
    rank: usize,
    size: usize,
    degree: usize,
}

impl SpanningTree {
    pub fn new(rank: usize, size: usize, degree: usize) -> Self {
        Self {
            rank,
            size,
            degree: degree.max(1),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn parent(&self) -> Option<usize> {
        (self.rank > 0).then(|| (self.rank - 1) / self.degree)
    }

    /// Children as a contiguous rank range (possibly empty).
    pub fn children(&self) -> Range<usize> {
        let start = self
            .rank
            .saturating_mul(self.degree)
            .saturating_add(1)
            .min(self.size);
        let end = start.saturating_add(self.degree).min(self.size);
        start..end
    }

    pub fn n_children(&self) -> usize {
        self.children().len()
    }

    /// Index of `rank` among this node's children.
    pub fn child_slot(&self, rank: usize) -> Option<usize> {
        let kids = self.children();
        kids.contains(&rank).then(|| rank - kids.start)
    }
}

/// Send a length-prefixed payload and wait until both stages left.
pub fn send_framed<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    payload: &[u8],
    guard: &PollGuard,
) -> Result<(), DddError> {
    let len = WireLen::new(payload.len());
    let h_len = comm.isend(peer, tag.as_u16(), cast_slice(std::slice::from_ref(&len)));
    let h_data = comm.isend(peer, tag.offset(1).as_u16(), payload);
    h_len.wait_polled(guard)?;
    h_data.wait_polled(guard)?;
    Ok(())
}

/// Receive a length-prefixed payload; gives up once `guard` fires.
pub fn recv_framed<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: CommTag,
    guard: &PollGuard,
) -> Result<Vec<u8>, DddError> {
    let mut len = WireLen::new(0);
    let raw = comm
        .irecv(
            peer,
            tag.as_u16(),
            cast_slice_mut(std::slice::from_mut(&mut len)),
        )
        .wait_polled(guard)?
        .ok_or_else(|| DddError::CommError {
            neighbor: peer,
            reason: format!("failed to receive frame length from rank {peer}"),
        })?;
    expect_exact_len(raw.len(), std::mem::size_of::<WireLen>())
        .map_err(|reason| DddError::WireFormat { peer, reason })?;
    cast_slice_mut(std::slice::from_mut(&mut len)).copy_from_slice(&raw);

    let n = len.get();
    let mut buf = vec![0u8; n];
    let data = comm
        .irecv(peer, tag.offset(1).as_u16(), &mut buf)
        .wait_polled(guard)?
        .ok_or_else(|| DddError::CommError {
            neighbor: peer,
            reason: format!("failed to receive {n}-byte frame from rank {peer}"),
        })?;
    expect_exact_len(data.len(), n).map_err(|reason| DddError::WireFormat { peer, reason })?;
    Ok(data)
}

/// Tree collectives bound to one communicator.
pub struct TreeComm<'a, C> {
    comm: &'a C,
    tree: SpanningTree,
    guard: PollGuard,
}

impl<'a, C: Communicator> TreeComm<'a, C> {
    pub fn new(comm: &'a C, degree: usize) -> Self {
        Self {
            comm,
            tree: SpanningTree::new(comm.rank(), comm.size(), degree),
            guard: PollGuard::unbounded(),
        }
    }

    /// Bound every wait of this collective by `guard`.
    pub fn with_guard(mut self, guard: PollGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn tree(&self) -> &SpanningTree {
        &self.tree
    }

    /// Up-flow: hand the locally combined payload to the parent (no-op at the root).
    pub fn concentrate(&self, tag: CommTag, payload: &[u8]) -> Result<(), DddError> {
        match self.tree.parent() {
            Some(parent) => send_framed(self.comm, parent, tag, payload, &self.guard),
            None => Ok(()),
        }
    }

    /// Up-flow: receive what `child` has combined for its subtree.
    pub fn get_concentrate(&self, child: usize, tag: CommTag) -> Result<Vec<u8>, DddError> {
        debug_assert!(self.tree.child_slot(child).is_some());
        recv_framed(self.comm, child, tag, &self.guard)
    }

    /// Down-flow: push the slice addressed into `child`'s subtree.
    pub fn spread(&self, child: usize, tag: CommTag, payload: &[u8]) -> Result<(), DddError> {
        debug_assert!(self.tree.child_slot(child).is_some());
        send_framed(self.comm, child, tag, payload, &self.guard)
    }

    /// Down-flow: receive from the parent. The root has nobody to hear from.
    pub fn get_spread(&self, tag: CommTag) -> Result<Vec<u8>, DddError> {
        match self.tree.parent() {
            Some(parent) => recv_framed(self.comm, parent, tag, &self.guard),
            None => Err(DddError::InvalidState {
                expected: "non-root rank",
                found: "root rank",
            }),
        }
    }

    /// Sum one value over all ranks; every rank returns the same total.
    pub fn global_sum(&self, value: i64) -> Result<i64, DddError> {
        let mut acc = value;
        for child in self.tree.children() {
            acc += decode_i64(child, &self.get_concentrate(child, REDUCE_UP_TAG)?)?;
        }
        let total = if self.tree.is_root() {
            acc
        } else {
            self.concentrate(REDUCE_UP_TAG, cast_slice(&[WireI64::new(acc)]))?;
            let parent = self.tree.parent().unwrap_or(0);
            decode_i64(parent, &self.get_spread(REDUCE_DOWN_TAG)?)?
        };
        for child in self.tree.children() {
            self.spread(child, REDUCE_DOWN_TAG, cast_slice(&[WireI64::new(total)]))?;
        }
        Ok(total)
    }
}

fn decode_i64(peer: usize, raw: &[u8]) -> Result<i64, DddError> {
    expect_exact_len(raw.len(), std::mem::size_of::<WireI64>())
        .map_err(|reason| DddError::WireFormat { peer, reason })?;
    let v: WireI64 = bytemuck::pod_read_unaligned(raw);
    Ok(v.get())
}
