//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* (no zero-copy guarantees).
//! All handles are **pollable** and non-blocking: the transport calls
//! [`Wait::test`] in its polling loops and only trusts a buffer once the
//! handle reported completion. Between one `(src, dst, tag)` triple messages
//! are non-overtaking, exactly like MPI point-to-point semantics.

use crate::ddd_error::DddError;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Typed message tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Derive a sibling tag, e.g. the payload stage following a size stage.
    pub const fn offset(self, k: u16) -> Self {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Non-blocking point-to-point communication.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of the calling process.
    fn rank(&self) -> usize;
    /// Number of participating processes.
    fn size(&self) -> usize;

    /// True for the serial no-op backend.
    fn is_no_comm(&self) -> bool {
        false
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;

    /// Post a receive; `buf` fixes the maximum accepted length.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;

    /// Acquire the channel set for one communication round.
    fn open_channels(&self, peers: &[usize]) -> Result<(), DddError> {
        let size = self.size();
        match peers.iter().find(|&&p| p >= size) {
            Some(&rank) => Err(DddError::InvalidRank { rank, size }),
            None => Ok(()),
        }
    }
}

/// Anything that can be polled and waited on.
pub trait Wait {
    /// Poll for completion without blocking.
    fn test(&mut self) -> bool;
    /// Block until completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;

    /// Like [`wait`](Wait::wait), but gives up once `guard` fires.
    fn wait_polled(mut self, guard: &PollGuard) -> Result<Option<Vec<u8>>, DddError>
    where
        Self: Sized,
    {
        while !self.test() {
            guard.check()?;
            std::thread::yield_now();
        }
        Ok(self.wait())
    }
}

/// Cancellation and timeout hook shared by every busy-poll loop.
#[derive(Clone, Debug)]
pub struct PollGuard {
    started: Instant,
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
}

impl PollGuard {
    /// The clock starts now.
    pub fn new(timeout: Option<Duration>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            started: Instant::now(),
            timeout,
            cancel,
        }
    }

    /// Never fires.
    pub fn unbounded() -> Self {
        Self::new(None, Arc::new(AtomicBool::new(false)))
    }

    pub fn check(&self) -> Result<(), DddError> {
        if self.cancel.load(Ordering::Relaxed) {
            return Err(DddError::Cancelled);
        }
        match self.timeout {
            Some(t) if self.started.elapsed() > t => Err(DddError::Timeout {
                millis: t.as_millis(),
            }),
            _ => Ok(()),
        }
    }
}

/// Compile-time no-op comm for pure serial unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn test(&mut self) -> bool {
        true
    }
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn is_no_comm(&self) -> bool {
        true
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- LocalComm: one "world" of ranks inside a single process ---
type Key = (usize, usize, u16); // (src, dst, tag)

/// Shared by all ranks of one world; never global, so worlds are isolated.
#[derive(Default)]
struct Mailbox {
    slots: DashMap<(Key, u64), Bytes>,
    send_seq: Mutex<HashMap<Key, u64>>,
    recv_seq: Mutex<HashMap<Key, u64>>,
}

impl Mailbox {
    fn next(counter: &Mutex<HashMap<Key, u64>>, key: Key) -> u64 {
        let mut guard = counter.lock();
        let slot = guard.entry(key).or_insert(0);
        let seq = *slot;
        *slot += 1;
        seq
    }
}

/// Pending receive on a [`LocalComm`].
pub struct LocalRecvHandle {
    mailbox: Arc<Mailbox>,
    slot: (Key, u64),
    len: usize,
    data: Option<Vec<u8>>,
}

impl Wait for LocalRecvHandle {
    fn test(&mut self) -> bool {
        if self.data.is_some() {
            return true;
        }
        match self.mailbox.slots.remove(&self.slot) {
            Some((_, bytes)) => {
                let n = bytes.len().min(self.len);
                self.data = Some(bytes[..n].to_vec());
                true
            }
            None => false,
        }
    }

    fn wait(mut self) -> Option<Vec<u8>> {
        while !self.test() {
            std::thread::yield_now();
        }
        self.data.take()
    }
}

/// In-process communicator: each rank usually runs on its own thread.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl LocalComm {
    /// Create the `size` ranks of a fresh, isolated world.
    pub fn world(size: usize) -> Vec<LocalComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }
}

impl fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalRecvHandle;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle {
        let key = (self.rank, peer, tag);
        let seq = Mailbox::next(&self.mailbox.send_seq, key);
        self.mailbox
            .slots
            .insert((key, seq), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle {
        let key = (peer, self.rank, tag);
        let seq = Mailbox::next(&self.mailbox.recv_seq, key);
        LocalRecvHandle {
            mailbox: Arc::clone(&self.mailbox),
            slot: (key, seq),
            len: buf.len(),
            data: None,
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::request::{Request, StaticScope};
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    pub struct MpiComm {
        world: Arc<SimpleCommunicator>,
        _universe: Universe,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, DddError> {
            let universe = mpi::initialize().ok_or_else(|| DddError::CommError {
                neighbor: 0,
                reason: "MPI already initialized".into(),
            })?;
            let world = Arc::new(universe.world());
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                world,
                _universe: universe,
                rank,
                size,
            })
        }
    }

    /// Immediate send of an owned copy of the payload.
    pub struct MpiSendHandle {
        req: Option<Request<'static, [u8], StaticScope>>,
        buf: *mut [u8],
    }

    impl MpiSendHandle {
        fn release(&mut self) {
            if !self.buf.is_null() {
                // SAFETY: `buf` came from `Box::into_raw` and the request using it has completed.
                unsafe { drop(Box::from_raw(self.buf)) };
                self.buf = std::ptr::slice_from_raw_parts_mut(std::ptr::null_mut(), 0);
            }
        }
    }

    impl Drop for MpiSendHandle {
        fn drop(&mut self) {
            // An unfinished rsmpi request panics on drop.
            if let Some(req) = self.req.take() {
                req.wait();
            }
            self.release();
        }
    }

    impl Wait for MpiSendHandle {
        fn test(&mut self) -> bool {
            match self.req.take() {
                None => true,
                Some(req) => match req.test() {
                    Ok(_) => {
                        self.release();
                        true
                    }
                    Err(req) => {
                        self.req = Some(req);
                        false
                    }
                },
            }
        }

        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(req) = self.req.take() {
                req.wait();
            }
            self.release();
            None
        }
    }

    /// Receive matched lazily by probing for the next message from `peer`.
    pub struct MpiRecvHandle {
        world: Arc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
        len: usize,
        data: Option<Vec<u8>>,
    }

    impl Wait for MpiRecvHandle {
        fn test(&mut self) -> bool {
            if self.data.is_some() {
                return true;
            }
            let process = self.world.process_at_rank(self.peer);
            match process.immediate_matched_probe_with_tag(self.tag) {
                Some((msg, _status)) => {
                    let (mut data, _status) = msg.matched_receive_vec::<u8>();
                    data.truncate(self.len);
                    self.data = Some(data);
                    true
                }
                None => false,
            }
        }

        fn wait(mut self) -> Option<Vec<u8>> {
            while !self.test() {
                std::thread::yield_now();
            }
            self.data.take()
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSendHandle;
        type RecvHandle = MpiRecvHandle;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSendHandle {
            let raw: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the box is only freed by `release` after the request completed.
            let owned: &'static [u8] = unsafe { &*raw };
            let req = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                StaticScope,
                owned,
                tag as i32,
            );
            MpiSendHandle {
                req: Some(req),
                buf: raw,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> MpiRecvHandle {
            MpiRecvHandle {
                world: Arc::clone(&self.world),
                peer: peer as i32,
                tag: tag as i32,
                len: buf.len(),
                data: None,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
