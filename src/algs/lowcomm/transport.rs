//! Send/receive queues, connect/communicate rounds and low-memory backoff.
//!
//! A round looks like this on every participating process:
//!
//! 1. `new_send` + `set_table_size`/`set_chunk_size` for each outgoing message, then `freeze`;
//! 2. `connect` (collective: runs one notify round and posts all receives);
//! 3. `allocate` (or `prepare_send`), fill components, `send`;
//! 4. `communicate` until everything is READY, read the returned receives;
//! 5. `cleanup`.
//!
//! Allocation failures are handled locally first: completed receives are
//! drained and finished sends are reclaimed before the allocation is retried,
//! so two processes that both wait on send memory cannot wedge each other.

use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use bytemuck::Pod;

use crate::algs::communicator::{CommTag, Communicator, PollGuard, Wait};
use crate::algs::lowcomm::alloc::{BudgetAllocator, BufferAllocator, HeapAllocator};
use crate::algs::lowcomm::frame::{self, MAGIC};
use crate::algs::lowcomm::message::{Direction, Message, MsgHandle, MsgState};
use crate::algs::lowcomm::msg_type::{ComponentId, ComponentKind, MsgType, MsgTypeId, MsgTypeRegistry};
use crate::algs::notify::{Notify, NotifyDesc};
use crate::algs::wire::records_from;
use crate::config::DddConfig;
use crate::ddd_error::DddError;
use crate::pool::Pool;

pub const TRANSPORT_TAG: CommTag = CommTag::new(0xD300);

/// Counters for diagnostics and tests.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub alloc_failures: usize,
    pub reclaimed_sends: usize,
    pub messages_sent: usize,
    pub messages_received: usize,
}

pub struct Transport<C: Communicator> {
    types: MsgTypeRegistry,
    msgs: Pool<Message<C>>,
    send_queue: Vec<MsgHandle>,
    recv_queue: Vec<MsgHandle>,
    recv_buffer: Vec<u8>,
    allocator: Box<dyn BufferAllocator>,
    cancel: Arc<AtomicBool>,
    poll_timeout: Option<Duration>,
    stats: TransportStats,
}

impl<C: Communicator> Default for Transport<C> {
    fn default() -> Self {
        Self::with_allocator(Box::new(HeapAllocator))
    }
}

impl<C: Communicator> Transport<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(allocator: Box<dyn BufferAllocator>) -> Self {
        Self {
            types: MsgTypeRegistry::default(),
            msgs: Pool::new(),
            send_queue: Vec::new(),
            recv_queue: Vec::new(),
            recv_buffer: Vec::new(),
            allocator,
            cancel: Arc::new(AtomicBool::new(false)),
            poll_timeout: None,
            stats: TransportStats::default(),
        }
    }

    pub fn from_config(cfg: &DddConfig) -> Self {
        let allocator: Box<dyn BufferAllocator> = match cfg.send_memory_limit {
            Some(limit) => Box::new(BudgetAllocator::new(limit)),
            None => Box::new(HeapAllocator),
        };
        let mut t = Self::with_allocator(allocator);
        t.poll_timeout = cfg.poll_timeout;
        t
    }

    pub fn set_poll_timeout(&mut self, timeout: Option<Duration>) {
        self.poll_timeout = timeout;
    }

    /// Setting the returned flag makes every running or future poll loop fail
    /// with [`DddError::Cancelled`] until it is cleared again.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn n_sends(&self) -> usize {
        self.send_queue.len()
    }

    pub fn n_recvs(&self) -> usize {
        self.recv_queue.len()
    }

    /// A fresh guard over this transport's timeout and cancel flag.
    pub fn poll_guard(&self) -> PollGuard {
        PollGuard::new(self.poll_timeout, Arc::clone(&self.cancel))
    }

    // --- message types -----------------------------------------------------

    pub fn declare_type(&mut self, name: &str) -> MsgTypeId {
        self.types.declare(name)
    }

    pub fn add_table(
        &mut self,
        t: MsgTypeId,
        name: &str,
        stride: usize,
    ) -> Result<ComponentId, DddError> {
        self.types.add_table(t, name, stride)
    }

    pub fn add_chunk(&mut self, t: MsgTypeId, name: &str) -> Result<ComponentId, DddError> {
        self.types.add_chunk(t, name)
    }

    pub fn msg_type(&self, t: MsgTypeId) -> Result<&MsgType, DddError> {
        self.types.get(t)
    }

    // --- instances ---------------------------------------------------------

    fn msg(&self, h: MsgHandle) -> Result<&Message<C>, DddError> {
        self.msgs
            .get(h.0)
            .ok_or(DddError::UnknownHandle { kind: "message" })
    }

    fn msg_mut(&mut self, h: MsgHandle) -> Result<&mut Message<C>, DddError> {
        self.msgs
            .get_mut(h.0)
            .ok_or(DddError::UnknownHandle { kind: "message" })
    }

    fn outgoing_mut(&mut self, h: MsgHandle) -> Result<&mut Message<C>, DddError> {
        let m = self.msg_mut(h)?;
        if m.dir != Direction::Send {
            return Err(DddError::InvalidState {
                expected: "outgoing message",
                found: "incoming message",
            });
        }
        Ok(m)
    }

    fn type_of(&self, h: MsgHandle) -> Result<&MsgType, DddError> {
        self.types.get(self.msg(h)?.msg_type)
    }

    pub fn state(&self, h: MsgHandle) -> Result<MsgState, DddError> {
        Ok(self.msg(h)?.state)
    }

    /// Destination of a send, source of a receive.
    pub fn peer(&self, h: MsgHandle) -> Result<usize, DddError> {
        Ok(self.msg(h)?.peer)
    }

    /// Total framed size (header plus payloads); zero before freeze.
    pub fn buffer_size(&self, h: MsgHandle) -> Result<usize, DddError> {
        Ok(self.msg(h)?.buffer_size)
    }

    /// Queue a new outgoing instance of type `t` for `dest`.
    pub fn new_send(&mut self, t: MsgTypeId, dest: usize) -> Result<MsgHandle, DddError> {
        let n = self.types.get(t)?.n_components();
        let h = MsgHandle(self.msgs.insert(Message::outgoing(t, dest, n)));
        self.send_queue.push(h);
        Ok(h)
    }

    pub fn set_table_size(
        &mut self,
        h: MsgHandle,
        c: ComponentId,
        entries: usize,
    ) -> Result<(), DddError> {
        let stride = self.type_of(h)?.stride(c)?;
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::New)?;
        let size = entries.checked_mul(stride).ok_or(DddError::OutOfMemory {
            requested: usize::MAX,
        })?;
        m.chunks[c.index()].size = size;
        m.chunks[c.index()].entries = entries;
        Ok(())
    }

    pub fn set_chunk_size(
        &mut self,
        h: MsgHandle,
        c: ComponentId,
        bytes: usize,
    ) -> Result<(), DddError> {
        self.type_of(h)?.expect_chunk(c)?;
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::New)?;
        m.chunks[c.index()].size = bytes;
        Ok(())
    }

    /// Fix sizes and offsets; returns the framed buffer size.
    pub fn freeze(&mut self, h: MsgHandle) -> Result<usize, DddError> {
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::New)?;
        m.buffer_size = frame::layout(&mut m.chunks).ok_or(DddError::OutOfMemory {
            requested: usize::MAX,
        })?;
        m.state = MsgState::Freezed;
        Ok(m.buffer_size)
    }

    /// Obtain the buffer of a frozen send and write its header.
    pub fn allocate(&mut self, h: MsgHandle) -> Result<(), DddError> {
        let size = {
            let m = self.outgoing_mut(h)?;
            m.state.expect(MsgState::Freezed)?;
            m.buffer_size
        };
        let mut buf = self.alloc_with_backoff(size)?;
        // Only finished sends are reclaimed, so `h` is still alive here.
        let m = self.msg_mut(h)?;
        frame::write_header(&mut buf, &m.chunks);
        m.buffer = buf;
        m.state = MsgState::Allocated;
        Ok(())
    }

    /// Freeze (if still NEW) and allocate in one call.
    pub fn prepare_send(&mut self, h: MsgHandle) -> Result<(), DddError> {
        if self.state(h)? == MsgState::New {
            self.freeze(h)?;
        }
        self.allocate(h)
    }

    /// Shrink a table's entry count after allocation; only that header field changes.
    pub fn set_table_len(
        &mut self,
        h: MsgHandle,
        c: ComponentId,
        entries: usize,
    ) -> Result<(), DddError> {
        self.type_of(h)?.stride(c)?;
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::Allocated)?;
        let current = m.chunks[c.index()].entries;
        if entries > current {
            return Err(DddError::TableGrow {
                current,
                requested: entries,
            });
        }
        m.chunks[c.index()].entries = entries;
        frame::write_entries(&mut m.buffer, c.index(), entries);
        Ok(())
    }

    // --- component access --------------------------------------------------

    /// Bytes of component `c`: sends once ALLOCATED, receives once READY.
    pub fn component(&self, h: MsgHandle, c: ComponentId) -> Result<&[u8], DddError> {
        let m = self.msg(h)?;
        self.types.get(m.msg_type)?.component(c)?;
        let bytes: &[u8] = match m.dir {
            Direction::Send => {
                if m.state < MsgState::Allocated {
                    return Err(DddError::InvalidState {
                        expected: MsgState::Allocated.name(),
                        found: m.state.name(),
                    });
                }
                &m.buffer
            }
            Direction::Recv => {
                m.state.expect(MsgState::Ready)?;
                &self.recv_buffer[m.recv_offset..m.recv_offset + m.buffer_size]
            }
        };
        let d = m.chunks[c.index()];
        Ok(&bytes[d.offset..d.offset + d.size])
    }

    /// Writable bytes of component `c` of an ALLOCATED send.
    pub fn component_mut(&mut self, h: MsgHandle, c: ComponentId) -> Result<&mut [u8], DddError> {
        self.type_of(h)?.component(c)?;
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::Allocated)?;
        let d = m.chunks[c.index()];
        Ok(&mut m.buffer[d.offset..d.offset + d.size])
    }

    /// Entry count of a table (as shrunk by the sender, for receives).
    pub fn table_len(&self, h: MsgHandle, c: ComponentId) -> Result<usize, DddError> {
        self.type_of(h)?.stride(c)?;
        self.msg(h)?
            .chunks
            .get(c.index())
            .map(|d| d.entries)
            .ok_or(DddError::InvalidState {
                expected: MsgState::Ready.name(),
                found: MsgState::InFlight.name(),
            })
    }

    pub fn chunk_size(&self, h: MsgHandle, c: ComponentId) -> Result<usize, DddError> {
        self.type_of(h)?.expect_chunk(c)?;
        self.msg(h)?
            .chunks
            .get(c.index())
            .map(|d| d.size)
            .ok_or(DddError::InvalidState {
                expected: MsgState::Ready.name(),
                found: MsgState::InFlight.name(),
            })
    }

    fn check_record<T: Pod>(&self, h: MsgHandle, c: ComponentId) -> Result<usize, DddError> {
        let stride = self.type_of(h)?.stride(c)?;
        let record = std::mem::size_of::<T>();
        if record != stride {
            return Err(DddError::RecordSize {
                len: stride,
                record,
            });
        }
        Ok(stride)
    }

    /// Copy `records` to the start of table `c`.
    pub fn write_table<T: Pod>(
        &mut self,
        h: MsgHandle,
        c: ComponentId,
        records: &[T],
    ) -> Result<(), DddError> {
        self.check_record::<T>(h, c)?;
        let capacity = self.table_len(h, c)?;
        if records.len() > capacity {
            return Err(DddError::TableGrow {
                current: capacity,
                requested: records.len(),
            });
        }
        let src: &[u8] = bytemuck::cast_slice(records);
        self.component_mut(h, c)?[..src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Copy the valid entries of table `c` out, regardless of alignment.
    pub fn read_table<T: Pod>(&self, h: MsgHandle, c: ComponentId) -> Result<Vec<T>, DddError> {
        let stride = self.check_record::<T>(h, c)?;
        let entries = self.table_len(h, c)?;
        let bytes = self.component(h, c)?;
        let n = entries * stride;
        if n > bytes.len() {
            return Err(DddError::RecordSize {
                len: bytes.len(),
                record: stride,
            });
        }
        records_from(&bytes[..n]).map_err(|reason| DddError::WireFormat {
            peer: self.msg(h).map(|m| m.peer).unwrap_or_default(),
            reason,
        })
    }

    // --- I/O ---------------------------------------------------------------

    /// Hand an ALLOCATED send to the channel layer.
    pub fn send(&mut self, comm: &C, h: MsgHandle) -> Result<(), DddError> {
        let m = self.outgoing_mut(h)?;
        m.state.expect(MsgState::Allocated)?;
        m.pending_send = Some(comm.isend(m.peer, TRANSPORT_TAG.as_u16(), &m.buffer));
        m.state = MsgState::InFlight;
        self.stats.messages_sent += 1;
        Ok(())
    }

    /// Learn the incoming messages for type `t` and post their receives.
    ///
    /// Collective: every process must call it for the same round. On a
    /// collective exception or local failure after notify, both queues are
    /// cleaned up and the error is returned.
    pub fn connect(
        &mut self,
        comm: &C,
        notify: &mut Notify,
        t: MsgTypeId,
    ) -> Result<usize, DddError> {
        if !self.recv_queue.is_empty() {
            return Err(DddError::InvalidState {
                expected: "cleaned-up receive queue",
                found: "pending receives",
            });
        }
        let expected = self.types.get(t)?.name().to_owned();
        let mut dests = Vec::with_capacity(self.send_queue.len());
        for &h in &self.send_queue {
            let m = self.msg(h)?;
            if m.msg_type != t {
                return Err(DddError::ConnectTypeMismatch {
                    expected,
                    found: self.types.get(m.msg_type)?.name().to_owned(),
                });
            }
            if m.state == MsgState::New {
                return Err(DddError::InvalidState {
                    expected: MsgState::Freezed.name(),
                    found: m.state.name(),
                });
            }
            dests.push(NotifyDesc::new(m.peer, m.buffer_size));
        }
        let mut procs: Vec<usize> = dests.iter().map(|d| d.proc).collect();
        procs.sort_unstable();
        if let Some(w) = procs.windows(2).find(|w| w[0] == w[1]) {
            return Err(DddError::DuplicateSend { dest: w[0] });
        }
        if comm.is_no_comm() && procs.contains(&comm.rank()) {
            // the no-op backend discovers the edge but never moves the bytes
            self.cleanup();
            return Err(DddError::InvalidState {
                expected: "communicating backend for self-messages",
                found: "no-op communicator",
            });
        }

        notify.begin(dests.len()).copy_from_slice(&dests);
        let n_recvs = match notify.notify_with(comm, &self.poll_guard()) {
            Ok(n) => n,
            Err(e) => {
                notify.end();
                self.cleanup();
                return Err(e);
            }
        };
        let incoming = notify.received().to_vec();
        notify.end();

        let peers: Vec<usize> = dests
            .iter()
            .chain(incoming.iter())
            .map(|d| d.proc)
            .collect();
        if let Err(e) = comm.open_channels(&peers) {
            self.cleanup();
            return Err(e);
        }

        let total: usize = incoming.iter().map(|d| d.size).sum();
        self.recv_buffer = match self.alloc_with_backoff(total) {
            Ok(buf) => buf,
            Err(e) => {
                self.cleanup();
                return Err(e);
            }
        };
        let mut offset = 0;
        for d in &incoming {
            let h = MsgHandle(self.msgs.insert(Message::incoming(t, d.proc, d.size, offset)));
            self.recv_queue.push(h);
            offset += d.size;
        }
        for &h in &self.recv_queue {
            if let Some(m) = self.msgs.get_mut(h.0) {
                let slot = &mut self.recv_buffer[m.recv_offset..m.recv_offset + m.buffer_size];
                m.pending_recv = Some(comm.irecv(m.peer, TRANSPORT_TAG.as_u16(), slot));
                m.state = MsgState::InFlight;
            }
        }
        log::debug!(
            "transport[{}]: connected `{expected}` with {} sends, {n_recvs} receives",
            comm.rank(),
            self.send_queue.len()
        );
        Ok(n_recvs)
    }

    /// Take part in a connect round but abort it for everybody with `code`.
    pub fn connect_abort(
        &mut self,
        comm: &C,
        notify: &mut Notify,
        code: u32,
    ) -> Result<usize, DddError> {
        notify.begin(0);
        notify.raise(code);
        let res = notify.notify_with(comm, &self.poll_guard());
        notify.end();
        self.cleanup();
        res
    }

    /// Poll both queues until every instance is READY; returns the receives.
    pub fn communicate(&mut self) -> Result<Vec<MsgHandle>, DddError> {
        for &h in &self.send_queue {
            let m = self.msg(h)?;
            if m.state < MsgState::InFlight {
                return Err(DddError::InvalidState {
                    expected: MsgState::InFlight.name(),
                    found: m.state.name(),
                });
            }
        }
        let guard = self.poll_guard();
        loop {
            let pending = self.poll_sends() + self.poll_receives()?;
            if pending == 0 {
                break;
            }
            guard.check()?;
            std::thread::yield_now();
        }
        Ok(self.recv_queue.clone())
    }

    /// Sends still in flight after one polling pass.
    fn poll_sends(&mut self) -> usize {
        let mut pending = 0;
        for &h in &self.send_queue {
            let Some(m) = self.msgs.get_mut(h.0) else {
                continue;
            };
            if m.state != MsgState::InFlight {
                continue;
            }
            if m.pending_send.as_mut().is_none_or(|p| p.test()) {
                m.pending_send = None;
                m.state = MsgState::Ready;
            } else {
                pending += 1;
            }
        }
        pending
    }

    /// Receives still in flight after one polling pass. Completed ones are
    /// validated against the local type registry.
    fn poll_receives(&mut self) -> Result<usize, DddError> {
        let mut pending = 0;
        for &h in &self.recv_queue {
            let Some(m) = self.msgs.get_mut(h.0) else {
                continue;
            };
            if m.state != MsgState::InFlight {
                continue;
            }
            if !m.pending_recv.as_mut().is_some_and(|p| p.test()) {
                pending += 1;
                continue;
            }
            let peer = m.peer;
            let data = m
                .pending_recv
                .take()
                .and_then(|p| p.wait())
                .ok_or_else(|| DddError::CommError {
                    neighbor: peer,
                    reason: "receive completed without data".into(),
                })?;
            if data.len() != m.buffer_size {
                return Err(DddError::WireFormat {
                    peer,
                    reason: format!("expected {} bytes, got {}", m.buffer_size, data.len()),
                });
            }
            let slot = &mut self.recv_buffer[m.recv_offset..m.recv_offset + m.buffer_size];
            slot.copy_from_slice(&data);

            let ty = self.types.get(m.msg_type)?;
            let hdr = frame::read_header(slot).map_err(|reason| DddError::WireFormat { peer, reason })?;
            if hdr.magic != MAGIC || hdr.chunks.len() != ty.n_components() {
                return Err(DddError::HeaderMismatch {
                    peer,
                    type_name: ty.name().to_owned(),
                    magic: hdr.magic,
                    components: hdr.chunks.len(),
                });
            }
            for (i, (d, comp)) in hdr.chunks.iter().zip(ty.components()).enumerate() {
                if let ComponentKind::Table { stride } = comp.kind {
                    if d.entries.checked_mul(stride).is_none_or(|n| n > d.size) {
                        return Err(DddError::WireFormat {
                            peer,
                            reason: format!(
                                "table {i} claims {} entries of {stride} bytes in {} bytes",
                                d.entries, d.size
                            ),
                        });
                    }
                }
            }
            m.chunks = hdr.chunks;
            m.state = MsgState::Ready;
            self.stats.messages_received += 1;
        }
        Ok(pending)
    }

    fn in_flight_sends(&self) -> usize {
        self.send_queue
            .iter()
            .filter_map(|&h| self.msgs.get(h.0))
            .filter(|m| m.state == MsgState::InFlight)
            .count()
    }

    /// Free every send whose transfer has finished; returns how many.
    fn reclaim_sends(&mut self) -> usize {
        let mut freed = 0;
        let mut keep = Vec::with_capacity(self.send_queue.len());
        for h in std::mem::take(&mut self.send_queue) {
            let done = match self.msgs.get_mut(h.0) {
                None => continue,
                Some(m) => match m.state {
                    MsgState::Ready => true,
                    MsgState::InFlight => m.pending_send.as_mut().is_none_or(|p| p.test()),
                    _ => false,
                },
            };
            if done {
                if let Some(m) = self.msgs.remove(h.0) {
                    self.allocator.release(m.buffer);
                }
                freed += 1;
            } else {
                keep.push(h);
            }
        }
        self.send_queue = keep;
        self.stats.reclaimed_sends += freed;
        freed
    }

    fn alloc_with_backoff(&mut self, size: usize) -> Result<Vec<u8>, DddError> {
        let guard = self.poll_guard();
        loop {
            if let Some(buf) = self.allocator.allocate(size) {
                return Ok(buf);
            }
            self.stats.alloc_failures += 1;
            self.poll_receives()?;
            let freed = self.reclaim_sends();
            if freed > 0 {
                log::warn!("transport: low memory for {size} bytes, reclaimed {freed} finished sends");
                continue;
            }
            if self.in_flight_sends() == 0 {
                log::warn!("transport: out of memory for {size} bytes, nothing left to reclaim");
                return Err(DddError::OutOfMemory { requested: size });
            }
            guard.check()?;
            std::thread::yield_now();
        }
    }

    /// Drop every instance and the shared receive buffer; always safe.
    /// Transfers that have not completed are silently discarded.
    pub fn cleanup(&mut self) {
        for m in self.msgs.drain() {
            if m.dir == Direction::Send && !m.buffer.is_empty() {
                self.allocator.release(m.buffer);
            }
        }
        self.send_queue.clear();
        self.recv_queue.clear();
        let rb = std::mem::take(&mut self.recv_buffer);
        self.allocator.release(rb);
    }

    /// Human-readable dump of both queues.
    pub fn print_queues(&self) -> String {
        let mut out = String::new();
        let mut dump = |label: &str, arrow: &str, queue: &[MsgHandle]| {
            let _ = writeln!(out, "{label} queue ({}):", queue.len());
            for m in queue.iter().filter_map(|&h| self.msgs.get(h.0)) {
                let name = self.types.get(m.msg_type).map(|t| t.name()).unwrap_or("?");
                let _ = writeln!(
                    out,
                    "  {arrow} {:>5}  {:<12} {:<10} {} bytes",
                    m.peer,
                    name,
                    m.state.name(),
                    m.buffer_size
                );
            }
        };
        dump("send", "to", &self.send_queue);
        dump("recv", "from", &self.recv_queue);
        out
    }
}
