//! Topology notification: learn who will send to me, knowing only whom I send to.
//!
//! One round is two waves over the configured
//! [`SpanningTree`](crate::algs::tree::SpanningTree):
//!
//! 1. **Bottom-up.** Every process merges its own outgoing edges with the
//!    unresolved edges of its children. Each process also contributes a
//!    *dummy* edge `me -> me`, which tells its ancestors that `me` lives in
//!    their subtree and doubles as the routing information for the way down.
//!    After sorting by `(to, from)`, an edge whose destination's dummy is in
//!    the same group has both endpoints in the visited subtree: it is
//!    resolved here and not forwarded.
//! 2. **Top-down.** Each process takes the edges resolved at its level plus
//!    those handed down by its parent, sorts them by routing slot and gives
//!    each child exactly the slice addressed into its subtree. Edges
//!    addressed to the process itself become its receive descriptors.
//!
//! An exception raised by any participant travels up as the most severe
//! code seen and is then broadcast down unchanged, so every process of the
//! round returns the same [`DddError::NotifyAborted`]. A process that fails
//! locally takes part the same way and returns its own error instead.

use crate::algs::communicator::{CommTag, Communicator, PollGuard};
use crate::algs::tree::TreeComm;
use crate::algs::wire::{WireNotifyHdr, WireNotifyInfo, WIRE_VERSION, cast_slice, records_from};
use crate::config::DEFAULT_NOTIFY_MAX_INFOS;
use crate::ddd_error::DddError;
use itertools::Itertools;

pub const NOTIFY_UP_TAG: CommTag = CommTag::new(0xD100);
pub const NOTIFY_DOWN_TAG: CommTag = CommTag::new(0xD110);

/// Code broadcast when a process fails locally during a round. It outranks
/// every other code.
pub const NOTIFY_FAILURE_EXCEPTION: u32 = u32::MAX;

/// `(remote process, byte size)`: a declared send or a discovered receive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifyDesc {
    pub proc: usize,
    pub size: usize,
}

impl NotifyDesc {
    pub fn new(proc: usize, size: usize) -> Self {
        Self { proc, size }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
enum InfoFlag {
    /// Marks the presence of `from` in the sender's subtree.
    Dummy = 0,
    Unknown = 1,
    Known = 2,
    /// Resolved, and addressed to the resolving process itself.
    Myself = 3,
}

impl InfoFlag {
    fn from_wire(v: u32) -> Option<Self> {
        match v {
            0 => Some(InfoFlag::Dummy),
            1 => Some(InfoFlag::Unknown),
            2 => Some(InfoFlag::Known),
            3 => Some(InfoFlag::Myself),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Info {
    from: usize,
    to: usize,
    size: usize,
    flag: InfoFlag,
}

impl Info {
    fn is_resolved(&self) -> bool {
        matches!(self.flag, InfoFlag::Known | InfoFlag::Myself)
    }

    fn to_wire(self) -> WireNotifyInfo {
        WireNotifyInfo::new(self.from, self.to, self.size, self.flag as u32)
    }
}

/// Where an edge goes on the way down: stays here, or into a child subtree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Route {
    Local,
    Child(usize),
}

/// Per-process notify state; one round at a time.
#[derive(Debug, Clone)]
pub struct Notify {
    degree: usize,
    max_infos: usize,
    sends: Vec<NotifyDesc>,
    exception: Option<u32>,
    received: Vec<NotifyDesc>,
}

impl Default for Notify {
    fn default() -> Self {
        Self::new(2, DEFAULT_NOTIFY_MAX_INFOS)
    }
}

impl Notify {
    pub fn new(degree: usize, max_infos: usize) -> Self {
        Self {
            degree: degree.max(1),
            max_infos,
            sends: Vec::new(),
            exception: None,
            received: Vec::new(),
        }
    }

    /// Start a round declaring `n_sends` outgoing messages; fill in the returned slots.
    pub fn begin(&mut self, n_sends: usize) -> &mut [NotifyDesc] {
        self.sends.clear();
        self.sends.resize(n_sends, NotifyDesc::default());
        self.exception = None;
        self.received.clear();
        &mut self.sends
    }

    /// Abort this round for everybody with `code` (0 is promoted to 1).
    pub fn raise(&mut self, code: u32) {
        self.sends.clear();
        self.exception = Some(code.max(1));
    }

    /// Finish the round and drop its descriptors.
    pub fn end(&mut self) {
        self.sends.clear();
        self.received.clear();
        self.exception = None;
    }

    /// Descriptors declared for the current round.
    pub fn sends(&self) -> &[NotifyDesc] {
        &self.sends
    }

    /// `(source, size)` pairs discovered by the last successful [`Notify::notify`].
    pub fn received(&self) -> &[NotifyDesc] {
        &self.received
    }

    /// Run both waves. Returns the number of discovered receives.
    pub fn notify<C: Communicator>(&mut self, comm: &C) -> Result<usize, DddError> {
        self.notify_with(comm, &PollGuard::unbounded())
    }

    /// Like [`notify`](Self::notify), with every wait bounded by `guard`.
    ///
    /// A local failure (bad destination, info overflow, malformed wave)
    /// does not leave the round: this process raises
    /// [`NOTIFY_FAILURE_EXCEPTION`], finishes both waves and then returns
    /// its own error, while everybody else sees [`DddError::NotifyAborted`].
    pub fn notify_with<C: Communicator>(
        &mut self,
        comm: &C,
        guard: &PollGuard,
    ) -> Result<usize, DddError> {
        let me = comm.rank();
        let size = comm.size();
        self.received.clear();

        let tc = TreeComm::new(comm, self.degree).with_guard(guard.clone());
        let tree = *tc.tree();
        let mut routing: Vec<Option<Route>> = vec![None; size];
        routing[me] = Some(Route::Local);

        let mut round = RoundState {
            exception: self.exception,
            failure: None,
        };

        // --- bottom-up wave -------------------------------------------------
        if let Some(bad) = self.sends.iter().find(|d| d.proc >= size) {
            round.fail(me, DddError::InvalidRank {
                rank: bad.proc,
                size,
            });
        } else if round.exception.is_none() {
            if let Err(e) = self.check_capacity(1 + self.sends.len()) {
                round.fail(me, e);
            }
        }

        let mut infos: Vec<Info> = Vec::new();
        if round.exception.is_none() {
            infos.push(Info {
                from: me,
                to: me,
                size: 0,
                flag: InfoFlag::Dummy,
            });
            infos.extend(self.sends.iter().map(|d| Info {
                from: me,
                to: d.proc,
                size: d.size,
                flag: InfoFlag::Unknown,
            }));
        }

        for (slot, child) in tree.children().enumerate() {
            let raw = tc.get_concentrate(child, NOTIFY_UP_TAG)?;
            let (code, recs) = match decode_wave(child, size, &raw) {
                Ok(wave) => wave,
                Err(e) => {
                    round.fail(me, e);
                    continue;
                }
            };
            if code != 0 {
                round.raise(code);
                continue;
            }
            if round.exception.is_some() {
                continue;
            }
            if let Err(e) = self.check_capacity(infos.len() + recs.len()) {
                round.fail(me, e);
                continue;
            }
            for info in recs {
                if info.flag == InfoFlag::Dummy {
                    routing[info.from] = Some(Route::Child(slot));
                }
                infos.push(info);
            }
        }

        let mut resolved: Vec<Info> = Vec::new();
        let mut upward: Vec<Info> = Vec::new();
        if round.exception.is_none() {
            mark_resolved(&mut infos, me);
            let (here, up): (Vec<Info>, Vec<Info>) =
                infos.into_iter().partition(Info::is_resolved);
            resolved = here;
            upward = up;
            if tree.is_root() {
                if let Some(lost) = upward.iter().find(|i| i.flag == InfoFlag::Unknown) {
                    let rank = lost.to;
                    round.fail(me, DddError::InvalidRank { rank, size });
                }
            }
        }
        if !tree.is_root() {
            tc.concentrate(NOTIFY_UP_TAG, &encode_wave(round.exception, &upward))?;
        }
        log::debug!(
            "notify[{me}]: bottom-up done, {} resolved locally, exception={:?}",
            resolved.len(),
            round.exception
        );

        // --- top-down wave --------------------------------------------------
        if let Some(parent) = tree.parent() {
            let raw = tc.get_spread(NOTIFY_DOWN_TAG)?;
            match decode_wave(parent, size, &raw) {
                Ok((0, recs)) => resolved.extend(recs),
                Ok((code, _)) => round.raise(code),
                Err(e) => round.fail(me, e),
            }
        }

        let mut routed: Vec<(Route, Info)> = Vec::with_capacity(resolved.len());
        if round.exception.is_none() {
            for info in resolved {
                match routing[info.to] {
                    Some(route) => routed.push((route, info)),
                    None => {
                        round.fail(me, DddError::WireFormat {
                            peer: tree.parent().unwrap_or(me),
                            reason: format!(
                                "edge {} -> {} routed into the wrong subtree",
                                info.from, info.to
                            ),
                        });
                        break;
                    }
                }
            }
        }

        if let Some(code) = round.exception {
            let msg = encode_wave(Some(code), &[]);
            for child in tree.children() {
                tc.spread(child, NOTIFY_DOWN_TAG, &msg)?;
            }
            return Err(round
                .failure
                .unwrap_or(DddError::NotifyAborted { code }));
        }

        routed.sort_by_key(|&(route, _)| route);
        let mut per_child: Vec<Vec<Info>> = vec![Vec::new(); tree.n_children()];
        for (route, info) in routed {
            match route {
                Route::Local => self.received.push(NotifyDesc::new(info.from, info.size)),
                Route::Child(slot) => per_child[slot].push(Info {
                    flag: InfoFlag::Known,
                    ..info
                }),
            }
        }
        for (child, slice) in tree.children().zip(&per_child) {
            tc.spread(child, NOTIFY_DOWN_TAG, &encode_wave(None, slice))?;
        }

        self.received.sort_by_key(|d| d.proc);
        log::debug!("notify[{me}]: {} incoming messages", self.received.len());
        Ok(self.received.len())
    }

    fn check_capacity(&self, needed: usize) -> Result<(), DddError> {
        if needed > self.max_infos {
            Err(DddError::NotifyOverflow {
                needed,
                capacity: self.max_infos,
            })
        } else {
            Ok(())
        }
    }
}

/// Exception bookkeeping of one round on one process.
struct RoundState {
    exception: Option<u32>,
    /// First local failure; returned instead of the collective abort.
    failure: Option<DddError>,
}

impl RoundState {
    fn raise(&mut self, code: u32) {
        self.exception = Some(self.exception.map_or(code, |e| e.max(code)));
    }

    fn fail(&mut self, me: usize, err: DddError) {
        log::debug!("notify[{me}]: local failure, aborting round: {err}");
        self.failure.get_or_insert(err);
        self.raise(NOTIFY_FAILURE_EXCEPTION);
    }
}

/// Sort by `(to, from)` and resolve every edge whose destination's dummy is
/// present in the same `to` group.
fn mark_resolved(infos: &mut [Info], me: usize) {
    infos.sort_by_key(|i| (i.to, i.from));
    let lens: Vec<usize> = infos
        .iter()
        .chunk_by(|i| i.to)
        .into_iter()
        .map(|(_, group)| group.count())
        .collect();
    let mut start = 0;
    for len in lens {
        let span = &mut infos[start..start + len];
        start += len;
        let present = span
            .iter()
            .any(|i| i.flag == InfoFlag::Dummy && i.from == i.to);
        if !present {
            continue;
        }
        for info in span.iter_mut().filter(|i| i.flag == InfoFlag::Unknown) {
            info.flag = if info.to == me {
                InfoFlag::Myself
            } else {
                InfoFlag::Known
            };
        }
    }
}

fn encode_wave(exception: Option<u32>, infos: &[Info]) -> Vec<u8> {
    let hdr = match exception {
        Some(code) => WireNotifyHdr::exception(code),
        None => WireNotifyHdr::data(infos.len()),
    };
    let wire: Vec<WireNotifyInfo> = infos.iter().map(|i| i.to_wire()).collect();
    let mut out = Vec::with_capacity(16 + wire.len() * WireNotifyInfo::SIZE);
    out.extend_from_slice(cast_slice(std::slice::from_ref(&hdr)));
    out.extend_from_slice(cast_slice(&wire));
    out
}

fn decode_wave(peer: usize, size: usize, raw: &[u8]) -> Result<(u32, Vec<Info>), DddError> {
    let hdr_len = std::mem::size_of::<WireNotifyHdr>();
    let bad = |reason: String| DddError::WireFormat { peer, reason };
    if raw.len() < hdr_len {
        return Err(bad(format!("notify message of {} bytes has no header", raw.len())));
    }
    let hdr: WireNotifyHdr = bytemuck::pod_read_unaligned(&raw[..hdr_len]);
    if hdr.version() != WIRE_VERSION {
        return Err(bad(format!("notify wire version {}", hdr.version())));
    }
    if hdr.exception_code() != 0 {
        return Ok((hdr.exception_code(), Vec::new()));
    }
    let recs: Vec<WireNotifyInfo> = records_from(&raw[hdr_len..]).map_err(bad)?;
    if recs.len() != hdr.count() {
        return Err(bad(format!(
            "header announces {} records, body holds {}",
            hdr.count(),
            recs.len()
        )));
    }
    recs.iter()
        .map(|w| {
            let (from, to, sz, flag) = w.decode();
            let flag = InfoFlag::from_wire(flag).ok_or_else(|| bad(format!("flag {flag}")))?;
            if from >= size || to >= size {
                return Err(bad(format!("edge {from} -> {to} outside world of {size}")));
            }
            Ok(Info {
                from,
                to,
                size: sz,
                flag,
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|infos| (0, infos))
}
