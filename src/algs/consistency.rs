//! Global consistency check of the coupling lists.
//!
//! Every process tells each coupled neighbour what it believes about their
//! shared objects; the neighbour compares those records against its own
//! table. Only the receiving side validates a record, so a coupling present
//! on one side only is reported exactly once. Per-process error counts are
//! summed over the spanning tree.
//!
//! Record kinds, distinguished by `proc` relative to sender and receiver:
//!
//! | `proc`   | meaning                                    | receiver checks                  |
//! |----------|--------------------------------------------|----------------------------------|
//! | receiver | "you hold `gid` at `prio`"                 | object exists, type and priority |
//! | sender   | "I hold `gid` at `prio`"                   | coupling back to the sender      |
//! | other    | "a third process holds it" (strict only)   | coupling to that process         |

use std::collections::BTreeMap;

use crate::algs::communicator::Communicator;
use crate::algs::lowcomm::{ComponentId, MsgTypeId, Transport};
use crate::algs::notify::Notify;
use crate::algs::tree::TreeComm;
use crate::algs::wire::WireConsEntry;
use crate::ddd_error::DddError;
use crate::objects::{Gid, ObjHandle, ObjectTable};

/// Exception code used to abort the round when the transport is not idle.
pub const CONS_BUSY_EXCEPTION: u32 = 0xC0C0;

/// The registered "cons-check" message type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ConsCheckMsg {
    ty: MsgTypeId,
    entries: ComponentId,
}

impl ConsCheckMsg {
    pub const NAME: &'static str = "cons-check";

    pub fn declare<C: Communicator>(transport: &mut Transport<C>) -> Result<Self, DddError> {
        let ty = transport.declare_type(Self::NAME);
        let entries = transport.add_table(ty, "entries", WireConsEntry::SIZE)?;
        Ok(Self { ty, entries })
    }
}

/// Outcome of one check on this process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    pub local_errors: usize,
    pub total_errors: usize,
    pub diagnostics: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.total_errors == 0
    }
}

pub struct ConsistencyChecker<'a, C: Communicator> {
    comm: &'a C,
    notify: &'a mut Notify,
    transport: &'a mut Transport<C>,
    objects: &'a ObjectTable,
    msg: ConsCheckMsg,
    degree: usize,
    strict: bool,
}

impl<'a, C: Communicator> ConsistencyChecker<'a, C> {
    pub fn new(
        comm: &'a C,
        notify: &'a mut Notify,
        transport: &'a mut Transport<C>,
        objects: &'a ObjectTable,
        msg: ConsCheckMsg,
    ) -> Self {
        Self {
            comm,
            notify,
            transport,
            objects,
            msg,
            degree: 2,
            strict: false,
        }
    }

    pub fn tree_degree(mut self, degree: usize) -> Self {
        self.degree = degree.max(1);
        self
    }

    /// Also cross-check every pair of couplings on the same object.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Collective. Returns the global number of mismatches.
    pub fn run(self) -> Result<usize, DddError> {
        Ok(self.run_report()?.total_errors)
    }

    /// Collective. Like [`run`](Self::run) but keeps the local diagnostics.
    pub fn run_report(mut self) -> Result<ConsistencyReport, DddError> {
        let me = self.comm.rank();
        if self.transport.n_sends() != 0 || self.transport.n_recvs() != 0 {
            // Keep the other processes from waiting on a round we cannot join.
            self.notify.begin(0);
            self.notify.raise(CONS_BUSY_EXCEPTION);
            match self.notify.notify_with(self.comm, &self.transport.poll_guard()) {
                Err(DddError::NotifyAborted { .. }) => {}
                other => log::debug!("cons-check[{me}]: busy abort round ended with {other:?}"),
            }
            self.notify.end();
            return Err(DddError::InvalidState {
                expected: "idle transport",
                found: "queued messages",
            });
        }

        let outgoing = self.collect_records(me);
        let received = self.exchange(&outgoing);
        self.transport.cleanup();
        let received = received?;

        let mut report = ConsistencyReport::default();
        self.validate(me, received, &mut report.diagnostics);
        report.local_errors = report.diagnostics.len();
        let total = TreeComm::new(self.comm, self.degree)
            .with_guard(self.transport.poll_guard())
            .global_sum(report.local_errors as i64)?;
        report.total_errors = usize::try_from(total).unwrap_or_default();
        log::debug!(
            "cons-check[{me}]: {} local, {} global mismatches",
            report.local_errors,
            report.total_errors
        );
        Ok(report)
    }

    /// Records grouped by destination process.
    fn collect_records(&self, me: usize) -> BTreeMap<usize, Vec<WireConsEntry>> {
        let mut out: BTreeMap<usize, Vec<WireConsEntry>> = BTreeMap::new();
        for (hdr, cpls) in self.objects.coupled() {
            let (gid, typ) = (hdr.gid.get(), hdr.typ.0);
            for c in cpls {
                let recs = out.entry(c.proc).or_default();
                recs.push(WireConsEntry::new(gid, typ, c.proc, c.proc, c.prio.0));
                recs.push(WireConsEntry::new(gid, typ, c.proc, me, hdr.prio.0));
                if self.strict {
                    for other in cpls.iter().filter(|o| o.proc != c.proc) {
                        recs.push(WireConsEntry::new(gid, typ, c.proc, other.proc, other.prio.0));
                    }
                }
            }
        }
        out
    }

    /// One connect/communicate round; returns `(sender, record)` pairs.
    fn exchange(
        &mut self,
        outgoing: &BTreeMap<usize, Vec<WireConsEntry>>,
    ) -> Result<Vec<(usize, WireConsEntry)>, DddError> {
        let ConsCheckMsg { ty, entries } = self.msg;
        let mut sends = Vec::with_capacity(outgoing.len());
        for (&dest, recs) in outgoing {
            let h = self.transport.new_send(ty, dest)?;
            self.transport.set_table_size(h, entries, recs.len())?;
            self.transport.freeze(h)?;
            sends.push((h, recs));
        }
        self.transport.connect(self.comm, self.notify, ty)?;
        for (h, recs) in sends {
            self.transport.allocate(h)?;
            self.transport.write_table(h, entries, recs)?;
            self.transport.send(self.comm, h)?;
        }
        let mut received = Vec::new();
        for h in self.transport.communicate()? {
            let from = self.transport.peer(h)?;
            received.extend(
                self.transport
                    .read_table::<WireConsEntry>(h, entries)?
                    .into_iter()
                    .map(|r| (from, r)),
            );
        }
        Ok(received)
    }

    /// Match the received records against the local table in GID order.
    fn validate(&self, me: usize, mut received: Vec<(usize, WireConsEntry)>, diag: &mut Vec<String>) {
        received.sort_by_key(|(from, r)| (r.gid(), *from, r.proc()));
        let local: Vec<(Gid, ObjHandle)> = self
            .objects
            .sorted_by_gid()
            .into_iter()
            .filter_map(|h| self.objects.header(h).ok().map(|hdr| (hdr.gid, h)))
            .collect();

        let mut cursor = 0;
        for (from, rec) in received {
            let gid = Gid::new(rec.gid());
            while cursor < local.len() && local[cursor].0 < gid {
                cursor += 1;
            }
            let found = local.get(cursor).filter(|(g, _)| *g == gid).map(|&(_, h)| h);
            if let Some(msg) = self.check_record(me, from, &rec, found) {
                log::warn!("cons-check[{me}]: {msg}");
                diag.push(msg);
            }
        }
    }

    fn check_record(
        &self,
        me: usize,
        from: usize,
        rec: &WireConsEntry,
        found: Option<ObjHandle>,
    ) -> Option<String> {
        let gid = Gid::new(rec.gid());
        let proc = rec.proc();
        if rec.dest() != me {
            return Some(format!("gid {gid} from {from}: record addressed to {}", rec.dest()));
        }
        let h = match found {
            Some(h) => h,
            None if proc == me => {
                return Some(format!("gid {gid} from {from}: no local object, peer couples it here"));
            }
            // Absence is reported once, by the record naming this process.
            None => return None,
        };
        if proc == me {
            let hdr = self.objects.header(h).ok()?;
            if hdr.typ.0 != rec.typ() {
                return Some(format!(
                    "gid {gid} from {from}: local type {}, peer expects {}",
                    hdr.typ.0,
                    rec.typ()
                ));
            }
            if hdr.prio.0 != rec.prio {
                return Some(format!(
                    "gid {gid} from {from}: local prio {}, peer expects {}",
                    hdr.prio.0, rec.prio
                ));
            }
            return None;
        }
        let cpl = self
            .objects
            .couplings(h)
            .ok()?
            .iter()
            .find(|c| c.proc == proc)
            .copied();
        let what = if proc == from { "back to sender" } else { "to third process" };
        match cpl {
            None => Some(format!("gid {gid} from {from}: no coupling {what} {proc}")),
            Some(c) if c.prio.0 != rec.prio => Some(format!(
                "gid {gid} from {from}: coupling {what} {proc} has prio {}, peer says {}",
                c.prio.0, rec.prio
            )),
            Some(_) => None,
        }
    }
}
