//! Local object headers and their coupling lists.

use std::fmt::Write as _;

use hashbrown::HashMap;

use crate::ddd_error::DddError;
use crate::objects::gid::{Gid, GidAllocator};
use crate::pool::{Pool, RawHandle};

/// Opaque replica priority (master, border, ghost, ...); only compared.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Priority(pub u8);

/// Opaque object type tag; only transported.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct DddType(pub u16);

/// "This object is also held on `proc`, at priority `prio`."
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Coupling {
    pub proc: usize,
    pub prio: Priority,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ObjectHeader {
    pub gid: Gid,
    pub typ: DddType,
    pub prio: Priority,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjHandle(RawHandle);

#[derive(Debug)]
struct Entry {
    header: ObjectHeader,
    /// Sorted by `proc`, at most one entry per process.
    couplings: Vec<Coupling>,
}

/// All objects held by one process.
#[derive(Debug)]
pub struct ObjectTable {
    rank: usize,
    gids: GidAllocator,
    objs: Pool<Entry>,
    by_gid: HashMap<Gid, ObjHandle>,
    n_coupled: usize,
    n_items: usize,
}

impl ObjectTable {
    pub fn new(rank: usize) -> Result<Self, DddError> {
        Ok(Self {
            rank,
            gids: GidAllocator::new(rank)?,
            objs: Pool::new(),
            by_gid: HashMap::new(),
            n_coupled: 0,
            n_items: 0,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    fn entry(&self, h: ObjHandle) -> Result<&Entry, DddError> {
        self.objs
            .get(h.0)
            .ok_or(DddError::UnknownHandle { kind: "object" })
    }

    fn entry_mut(&mut self, h: ObjHandle) -> Result<&mut Entry, DddError> {
        self.objs
            .get_mut(h.0)
            .ok_or(DddError::UnknownHandle { kind: "object" })
    }

    /// New object with a freshly minted GID.
    pub fn create(&mut self, typ: DddType, prio: Priority) -> Result<ObjHandle, DddError> {
        let gid = self.gids.next_gid()?;
        self.create_with_gid(gid, typ, prio)
    }

    /// New local replica of an object whose GID was minted elsewhere.
    pub fn create_with_gid(
        &mut self,
        gid: Gid,
        typ: DddType,
        prio: Priority,
    ) -> Result<ObjHandle, DddError> {
        if self.by_gid.contains_key(&gid) {
            return Err(DddError::DuplicateGid(gid.get()));
        }
        let h = ObjHandle(self.objs.insert(Entry {
            header: ObjectHeader { gid, typ, prio },
            couplings: Vec::new(),
        }));
        self.by_gid.insert(gid, h);
        Ok(h)
    }

    /// Remove an object together with all of its couplings.
    pub fn delete(&mut self, h: ObjHandle) -> Result<ObjectHeader, DddError> {
        let e = self
            .objs
            .remove(h.0)
            .ok_or(DddError::UnknownHandle { kind: "object" })?;
        self.by_gid.remove(&e.header.gid);
        if !e.couplings.is_empty() {
            self.n_coupled -= 1;
            self.n_items -= e.couplings.len();
        }
        Ok(e.header)
    }

    pub fn header(&self, h: ObjHandle) -> Result<&ObjectHeader, DddError> {
        Ok(&self.entry(h)?.header)
    }

    pub fn set_prio(&mut self, h: ObjHandle, prio: Priority) -> Result<(), DddError> {
        self.entry_mut(h)?.header.prio = prio;
        Ok(())
    }

    /// Insert a coupling, or update its priority. Returns `true` if it is new.
    pub fn add_coupling(
        &mut self,
        h: ObjHandle,
        proc: usize,
        prio: Priority,
    ) -> Result<bool, DddError> {
        if proc == self.rank {
            return Err(DddError::SelfCoupling(proc));
        }
        let e = self.entry_mut(h)?;
        let was_empty = e.couplings.is_empty();
        let added = match e.couplings.binary_search_by_key(&proc, |c| c.proc) {
            Ok(i) => {
                e.couplings[i].prio = prio;
                false
            }
            Err(i) => {
                e.couplings.insert(i, Coupling { proc, prio });
                true
            }
        };
        if added {
            self.n_items += 1;
            if was_empty {
                self.n_coupled += 1;
            }
        }
        Ok(added)
    }

    /// Drop the coupling to `proc`. Returns `true` if one existed.
    pub fn del_coupling(&mut self, h: ObjHandle, proc: usize) -> Result<bool, DddError> {
        let e = self.entry_mut(h)?;
        let Ok(i) = e.couplings.binary_search_by_key(&proc, |c| c.proc) else {
            return Ok(false);
        };
        e.couplings.remove(i);
        let now_empty = e.couplings.is_empty();
        self.n_items -= 1;
        if now_empty {
            self.n_coupled -= 1;
        }
        Ok(true)
    }

    pub fn couplings(&self, h: ObjHandle) -> Result<&[Coupling], DddError> {
        Ok(&self.entry(h)?.couplings)
    }

    pub fn find_gid(&self, gid: Gid) -> Option<ObjHandle> {
        self.by_gid.get(&gid).copied()
    }

    /// Every local object, ordered by GID.
    pub fn sorted_by_gid(&self) -> Vec<ObjHandle> {
        let mut v: Vec<(Gid, ObjHandle)> = self
            .objs
            .iter()
            .map(|(raw, e)| (e.header.gid, ObjHandle(raw)))
            .collect();
        v.sort_unstable_by_key(|&(g, _)| g);
        v.into_iter().map(|(_, h)| h).collect()
    }

    /// Objects with at least one coupling, with their headers and couplings.
    pub fn coupled(&self) -> impl Iterator<Item = (&ObjectHeader, &[Coupling])> + '_ {
        self.objs
            .iter()
            .filter(|(_, e)| !e.couplings.is_empty())
            .map(|(_, e)| (&e.header, e.couplings.as_slice()))
    }

    pub fn n_coupled_objects(&self) -> usize {
        self.n_coupled
    }

    pub fn n_coupling_items(&self) -> usize {
        self.n_items
    }

    /// One line per coupled object, in GID order.
    pub fn list_couplings(&self) -> String {
        let mut out = String::new();
        for h in self.sorted_by_gid() {
            let Ok(e) = self.entry(h) else { continue };
            if e.couplings.is_empty() {
                continue;
            }
            let _ = write!(
                out,
                "{:>4}: gid={} typ={} prio={} ->",
                self.rank, e.header.gid, e.header.typ.0, e.header.prio.0
            );
            for c in &e.couplings {
                let _ = write!(out, " {}/{}", c.proc, c.prio.0);
            }
            out.push('\n');
        }
        out
    }
}
