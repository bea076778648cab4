//! Fixed, versioned, little-endian wire records for the notify and
//! consistency paths.
//!
//! The typed message transport frames its buffers in native machine words
//! (see [`crate::algs::lowcomm::frame`]); the records here are the payloads
//! that travel inside tree collectives and consistency tables.

use bytemuck::{Pod, Zeroable};
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Copy records out of an arbitrarily aligned byte slice.
pub fn records_from<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    let rec = size_of::<T>();
    if rec == 0 || bytes.len() % rec != 0 {
        return Err(format!(
            "{} bytes is not a whole number of {rec}-byte records",
            bytes.len()
        ));
    }
    Ok(bytes.chunks_exact(rec).map(bytemuck::pod_read_unaligned).collect())
}

pub fn expect_exact_len(actual: usize, expected: usize) -> Result<(), String> {
    if actual == expected {
        Ok(())
    } else {
        Err(format!("expected {expected} bytes, got {actual}"))
    }
}

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

// ===== Common records ======================================================

/// Length prefix of a framed tree message.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireLen {
    pub n_le: u64,
}
impl WireLen {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.n_le) as usize
    }
}

/// A signed 64-bit scalar, used by tree reductions.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireI64 {
    pub v_le: i64,
}
impl WireI64 {
    pub fn new(v: i64) -> Self {
        Self { v_le: v.to_le() }
    }
    pub fn get(&self) -> i64 {
        i64::from_le(self.v_le)
    }
}

// ===== Notify ==============================================================

/// Header of every notify wave message.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireNotifyHdr {
    pub version_le: u16,
    pub _pad: u16,
    /// 0 = data follows; otherwise the exception code of an aborted round.
    pub exception_le: u32,
    pub count_le: u32,
    pub _pad2: u32,
}
impl WireNotifyHdr {
    pub fn data(count: usize) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            _pad: 0,
            exception_le: 0,
            count_le: (count as u32).to_le(),
            _pad2: 0,
        }
    }
    pub fn exception(code: u32) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            _pad: 0,
            exception_le: code.to_le(),
            count_le: 0,
            _pad2: 0,
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn exception_code(&self) -> u32 {
        u32::from_le(self.exception_le)
    }
    pub fn count(&self) -> usize {
        u32::from_le(self.count_le) as usize
    }
}

/// One communication edge `from -> to` of `size` bytes.
/// NOTE: ranks are u32 (never usize) on the wire.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WireNotifyInfo {
    pub from_le: u32,
    pub to_le: u32,
    pub size_le: u64,
    pub flag_le: u32,
    pub _pad: u32,
}
impl WireNotifyInfo {
    pub const SIZE: usize = 24;
    pub fn new(from: usize, to: usize, size: usize, flag: u32) -> Self {
        Self {
            from_le: (from as u32).to_le(),
            to_le: (to as u32).to_le(),
            size_le: (size as u64).to_le(),
            flag_le: flag.to_le(),
            _pad: 0,
        }
    }
    pub fn decode(&self) -> (usize, usize, usize, u32) {
        (
            u32::from_le(self.from_le) as usize,
            u32::from_le(self.to_le) as usize,
            u64::from_le(self.size_le) as usize,
            u32::from_le(self.flag_le),
        )
    }
}

// ===== Consistency check ===================================================

/// "Object `gid` of type `typ` is held on `proc` at `prio`", addressed to `dest`.
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable, Debug, PartialEq, Eq)]
pub struct WireConsEntry {
    pub gid_le: u64,
    pub dest_le: u32,
    pub proc_le: u32,
    pub typ_le: u16,
    pub prio: u8,
    pub _pad: [u8; 5],
}
impl WireConsEntry {
    pub const SIZE: usize = 24;
    pub fn new(gid: u64, typ: u16, dest: usize, proc: usize, prio: u8) -> Self {
        Self {
            gid_le: gid.to_le(),
            dest_le: (dest as u32).to_le(),
            proc_le: (proc as u32).to_le(),
            typ_le: typ.to_le(),
            prio,
            _pad: [0; 5],
        }
    }
    pub fn gid(&self) -> u64 {
        u64::from_le(self.gid_le)
    }
    pub fn typ(&self) -> u16 {
        u16::from_le(self.typ_le)
    }
    pub fn dest(&self) -> usize {
        u32::from_le(self.dest_le) as usize
    }
    pub fn proc(&self) -> usize {
        u32::from_le(self.proc_le) as usize
    }
}

// ===== Compile-time sanity checks =========================================

const _: () = {
    // Pod/Zeroable ensures no padding contains uninit when cast to bytes.
    assert!(size_of::<WireLen>() == 8);
    assert!(size_of::<WireI64>() == 8);
    assert!(size_of::<WireNotifyHdr>() == 16);
    assert!(size_of::<WireNotifyInfo>() == WireNotifyInfo::SIZE);
    assert!(align_of::<WireNotifyInfo>() == 8);
    assert!(size_of::<WireConsEntry>() == WireConsEntry::SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_info_decodes_fields() {
        let v = vec![WireNotifyInfo::new(3, 7, 640, 2)];
        let bytes: Vec<u8> = cast_slice(&v).to_vec();
        let out: Vec<WireNotifyInfo> = records_from(&bytes).unwrap();
        assert_eq!(out[0].decode(), (3, 7, 640, 2));
    }

    #[test]
    fn records_from_unaligned_slice() {
        let e = WireConsEntry::new(0xABCD, 4, 1, 2, 9);
        let mut bytes = vec![0u8; 1];
        bytes.extend_from_slice(cast_slice(&[e]));
        let out: Vec<WireConsEntry> = records_from(&bytes[1..]).unwrap();
        assert_eq!(out, vec![e]);
        assert_eq!(out[0].gid(), 0xABCD);
        assert_eq!(out[0].typ(), 4);
        assert_eq!((out[0].dest(), out[0].proc()), (1, 2));
    }

    #[test]
    fn records_from_rejects_partial_record() {
        assert!(records_from::<WireLen>(&[0u8; 12]).is_err());
    }

    #[test]
    fn version_guard() {
        let hdr = WireNotifyHdr::exception(5);
        assert_eq!(hdr.version(), WIRE_VERSION);
        assert_eq!(hdr.exception_code(), 5);
        assert_eq!(hdr.count(), 0);
    }
}
