//! `Gid`: the global identifier of a replicated object
//!
//! Every logical object distributed across processes carries one 64-bit
//! identifier that is identical on every replica and never changes.
//!
//! Identifiers are minted locally without communication: the creating
//! process's rank fills the high bits and a per-process counter the low
//! bits, so two processes can never produce the same value.
//!
//! ```text
//!  63            40 39                               0
//! +----------------+----------------------------------+
//! |  rank (24 bit) |       counter (40 bit)           |
//! +----------------+----------------------------------+
//! ```

use std::fmt;

use crate::ddd_error::DddError;

pub const GID_RANK_BITS: u32 = 24;
pub const GID_COUNTER_BITS: u32 = 40;

/// Exclusive upper bound on ranks that can mint identifiers.
pub const MAX_GID_RANKS: usize = 1 << GID_RANK_BITS;
const COUNTER_LIMIT: u64 = 1 << GID_COUNTER_BITS;

/// Global object identifier.
///
/// # Memory layout
/// `repr(transparent)` over `u64`, so it travels in wire records as a plain
/// integer.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Gid(u64);

impl Gid {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Gid(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Rank that minted this identifier.
    #[inline]
    pub const fn origin_rank(self) -> usize {
        (self.0 >> GID_COUNTER_BITS) as usize
    }

    #[inline]
    pub const fn counter(self) -> u64 {
        self.0 & (COUNTER_LIMIT - 1)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Gid").field(&format_args!("{:#x}", self.0)).finish()
    }
}

/// Prints `rank:counter`, which is easier to read in diagnostics than the raw word.
impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.origin_rank(), self.counter())
    }
}

/// Per-process source of fresh identifiers.
#[derive(Clone, Debug)]
pub struct GidAllocator {
    rank: usize,
    next: u64,
}

impl GidAllocator {
    pub fn new(rank: usize) -> Result<Self, DddError> {
        if rank >= MAX_GID_RANKS {
            return Err(DddError::InvalidRank {
                rank,
                size: MAX_GID_RANKS,
            });
        }
        Ok(Self { rank, next: 0 })
    }

    pub fn next_gid(&mut self) -> Result<Gid, DddError> {
        if self.next >= COUNTER_LIMIT {
            return Err(DddError::GidExhausted { rank: self.rank });
        }
        let gid = Gid(((self.rank as u64) << GID_COUNTER_BITS) | self.next);
        self.next += 1;
        Ok(gid)
    }

    /// Number of identifiers handed out so far.
    pub fn issued(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod layout_tests {
    use super::*;
    use static_assertions::assert_eq_size;

    // wire records carry the raw word
    assert_eq_size!(Gid, u64);
}
