//! Replicated objects: global identifiers, headers and coupling lists.
//!
//! A coupling records that an object held here is also replicated on another
//! process, and at which priority that replica is held there.

pub mod gid;
pub mod table;

pub use gid::{Gid, GidAllocator};
pub use table::{Coupling, DddType, ObjHandle, ObjectHeader, ObjectTable, Priority};
