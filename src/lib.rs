#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-ddd
//!
//! mesh-ddd is the communication core of a distributed grid manager: it moves typed, framed messages between SPMD processes, discovers who sends to whom without an all-to-all exchange, and checks that the replica bookkeeping of every process agrees with its neighbours.
//!
//! ## Features
//! - Typed message transport: message types made of table and chunk components, framed buffers, non-blocking send/receive queues
//! - Topology notification over a degree-bounded spanning tree (O(N) messages per round), with collective abort
//! - Global consistency check of object couplings, summed across all processes
//! - Pluggable communication backends (in-process [`LocalComm`](algs::communicator::LocalComm) worlds, MPI behind `mpi-support`)
//! - Pluggable buffer allocators with low-memory backoff
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-ddd = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! Every process builds one [`DddContext`](context::DddContext), declares the
//! same message types in the same order, and then runs rounds of
//! `new_send` / `freeze` / `connect` / `prepare_send` / `send` / `communicate` / `cleanup`.
//!
//! ## Determinism
//!
//! Given the same declared edges, a notify round discovers the same set of
//! receives on every run, and each process sees its receives ordered by
//! source rank. Arrival order between independent peers is not specified.

pub mod algs;
pub mod config;
pub mod context;
pub mod ddd_error;
pub mod objects;
pub mod pool;

pub use context::DddContext;
pub use ddd_error::DddError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm, Wait};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::consistency::{ConsistencyChecker, ConsistencyReport};
    pub use crate::algs::lowcomm::{
        BudgetAllocator, BufferAllocator, ComponentId, HeapAllocator, MsgHandle, MsgState,
        MsgTypeId, Transport,
    };
    pub use crate::algs::notify::{Notify, NotifyDesc};
    pub use crate::config::DddConfig;
    pub use crate::context::DddContext;
    pub use crate::ddd_error::DddError;
    pub use crate::objects::{Coupling, DddType, Gid, ObjHandle, ObjectTable, Priority};
}
