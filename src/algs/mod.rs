//! Re-export public algorithms.

pub mod communicator;
pub mod consistency;
pub mod lowcomm;
pub mod notify;
pub mod tree;
pub mod wire;

pub use consistency::ConsistencyChecker;
pub use notify::{Notify, NotifyDesc};
pub use tree::{SpanningTree, TreeComm};
