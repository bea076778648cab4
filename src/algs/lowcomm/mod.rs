//! Typed message transport built on the channel layer.
//!
//! Message types are ordered lists of table and chunk components. Instances
//! are sized, frozen, connected through one notify round, allocated, filled
//! and sent; receives land in one shared buffer per round.

pub mod alloc;
pub mod frame;
pub mod message;
pub mod msg_type;
pub mod transport;

pub use alloc::{BudgetAllocator, BufferAllocator, HeapAllocator};
pub use message::{Direction, MsgHandle, MsgState};
pub use msg_type::{ComponentDesc, ComponentId, ComponentKind, MsgType, MsgTypeId, MAX_COMPONENTS};
pub use transport::{Transport, TransportStats, TRANSPORT_TAG};
