//! DddError: unified error type for the distributed dynamic-data substrate.
//!
//! Errors fall into four families: resource exhaustion (recovered locally where
//! possible), protocol violations (fatal for the current round), collective
//! exceptions (seen identically by every participant of a notify round) and
//! API misuse. Consistency mismatches are *not* errors; they are counted.

use thiserror::Error;

/// Unified error type for mesh-ddd operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DddError {
    /// The buffer allocator refused a request and no in-flight send could be reclaimed.
    #[error("out of memory: could not allocate {requested} bytes for message buffer")]
    OutOfMemory { requested: usize },

    /// A received header does not match the locally registered message type.
    #[error(
        "protocol violation from rank {peer}: header (magic {magic:#x}, {components} components) does not match type `{type_name}`"
    )]
    HeaderMismatch {
        peer: usize,
        type_name: String,
        magic: usize,
        components: usize,
    },

    /// A received buffer is too short or describes components outside its bounds.
    #[error("malformed wire data from rank {peer}: {reason}")]
    WireFormat { peer: usize, reason: String },

    /// The notify info buffer would exceed its configured capacity.
    #[error("notify info buffer overflow: {needed} entries exceed capacity {capacity}")]
    NotifyOverflow { needed: usize, capacity: usize },

    /// Some participant aborted the notify round with an exception code.
    #[error("notify round aborted with exception code {code}")]
    NotifyAborted { code: u32 },

    /// A point-to-point transfer failed.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },

    /// A rank outside `0..size`.
    #[error("rank {rank} out of range for communicator of size {size}")]
    InvalidRank { rank: usize, size: usize },

    /// A message type already carries the maximum number of components.
    #[error("message type `{type_name}` exceeds the maximum of {max} components")]
    TooManyComponents { type_name: String, max: usize },

    /// A handle no longer refers to a live object (released or never issued).
    #[error("stale or unknown {kind} handle")]
    UnknownHandle { kind: &'static str },

    /// The component id does not belong to the message's type, or has the wrong kind.
    #[error("component {component} is not a {expected} of message type `{type_name}`")]
    BadComponent {
        component: usize,
        expected: &'static str,
        type_name: String,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: expected {expected}, found {found}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    /// A table can only shrink after allocation.
    #[error("cannot grow table from {current} to {requested} entries after allocation")]
    TableGrow { current: usize, requested: usize },

    /// Typed access with a record size that does not fit the component.
    #[error("record size mismatch: {len} bytes accessed as {record}-byte records")]
    RecordSize { len: usize, record: usize },

    /// Two outgoing messages to the same destination in one connect round.
    #[error("more than one outgoing message to rank {dest} in a single connect round")]
    DuplicateSend { dest: usize },

    /// Connect was asked for a type that differs from a queued send.
    #[error("queued send of type `{found}` cannot be connected as `{expected}`")]
    ConnectTypeMismatch { expected: String, found: String },

    /// The per-rank GID counter is exhausted.
    #[error("global identifier space exhausted on rank {rank}")]
    GidExhausted { rank: usize },

    /// An object with this GID already exists locally.
    #[error("duplicate global identifier {0:#x}")]
    DuplicateGid(u64),

    /// A process cannot couple an object to itself.
    #[error("coupling to own rank {0} is not allowed")]
    SelfCoupling(usize),

    /// Polling was cancelled through the context's cancel flag.
    #[error("polling cancelled")]
    Cancelled,

    /// Polling exceeded the configured timeout.
    #[error("polling timed out after {millis} ms")]
    Timeout { millis: u128 },

    /// Configuration rejected by `DddConfig::validate`.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DddError {
    /// Protocol violations indicate a declaration/topology mismatch between
    /// processes and cannot be recovered locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DddError::HeaderMismatch { .. }
                | DddError::WireFormat { .. }
                | DddError::NotifyOverflow { .. }
        )
    }
}
