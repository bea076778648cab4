//! Message instances and their lifecycle.

use crate::algs::communicator::Communicator;
use crate::algs::lowcomm::frame::ChunkDesc;
use crate::algs::lowcomm::msg_type::MsgTypeId;
use crate::ddd_error::DddError;
use crate::pool::RawHandle;

/// `New -> Freezed -> Allocated -> InFlight -> Ready`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgState {
    /// Sizes may still change.
    New,
    /// Sizes and offsets fixed; buffer size known.
    Freezed,
    /// Buffer owned, header written.
    Allocated,
    /// Handed to the channel layer.
    InFlight,
    /// Transfer complete.
    Ready,
}

impl MsgState {
    pub fn name(self) -> &'static str {
        match self {
            MsgState::New => "NEW",
            MsgState::Freezed => "FREEZED",
            MsgState::Allocated => "ALLOCATED",
            MsgState::InFlight => "IN-FLIGHT",
            MsgState::Ready => "READY",
        }
    }

    pub(crate) fn expect(self, expected: MsgState) -> Result<(), DddError> {
        if self == expected {
            Ok(())
        } else {
            Err(DddError::InvalidState {
                expected: expected.name(),
                found: self.name(),
            })
        }
    }
}

/// Handle of a send or receive instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MsgHandle(pub(crate) RawHandle);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

pub(crate) struct Message<C: Communicator> {
    pub msg_type: MsgTypeId,
    pub peer: usize,
    pub dir: Direction,
    pub state: MsgState,
    pub chunks: Vec<ChunkDesc>,
    pub buffer_size: usize,
    /// Owned buffer of a send; empty for receives.
    pub buffer: Vec<u8>,
    /// Position of a receive inside the shared receive buffer.
    pub recv_offset: usize,
    pub pending_send: Option<C::SendHandle>,
    pub pending_recv: Option<C::RecvHandle>,
}

impl<C: Communicator> Message<C> {
    pub fn outgoing(msg_type: MsgTypeId, peer: usize, n_components: usize) -> Self {
        Self {
            msg_type,
            peer,
            dir: Direction::Send,
            state: MsgState::New,
            chunks: vec![ChunkDesc::default(); n_components],
            buffer_size: 0,
            buffer: Vec::new(),
            recv_offset: 0,
            pending_send: None,
            pending_recv: None,
        }
    }

    pub fn incoming(msg_type: MsgTypeId, peer: usize, size: usize, recv_offset: usize) -> Self {
        Self {
            msg_type,
            peer,
            dir: Direction::Recv,
            state: MsgState::Freezed,
            chunks: Vec::new(),
            buffer_size: size,
            buffer: Vec::new(),
            recv_offset,
            pending_send: None,
            pending_recv: None,
        }
    }
}
