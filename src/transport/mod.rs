//! Point-to-point, ordered message passing between a fixed group of ranks.
//!
//! The protocol layers only see the [`Transport`] trait. Backends differ in how bytes move
//! (in-process mailboxes, a TCP mesh) but all deliver into a [`Mailbox`] that supports
//! selective receive by source and channel, preserving per-sender order.

pub mod collective;
pub mod local;
#[cfg(feature = "net")]
pub mod tcp;

pub use collective::barrier;
pub use local::{LocalFabric, LocalTransport};
#[cfg(feature = "net")]
pub use tcp::{MeshConfig, MeshPeer, TcpTransport, TcpTransportOptions};

use crate::wire::Rank;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Typed message channels. A receive names exactly one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Request,
    Reply,
    ReadReply,
    Metadata,
    AllocReply,
    Dump,
    FileId,
    Barrier,
}

impl Channel {
    pub const fn code(self) -> u8 {
        match self {
            Channel::Request => 1,
            Channel::Reply => 2,
            Channel::ReadReply => 3,
            Channel::Metadata => 4,
            Channel::AllocReply => 5,
            Channel::Dump => 6,
            Channel::FileId => 7,
            Channel::Barrier => 8,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Channel::Request),
            2 => Some(Channel::Reply),
            3 => Some(Channel::ReadReply),
            4 => Some(Channel::Metadata),
            5 => Some(Channel::AllocReply),
            6 => Some(Channel::Dump),
            7 => Some(Channel::FileId),
            8 => Some(Channel::Barrier),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Channel::Request => "REQUEST",
            Channel::Reply => "REPLY",
            Channel::ReadReply => "READ_REPLY",
            Channel::Metadata => "METADATA",
            Channel::AllocReply => "ALLOC_REPLY",
            Channel::Dump => "DUMP",
            Channel::FileId => "FILE_ID",
            Channel::Barrier => "BARRIER",
        };
        f.write_str(label)
    }
}

/// Which sender a receive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Any,
    Rank(Rank),
}

impl Source {
    fn matches(self, rank: Rank) -> bool {
        match self {
            Source::Any => true,
            Source::Rank(expected) => expected == rank,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub source: Rank,
    pub channel: Channel,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("rank {rank} outside group of {size}")]
    UnknownRank { rank: Rank, size: u32 },
    #[error("peer {rank} disconnected")]
    PeerDisconnected { rank: Rank },
    #[error("transport closed")]
    Closed,
    #[error("receive on {channel} timed out after {waited:?}")]
    Timeout { channel: Channel, waited: Duration },
    #[error("malformed frame from {peer}: {reason}")]
    MalformedFrame { peer: String, reason: String },
    #[error("mesh setup failed: {0}")]
    Setup(String),
}

/// Blocking point-to-point message passing. Implementations must keep messages from one
/// sender to one receiver in send order.
pub trait Transport: Send + Sync {
    fn rank(&self) -> Rank;

    fn size(&self) -> u32;

    fn send(&self, dest: Rank, channel: Channel, payload: &[u8]) -> Result<(), TransportError>;

    fn recv(&self, source: Source, channel: Channel) -> Result<Envelope, TransportError>;

    fn recv_from(&self, source: Rank, channel: Channel) -> Result<Vec<u8>, TransportError> {
        self.recv(Source::Rank(source), channel)
            .map(|envelope| envelope.payload)
    }
}

#[derive(Debug, Default)]
struct MailboxState {
    queue: VecDeque<Envelope>,
    disconnected: BTreeSet<Rank>,
    closed: bool,
}

/// Receive queue shared by every backend.
#[derive(Debug)]
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
    group_size: u32,
    owner: Rank,
    recv_timeout: Option<Duration>,
}

impl Mailbox {
    pub(crate) fn new(owner: Rank, group_size: u32, recv_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(MailboxState::default()),
            ready: Condvar::new(),
            group_size,
            owner,
            recv_timeout,
        }
    }

    pub(crate) fn deliver(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        state.queue.push_back(envelope);
        self.ready.notify_all();
    }

    pub(crate) fn mark_disconnected(&self, rank: Rank) {
        let mut state = self.state.lock();
        state.disconnected.insert(rank);
        self.ready.notify_all();
    }

    pub(crate) fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.ready.notify_all();
    }

    /// Removes the oldest envelope matching `source` and `channel`, blocking until one
    /// arrives, the awaited peer(s) disconnect, or the receive timeout elapses.
    pub(crate) fn take(&self, source: Source, channel: Channel) -> Result<Envelope, TransportError> {
        let started = Instant::now();
        let deadline = self.recv_timeout.map(|timeout| started + timeout);
        let mut state = self.state.lock();
        loop {
            if let Some(position) = state
                .queue
                .iter()
                .position(|envelope| envelope.channel == channel && source.matches(envelope.source))
            {
                if let Some(envelope) = state.queue.remove(position) {
                    return Ok(envelope);
                }
            }
            if state.closed {
                return Err(TransportError::Closed);
            }
            match source {
                Source::Rank(rank) if state.disconnected.contains(&rank) => {
                    return Err(TransportError::PeerDisconnected { rank });
                }
                Source::Any => {
                    let peers = self.group_size.saturating_sub(1) as usize;
                    let gone = state
                        .disconnected
                        .iter()
                        .filter(|rank| **rank != self.owner)
                        .count();
                    if peers > 0 && gone >= peers {
                        return Err(TransportError::Closed);
                    }
                }
                _ => {}
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out() {
                        return Err(TransportError::Timeout {
                            channel,
                            waited: started.elapsed(),
                        });
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    pub(crate) fn group_size(&self) -> u32 {
        self.group_size
    }
}
