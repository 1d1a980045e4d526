//! Assembly of lock and release groups.
//!
//! A client sends zero or more LOCK (or RELEASE) requests followed by one LOCK_END (or
//! RELEASE_END); the terminator is itself the last member. While a group is open the
//! server only reads requests from the group's sender.

use crate::wire::{FileId, Rank, Request, RequestKind};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Lock,
    Release,
}

impl GroupKind {
    fn of(kind: RequestKind) -> Option<Self> {
        match kind {
            RequestKind::Lock | RequestKind::LockEnd => Some(GroupKind::Lock),
            RequestKind::Release | RequestKind::ReleaseEnd => Some(GroupKind::Release),
            _ => None,
        }
    }
}

/// A fully received group, ready to be evaluated atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedGroup {
    pub kind: GroupKind,
    pub sender: Rank,
    pub file_id: FileId,
    /// Id of the terminator; the single reply carries it.
    pub request_id: u64,
    pub members: Vec<Request>,
    /// More members arrived than the bound allows; `members` is truncated.
    pub overflowed: bool,
    /// Members named more than one file.
    pub mixed_files: bool,
}

#[derive(Debug)]
pub enum Step {
    /// The group is still open.
    Pending,
    Complete(CompletedGroup),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("{kind} is not a lock or release group request")]
    NotGroupRequest { kind: RequestKind },
    #[error("rank {got} sent {kind} while a group from rank {sender} was open")]
    Interleaved {
        sender: Rank,
        got: Rank,
        kind: RequestKind,
    },
}

#[derive(Debug)]
struct OpenGroup {
    kind: GroupKind,
    sender: Rank,
    file_id: FileId,
    members: Vec<Request>,
    overflowed: bool,
    mixed_files: bool,
}

#[derive(Debug)]
pub struct GroupAssembler {
    max_len: usize,
    open: Option<OpenGroup>,
}

impl GroupAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len: max_len.max(1),
            open: None,
        }
    }

    /// Sender the server must restrict its next receive to, if a group is open.
    pub fn expecting(&self) -> Option<Rank> {
        self.open.as_ref().map(|group| group.sender)
    }

    pub fn is_idle(&self) -> bool {
        self.open.is_none()
    }

    /// Feeds one request. On error the open group, if any, is discarded.
    pub fn push(&mut self, request: Request) -> Result<Step, GroupError> {
        let kind = GroupKind::of(request.kind).ok_or(GroupError::NotGroupRequest {
            kind: request.kind,
        });
        let kind = match kind {
            Ok(kind) => kind,
            Err(err) => {
                self.open = None;
                return Err(err);
            }
        };
        let group = self.open.get_or_insert_with(|| OpenGroup {
            kind,
            sender: request.sender_rank,
            file_id: request.file_id,
            members: Vec::new(),
            overflowed: false,
            mixed_files: false,
        });
        if group.sender != request.sender_rank || group.kind != kind {
            let err = GroupError::Interleaved {
                sender: group.sender,
                got: request.sender_rank,
                kind: request.kind,
            };
            self.open = None;
            return Err(err);
        }
        if group.file_id != request.file_id {
            group.mixed_files = true;
        }
        let terminator = request.kind.is_group_terminator();
        let request_id = request.request_id;
        if group.members.len() < self.max_len {
            group.members.push(request);
        } else {
            group.overflowed = true;
        }
        if !terminator {
            return Ok(Step::Pending);
        }
        let Some(group) = self.open.take() else {
            return Ok(Step::Pending);
        };
        Ok(Step::Complete(CompletedGroup {
            kind: group.kind,
            sender: group.sender,
            file_id: group.file_id,
            request_id,
            members: group.members,
            overflowed: group.overflowed,
            mixed_files: group.mixed_files,
        }))
    }
}
