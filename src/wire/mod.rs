//! Request/reply records exchanged between clients and the set-aside process.
//!
//! Every record is a fixed-size little-endian frame led by a version byte. Metadata
//! payloads never ride inside a record; they follow on the METADATA (or DUMP) channel as
//! a separate message of exactly `payload_size` bytes.

mod codec;
pub mod reply;
pub mod request;
pub mod types;

pub use reply::{
    AllocReply, ReadReply, Reply, ALLOC_REPLY_FRAME_LEN, READ_REPLY_FRAME_LEN, REPLY_FRAME_LEN,
};
pub use request::{OpenParams, Request, REQUEST_FRAME_LEN};
pub use types::{
    FeatureFlags, FileId, LockKind, MemKind, ObjectId, ObjectKind, Rank, RequestKey,
    RequestKind, Status, OBJECT_ID_LEN,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame truncated (expected {expected} bytes, observed {observed})")]
    Truncated { expected: usize, observed: usize },
    #[error("{record} frame carries {extra} trailing bytes")]
    TrailingBytes { record: &'static str, extra: usize },
    #[error("unsupported {record} version {observed} (expected {expected})")]
    InvalidVersion {
        record: &'static str,
        observed: u8,
        expected: u8,
    },
    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u8 },
    #[error("object id too long ({len} bytes)")]
    ObjectIdTooLong { len: usize },
    #[error("payload length mismatch (announced {announced}, received {received})")]
    PayloadLength { announced: u64, received: usize },
}
