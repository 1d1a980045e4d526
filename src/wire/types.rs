use serde::{Deserialize, Serialize};
use std::fmt;

use super::WireError;

/// Rank of a participating process inside the service's communication group.
pub type Rank = u32;

/// Server-assigned handle for an open file. Zero never names a file.
pub type FileId = u32;

/// Size of the opaque object reference carried by lock requests.
pub const OBJECT_ID_LEN: usize = 16;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $record:literal {
            $($variant:ident = $code:literal => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub const fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: u8) -> Result<Self, WireError> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(WireError::UnknownCode {
                        field: $record,
                        code: other,
                    }),
                }
            }

            pub const fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.label())
            }
        }
    };
}

wire_enum! {
    /// What a request asks the SAP to do.
    RequestKind, "request_kind" {
        Open = 1 => "OPEN",
        Lock = 2 => "LOCK",
        LockEnd = 3 => "LOCK_END",
        Release = 4 => "RELEASE",
        ReleaseEnd = 5 => "RELEASE_END",
        Write = 6 => "WRITE",
        Read = 7 => "READ",
        Flush = 8 => "FLUSH",
        Close = 9 => "CLOSE",
        Stop = 10 => "STOP",
        Alloc = 11 => "ALLOC",
        Free = 12 => "FREE",
    }
}

impl RequestKind {
    /// Members of a lock group other than the terminator.
    pub fn is_group_member(self) -> bool {
        matches!(self, RequestKind::Lock | RequestKind::Release)
    }

    pub fn is_group_terminator(self) -> bool {
        matches!(self, RequestKind::LockEnd | RequestKind::ReleaseEnd)
    }
}

wire_enum! {
    /// Kind of storage object a lock or modification refers to.
    ObjectKind, "object_kind" {
        File = 0 => "FILE",
        Group = 1 => "GROUP",
        Dataset = 2 => "DATASET",
        Datatype = 3 => "DATATYPE",
        Attribute = 4 => "ATTRIBUTE",
        Memory = 5 => "MEMORY",
    }
}

wire_enum! {
    LockKind, "lock_kind" {
        Read = 0 => "READ",
        Write = 1 => "WRITE",
    }
}

wire_enum! {
    /// Classification of file bytes. Only `Draw` is raw data; every other kind is metadata.
    MemKind, "mem_kind" {
        Default = 0 => "DEFAULT",
        Super = 1 => "SUPER",
        Btree = 2 => "BTREE",
        Draw = 3 => "DRAW",
        Gheap = 4 => "GHEAP",
        Lheap = 5 => "LHEAP",
        Ohdr = 6 => "OHDR",
    }
}

impl MemKind {
    pub fn is_raw(self) -> bool {
        self == MemKind::Draw
    }

    pub fn is_metadata(self) -> bool {
        !self.is_raw()
    }
}

wire_enum! {
    /// Outcome carried on every reply record.
    Status, "status" {
        Ok = 0 => "OK",
        LockAcquired = 1 => "LOCK_ACQUIRED",
        LockFailed = 2 => "LOCK_FAILED",
        LockReleased = 3 => "LOCK_RELEASED",
        LockReleaseFailed = 4 => "LOCK_RELEASE_FAILED",
        BadLock = 5 => "BAD_LOCK",
        FileClosing = 6 => "FILE_CLOSING",
        NoLock = 7 => "NO_LOCK",
        MdataNotCached = 8 => "MDATA_NOT_CACHED",
        Dumping = 9 => "DUMPING",
        DumpingFinished = 10 => "DUMPING_FINISHED",
        DumpingFailed = 11 => "DUMPING_FAILED",
        Oom = 12 => "OOM",
        BadFileId = 13 => "BAD_FILE_ID",
        CantAlloc = 14 => "CANT_ALLOC",
        CantFree = 15 => "CANT_FREE",
        Catastrophic = 16 => "CATASTROPHIC",
    }
}

impl Status {
    /// Statuses that report a completed operation rather than a failure.
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Status::Ok | Status::LockAcquired | Status::LockReleased | Status::DumpingFinished
        )
    }
}

/// Allocation feature bits negotiated at OPEN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(pub u64);

impl FeatureFlags {
    /// Carve metadata allocations out of `meta_block_size` aggregation blocks.
    pub const AGGREGATE_METADATA: FeatureFlags = FeatureFlags(0x1);
    /// Carve small raw-data allocations out of `small_data_block_size` blocks.
    pub const AGGREGATE_SMALLDATA: FeatureFlags = FeatureFlags(0x2);

    pub const fn empty() -> Self {
        FeatureFlags(0)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn contains(self, other: FeatureFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: FeatureFlags) -> Self {
        FeatureFlags(self.0 | other.0)
    }
}

/// Fixed-size opaque key identifying a lockable metadata object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub const fn new(bytes: [u8; OBJECT_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds an id from a shorter reference (e.g. an object header address), zero-padded.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > OBJECT_ID_LEN {
            return Err(WireError::ObjectIdTooLong { len: bytes.len() });
        }
        let mut id = [0u8; OBJECT_ID_LEN];
        id[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(id))
    }

    /// Object ids in the storage layer are usually object-header addresses.
    pub fn from_address(address: u64) -> Self {
        let mut id = [0u8; OBJECT_ID_LEN];
        id[..8].copy_from_slice(&address.to_le_bytes());
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Correlation identity of a request. Request ids are only unique per sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub sender_rank: Rank,
    pub request_id: u64,
}

impl RequestKey {
    pub fn new(sender_rank: Rank, request_id: u64) -> Self {
        Self {
            sender_rank,
            request_id,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sender_rank, self.request_id)
    }
}
