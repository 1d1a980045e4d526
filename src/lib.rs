//! Core library entrypoint for flexpar, the flexible-parallel metadata coordination
//! service. A dedicated set-aside process (SAP) caches metadata writes, arbitrates object
//! locks and hands out file address space on behalf of many cooperating clients.

pub mod client;
pub mod config;
pub mod driver;
pub mod server;
pub mod telemetry;
pub mod timeouts;
pub mod transport;
pub mod util;
pub mod wire;

pub use client::{receive_dump, Allocated, DumpSink, DumpSummary, SapClient};
pub use config::{
    FileAccessConfig, ServiceConfig, Session, TransferMode, DEFAULT_HIGH_WATER_MARK,
    DEFAULT_MAX_GROUP_LEN, DEFAULT_MAX_LOCKS_PER_FILE, DEFAULT_MAX_OPEN_FILES,
    DEFAULT_META_BLOCK_SIZE, DEFAULT_SMALL_DATA_BLOCK_SIZE,
};
pub use driver::{FlexParallelDriver, LocalFile, MemoryFile, RealFile};
pub use server::{
    AllocError, Allocation, CompletedGroup, FileInfo, GroupAssembler, GroupError, GroupKind,
    LockError, LockRequest, LockTable, MetadataCache, MetadataMod, ObjectLock, SapServer,
    SpaceAllocator,
};
pub use telemetry::{MetricsRegistry, MetricsSnapshot, TelemetryError};
pub use transport::{
    barrier, Channel, Envelope, LocalFabric, LocalTransport, Source, Transport, TransportError,
};
#[cfg(feature = "net")]
pub use config::DeploymentConfig;
#[cfg(feature = "net")]
pub use transport::{MeshConfig, MeshPeer, TcpTransport, TcpTransportOptions};
pub use util::{ConfigError, RetryHandle, RetryPolicy, SapError, StorageError};
pub use wire::{
    AllocReply, FeatureFlags, FileId, LockKind, MemKind, ObjectId, ObjectKind, OpenParams, Rank,
    ReadReply, Reply, Request, RequestKey, RequestKind, Status, WireError,
};
