//! The set-aside process: a single-threaded dispatch loop over per-file state.
//!
//! The loop receives one request at a time (a whole lock or release group counts as one)
//! and runs it to completion before accepting the next, so the per-file tables need no
//! locking of their own. Handler failures become reply statuses; transport and framing
//! failures end the loop.

pub mod alloc;
pub mod cache;
pub mod file;
pub mod group;
pub mod locks;

pub use alloc::{AllocError, Allocation, SpaceAllocator};
pub use cache::{MetadataCache, MetadataMod};
pub use file::FileInfo;
pub use group::{CompletedGroup, GroupAssembler, GroupError, GroupKind, Step};
pub use locks::{LockError, LockRequest, LockTable, ObjectLock};

use crate::config::{ServiceConfig, Session};
use crate::telemetry::{MetricsRegistry, MetricsSnapshot};
use crate::transport::{Channel, Source, Transport};
use crate::util::SapError;
use crate::wire::{
    AllocReply, FileId, ObjectId, Rank, ReadReply, Reply, Request, RequestKind, Status, WireError,
};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, BTreeSet};

/// When a request must first push the cache out to its sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpWhen {
    HighWater,
    NonEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Proceed,
    Refuse(Status),
}

pub struct SapServer<T: Transport> {
    transport: T,
    config: ServiceConfig,
    files: BTreeMap<FileId, FileInfo>,
    next_file_id: FileId,
    assembler: GroupAssembler,
    stopped: BTreeSet<Rank>,
    metrics: MetricsRegistry,
}

impl<T: Transport> SapServer<T> {
    pub fn new(transport: T, session: &Session) -> Result<Self, SapError> {
        if !session.is_server() {
            return Err(SapError::Protocol(format!(
                "rank {} is not the server rank {}",
                session.rank,
                session.server_rank()
            )));
        }
        if transport.rank() != session.rank || transport.size() != session.config.participants {
            return Err(SapError::Protocol(format!(
                "transport is rank {} of {}, session expects rank {} of {}",
                transport.rank(),
                transport.size(),
                session.rank,
                session.config.participants
            )));
        }
        let config = session.config.clone();
        let mut metrics = MetricsRegistry::new("flexpar.sap");
        metrics.register_histogram("dump.entries", (config.high_water_mark as u64) * 4);
        metrics.register_histogram("lock.group_len", config.max_group_len as u64);
        metrics.set_gauge("files.open", 0);
        Ok(Self {
            transport,
            assembler: GroupAssembler::new(config.max_group_len),
            config,
            files: BTreeMap::new(),
            next_file_id: 1,
            stopped: BTreeSet::new(),
            metrics,
        })
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn file(&self, file_id: FileId) -> Option<&FileInfo> {
        self.files.get(&file_id)
    }

    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// True once every other participant has sent STOP.
    pub fn is_finished(&self) -> bool {
        self.stopped.len() as u32 >= self.config.participants.saturating_sub(1)
    }

    /// Serves requests until every other participant has sent STOP.
    pub fn run(&mut self) -> Result<MetricsSnapshot, SapError> {
        info!(
            "event=sap_start rank={} participants={} high_water_mark={}",
            self.transport.rank(),
            self.config.participants,
            self.config.high_water_mark
        );
        while !self.is_finished() {
            self.serve_one()?;
        }
        if !self.files.is_empty() {
            warn!(
                "event=sap_stop_with_open_files files={:?}",
                self.files.keys().collect::<Vec<_>>()
            );
        }
        info!("event=sap_stop rank={}", self.transport.rank());
        Ok(self.metrics.snapshot())
    }

    /// Receives and handles exactly one request.
    pub fn serve_one(&mut self) -> Result<(), SapError> {
        let source = self
            .assembler
            .expecting()
            .map_or(Source::Any, Source::Rank);
        let envelope = self.transport.recv(source, Channel::Request)?;
        let request = Request::decode(&envelope.payload)?;
        if request.sender_rank != envelope.source {
            return Err(SapError::Protocol(format!(
                "request {} arrived from rank {}",
                request.key(),
                envelope.source
            )));
        }
        self.metrics.inc_counter(
            format!("requests.{}", request.kind.label().to_ascii_lowercase()),
            1,
        );
        debug!(
            "event=sap_request key={} kind={} file_id={} address={}",
            request.key(),
            request.kind,
            request.file_id,
            request.address
        );
        self.dispatch(request)
    }

    /// Marks a file unusable; every later request naming it is answered CATASTROPHIC.
    pub fn poison(&mut self, file_id: FileId, reason: &str) -> bool {
        match self.files.get_mut(&file_id) {
            Some(info) => {
                error!("event=sap_file_poisoned file_id={} reason={}", file_id, reason);
                info.poison(reason);
                self.metrics.inc_counter("files.poisoned", 1);
                true
            }
            None => false,
        }
    }

    fn dispatch(&mut self, request: Request) -> Result<(), SapError> {
        if !self.assembler.is_idle() {
            return self.handle_group_request(request);
        }
        match request.kind {
            RequestKind::Open => self.handle_open(request),
            RequestKind::Write => self.handle_write(request),
            RequestKind::Read => self.handle_read(request),
            RequestKind::Flush => self.handle_flush(request),
            RequestKind::Close => self.handle_close(request),
            RequestKind::Stop => self.handle_stop(request),
            RequestKind::Alloc => self.handle_alloc(request),
            RequestKind::Free => self.handle_free(request),
            RequestKind::Lock
            | RequestKind::LockEnd
            | RequestKind::Release
            | RequestKind::ReleaseEnd => self.handle_group_request(request),
        }
    }

    fn handle_open(&mut self, request: Request) -> Result<(), SapError> {
        let (file_id, status) = if self.files.len() >= self.config.max_open_files {
            warn!(
                "event=sap_open_rejected sender={} open_files={}",
                request.sender_rank,
                self.files.len()
            );
            (0, Status::Oom)
        } else {
            let file_id = self.allocate_file_id();
            let info = FileInfo::new(
                file_id,
                request.open,
                request.address,
                self.config.max_locks_per_file,
            );
            self.files.insert(file_id, info);
            info!(
                "event=sap_file_open file_id={} captain={} eoa={} max_address={}",
                file_id, request.sender_rank, request.address, request.open.max_address
            );
            (file_id, Status::Ok)
        };
        self.metrics.set_gauge("files.open", self.files.len() as u64);
        let reply = Reply::new(request.request_id, file_id, status);
        self.transport
            .send(request.sender_rank, Channel::FileId, &reply.encode())?;
        Ok(())
    }

    fn allocate_file_id(&mut self) -> FileId {
        loop {
            let candidate = self.next_file_id;
            self.next_file_id = self.next_file_id.wrapping_add(1).max(1);
            if !self.files.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn handle_group_request(&mut self, request: Request) -> Result<(), SapError> {
        let key = request.key();
        let kind = request.kind;
        let file_id = request.file_id;
        match self.assembler.push(request.clone()) {
            Ok(Step::Pending) => Ok(()),
            Ok(Step::Complete(group)) => self.evaluate_group(group),
            Err(GroupError::NotGroupRequest { .. }) => {
                warn!(
                    "event=sap_group_abandoned sender={} interrupted_by={}",
                    key.sender_rank, kind
                );
                self.dispatch(request)
            }
            Err(err) => {
                warn!("event=sap_group_rejected key={} error={}", key, err);
                if kind.is_group_terminator() {
                    let status = if kind == RequestKind::LockEnd {
                        Status::LockFailed
                    } else {
                        Status::LockReleaseFailed
                    };
                    let reply = Reply::new(key.request_id, file_id, status);
                    self.transport
                        .send(key.sender_rank, Channel::Reply, &reply.encode())?;
                }
                Ok(())
            }
        }
    }

    fn evaluate_group(&mut self, group: CompletedGroup) -> Result<(), SapError> {
        let (granted, refused) = match group.kind {
            GroupKind::Lock => (Status::LockAcquired, Status::LockFailed),
            GroupKind::Release => (Status::LockReleased, Status::LockReleaseFailed),
        };
        let _ = self
            .metrics
            .observe_histogram("lock.group_len", group.members.len() as u64);
        let status = if group.mixed_files {
            Status::BadFileId
        } else if group.overflowed {
            warn!(
                "event=sap_group_overflow sender={} file_id={} limit={}",
                group.sender, group.file_id, self.config.max_group_len
            );
            refused
        } else {
            match lookup(&mut self.files, group.file_id) {
                Err(status) => status,
                Ok(info) => {
                    let outcome = match group.kind {
                        GroupKind::Lock if info.is_closing() => Err(Status::FileClosing),
                        GroupKind::Lock => {
                            let wanted: Vec<LockRequest> = group
                                .members
                                .iter()
                                .map(|member| LockRequest {
                                    object_id: member.object_id,
                                    object_kind: member.object_kind,
                                    lock_kind: member.lock_kind,
                                })
                                .collect();
                            apply_lock_change(info, |locks| {
                                locks.acquire_group(group.sender, &wanted)
                            })
                        }
                        GroupKind::Release => {
                            let ids: Vec<ObjectId> =
                                group.members.iter().map(|member| member.object_id).collect();
                            apply_lock_change(info, |locks| {
                                locks.release_group(group.sender, &ids)
                            })
                        }
                    };
                    if outcome == Err(Status::Catastrophic) {
                        self.metrics.inc_counter("files.poisoned", 1);
                    }
                    outcome.map_or_else(|status| status, |()| granted)
                }
            }
        };
        let counter = if status == granted {
            "groups.granted"
        } else {
            "groups.refused"
        };
        self.metrics.inc_counter(counter, 1);
        debug!(
            "event=sap_group_done sender={} file_id={} kind={:?} members={} status={}",
            group.sender,
            group.file_id,
            group.kind,
            group.members.len(),
            status
        );
        let reply = Reply::new(group.request_id, group.file_id, status);
        self.transport
            .send(group.sender, Channel::Reply, &reply.encode())?;
        Ok(())
    }

    fn handle_write(&mut self, request: Request) -> Result<(), SapError> {
        let payload = self
            .transport
            .recv_from(request.sender_rank, Channel::Metadata)?;
        if payload.len() as u64 != request.payload_size {
            return Err(WireError::PayloadLength {
                announced: request.payload_size,
                received: payload.len(),
            }
            .into());
        }
        let status = match self.admit(&request, Channel::Reply, DumpWhen::HighWater)? {
            Admission::Refuse(status) => status,
            Admission::Proceed => match self.files.get_mut(&request.file_id) {
                Some(info) => {
                    info.cache
                        .write(request.mem_kind, request.address, payload);
                    Status::Ok
                }
                None => Status::BadFileId,
            },
        };
        self.reply(&request, status)
    }

    fn handle_read(&mut self, request: Request) -> Result<(), SapError> {
        let mut reply = ReadReply::new(request.request_id, request.file_id, Status::Ok);
        reply.mem_kind = request.mem_kind;
        reply.address = request.address;
        let mut payload = None;
        match self.admit(&request, Channel::ReadReply, DumpWhen::HighWater)? {
            Admission::Refuse(status) => reply.status = status,
            Admission::Proceed => {
                let cached = self
                    .files
                    .get(&request.file_id)
                    .and_then(|info| info.cache.read(request.address));
                match cached {
                    Some(entry) => {
                        reply.mem_kind = entry.mem_kind;
                        reply.payload_size = entry.payload.len() as u64;
                        payload = Some(entry.payload.clone());
                    }
                    None => reply.status = Status::MdataNotCached,
                }
            }
        }
        self.transport
            .send(request.sender_rank, Channel::ReadReply, &reply.encode())?;
        if let Some(payload) = payload {
            self.transport
                .send(request.sender_rank, Channel::Metadata, &payload)?;
        }
        Ok(())
    }

    fn handle_flush(&mut self, request: Request) -> Result<(), SapError> {
        let status = match self.admit(&request, Channel::Reply, DumpWhen::NonEmpty)? {
            Admission::Proceed => Status::Ok,
            Admission::Refuse(status) => status,
        };
        self.reply(&request, status)
    }

    fn handle_close(&mut self, request: Request) -> Result<(), SapError> {
        let file_id = request.file_id;
        let clients = self.config.client_count();
        let poisoned = match self.files.get(&file_id) {
            None => return self.reply(&request, Status::BadFileId),
            Some(info) => info.poisoned().is_some(),
        };
        let status = if poisoned {
            // Nothing cached on a poisoned file is trusted; the vote still counts so the
            // file can be torn down and re-opened.
            Status::Catastrophic
        } else {
            match self.admit(&request, Channel::Reply, DumpWhen::NonEmpty)? {
                Admission::Proceed => Status::Ok,
                Admission::Refuse(status) => status,
            }
        };
        if status == Status::Ok || status == Status::Catastrophic {
            let Some(info) = self.files.get_mut(&file_id) else {
                return self.reply(&request, Status::BadFileId);
            };
            let leftover = info.locks.release_rank(request.sender_rank);
            if leftover > 0 {
                warn!(
                    "event=sap_close_dropped_locks file_id={} rank={} locks={}",
                    file_id, request.sender_rank, leftover
                );
            }
            if info.record_close(clients) {
                let discarded = info.cache.len();
                self.files.remove(&file_id);
                self.metrics.set_gauge("files.open", self.files.len() as u64);
                info!(
                    "event=sap_file_closed file_id={} votes={} discarded_mods={}",
                    file_id, clients, discarded
                );
            } else {
                debug!(
                    "event=sap_close_vote file_id={} rank={} votes={}/{}",
                    file_id,
                    request.sender_rank,
                    info.close_votes(),
                    clients
                );
            }
        }
        self.reply(&request, status)
    }

    fn handle_stop(&mut self, request: Request) -> Result<(), SapError> {
        if !self.stopped.insert(request.sender_rank) {
            warn!("event=sap_duplicate_stop rank={}", request.sender_rank);
        }
        info!(
            "event=sap_stop_vote rank={} stopped={}/{}",
            request.sender_rank,
            self.stopped.len(),
            self.config.participants.saturating_sub(1)
        );
        self.reply(&request, Status::Ok)
    }

    fn handle_alloc(&mut self, request: Request) -> Result<(), SapError> {
        let mut reply = AllocReply::new(request.request_id, request.file_id, Status::Ok);
        reply.mem_kind = request.mem_kind;
        match lookup(&mut self.files, request.file_id) {
            Err(status) => reply.status = status,
            Ok(info) => match info.allocator.allocate(request.mem_kind, request.payload_size) {
                Ok(allocation) => {
                    reply.address = allocation.address;
                    reply.payload_size = allocation.size;
                    reply.end_of_address = allocation.end_of_address;
                    self.metrics.inc_counter("alloc.bytes", allocation.size);
                }
                Err(err) => {
                    debug!(
                        "event=sap_alloc_failed file_id={} size={} error={}",
                        request.file_id, request.payload_size, err
                    );
                    reply.status = err.status();
                    reply.end_of_address = info.allocator.end_of_address();
                }
            },
        }
        self.transport
            .send(request.sender_rank, Channel::AllocReply, &reply.encode())?;
        Ok(())
    }

    fn handle_free(&mut self, request: Request) -> Result<(), SapError> {
        let mut reply = AllocReply::new(request.request_id, request.file_id, Status::Ok);
        reply.mem_kind = request.mem_kind;
        reply.address = request.address;
        reply.payload_size = request.payload_size;
        match lookup(&mut self.files, request.file_id) {
            Err(status) => reply.status = status,
            Ok(info) => {
                match info.allocator.free(request.address, request.payload_size) {
                    Ok(eoa) => {
                        let dropped = info
                            .cache
                            .remove_range(request.address, request.payload_size);
                        if dropped > 0 {
                            debug!(
                                "event=sap_free_dropped_mods file_id={} address={} mods={}",
                                request.file_id, request.address, dropped
                            );
                        }
                        self.metrics.inc_counter("free.bytes", request.payload_size);
                        reply.end_of_address = eoa;
                    }
                    Err(err) => {
                        debug!(
                            "event=sap_free_failed file_id={} error={}",
                            request.file_id, err
                        );
                        reply.status = err.status();
                        reply.end_of_address = info.allocator.end_of_address();
                    }
                }
            }
        }
        self.transport
            .send(request.sender_rank, Channel::AllocReply, &reply.encode())?;
        Ok(())
    }

    /// Looks the file up and runs a due dump. A failed dump refuses the operation.
    fn admit(
        &mut self,
        request: &Request,
        channel: Channel,
        when: DumpWhen,
    ) -> Result<Admission, SapError> {
        let info = match lookup(&mut self.files, request.file_id) {
            Ok(info) => info,
            Err(status) => return Ok(Admission::Refuse(status)),
        };
        let due = match when {
            DumpWhen::HighWater => info.cache.needs_dump(self.config.high_water_mark),
            DumpWhen::NonEmpty => !info.cache.is_empty(),
        };
        if !due {
            return Ok(Admission::Proceed);
        }
        let persisted = stream_dump(&self.transport, info, request, channel, &mut self.metrics)?;
        Ok(if persisted {
            Admission::Proceed
        } else {
            Admission::Refuse(Status::DumpingFailed)
        })
    }

    fn reply(&self, request: &Request, status: Status) -> Result<(), SapError> {
        let reply = Reply::new(request.request_id, request.file_id, status);
        self.transport
            .send(request.sender_rank, Channel::Reply, &reply.encode())?;
        Ok(())
    }
}

fn lookup(files: &mut BTreeMap<FileId, FileInfo>, file_id: FileId) -> Result<&mut FileInfo, Status> {
    let info = files.get_mut(&file_id).ok_or(Status::BadFileId)?;
    if info.poisoned().is_some() {
        return Err(Status::Catastrophic);
    }
    Ok(info)
}

/// Applies a group change and re-checks the table. A table that fails the check poisons the file.
fn apply_lock_change<F>(info: &mut FileInfo, change: F) -> Result<(), Status>
where
    F: FnOnce(&mut LockTable) -> Result<(), LockError>,
{
    if let Err(err) = change(&mut info.locks) {
        debug!("event=sap_lock_refused file_id={} error={}", info.file_id, err);
        return Err(err.status());
    }
    if let Err(err) = info.locks.verify() {
        error!(
            "event=sap_file_poisoned file_id={} reason={}",
            info.file_id, err
        );
        info.poison(err.to_string());
        return Err(Status::Catastrophic);
    }
    Ok(())
}

/// Streams every cached modification of `info` to the request's sender and waits for its
/// acknowledgement. Returns whether the receiver persisted everything.
fn stream_dump<T: Transport + ?Sized>(
    transport: &T,
    info: &mut FileInfo,
    request: &Request,
    channel: Channel,
    metrics: &mut MetricsRegistry,
) -> Result<bool, SapError> {
    let dest = request.sender_rank;
    let file_id = info.file_id;
    let notice = match channel {
        Channel::ReadReply => ReadReply::new(request.request_id, file_id, Status::Dumping).encode(),
        _ => Reply::new(request.request_id, file_id, Status::Dumping).encode(),
    };
    transport.send(dest, channel, &notice)?;

    let mut entries = 0u64;
    for entry in info.cache.entries() {
        let header = ReadReply {
            request_id: request.request_id,
            file_id,
            status: Status::Dumping,
            mem_kind: entry.mem_kind,
            address: entry.address,
            payload_size: entry.payload.len() as u64,
        };
        transport.send(dest, Channel::Dump, &header.encode())?;
        transport.send(dest, Channel::Dump, &entry.payload)?;
        entries += 1;
    }
    let finished = ReadReply::new(request.request_id, file_id, Status::DumpingFinished);
    transport.send(dest, Channel::Dump, &finished.encode())?;

    let ack = Reply::decode(&transport.recv_from(dest, Channel::Dump)?)?;
    if ack.request_id != request.request_id || ack.file_id != file_id {
        return Err(SapError::Protocol(format!(
            "dump acknowledgement for request {} file {} while dumping request {} file {}",
            ack.request_id, ack.file_id, request.request_id, file_id
        )));
    }
    let _ = metrics.observe_histogram("dump.entries", entries);
    if ack.status == Status::DumpingFinished {
        info.cache.clear();
        metrics.inc_counter("dumps.completed", 1);
        metrics.inc_counter("dumps.entries", entries);
        info!(
            "event=sap_dump file_id={} receiver={} trigger={} entries={}",
            file_id, dest, request.kind, entries
        );
        Ok(true)
    } else {
        metrics.inc_counter("dumps.failed", 1);
        warn!(
            "event=sap_dump_failed file_id={} receiver={} entries={} ack={}",
            file_id, dest, entries, ack.status
        );
        Ok(false)
    }
}
