//! Blocking request library used by every participant other than the server.
//!
//! Each call sends one request (or one lock/release group) and blocks until the matching
//! reply arrives. Replies are correlated by [`RequestKey`]; a reply carrying any other id
//! is a protocol violation.

mod dump;

pub use dump::{receive_dump, DumpSink, DumpSummary};

use crate::config::Session;
use crate::server::LockRequest;
use crate::transport::{Channel, Transport};
use crate::util::SapError;
use crate::wire::{
    AllocReply, FileId, MemKind, ObjectId, OpenParams, Rank, ReadReply, Reply, Request,
    RequestKey, RequestKind, Status, WireError,
};
use log::debug;

/// Address range handed out by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocated {
    pub address: u64,
    pub size: u64,
    pub end_of_address: u64,
}

pub struct SapClient<T: Transport> {
    transport: T,
    rank: Rank,
    server: Rank,
    next_request_id: u64,
    last_dump: Option<DumpSummary>,
    dumps_received: u64,
}

impl<T: Transport> SapClient<T> {
    pub fn new(transport: T, session: &Session) -> Result<Self, SapError> {
        if session.is_server() {
            return Err(SapError::Protocol(format!(
                "rank {} is the server and cannot act as a client",
                session.rank
            )));
        }
        if transport.rank() != session.rank {
            return Err(SapError::Protocol(format!(
                "transport rank {} does not match session rank {}",
                transport.rank(),
                session.rank
            )));
        }
        Ok(Self {
            transport,
            rank: session.rank,
            server: session.server_rank(),
            next_request_id: 0,
            last_dump: None,
            dumps_received: 0,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn server_rank(&self) -> Rank {
        self.server
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Summary of the most recent dump this client received, if any.
    pub fn last_dump(&self) -> Option<DumpSummary> {
        self.last_dump
    }

    pub fn dumps_received(&self) -> u64 {
        self.dumps_received
    }

    /// Sends OPEN and returns the server's FILE_ID reply, successful or not.
    ///
    /// `eoa` seeds the server's allocator with the file's current end of address.
    pub fn open(&mut self, params: OpenParams, eoa: u64) -> Result<Reply, SapError> {
        let key = self.next_key();
        let mut request = Request::new(RequestKind::Open, key, 0);
        request.open = params;
        request.address = eoa;
        self.send_request(&request)?;
        let reply = Reply::decode(&self.transport.recv_from(self.server, Channel::FileId)?)?;
        check_correlation(key, reply.request_id)?;
        Ok(reply)
    }

    /// Forwards the captain's OPEN outcome to the other clients.
    pub fn announce_file_id(&self, reply: &Reply, peers: &[Rank]) -> Result<(), SapError> {
        let frame = reply.encode();
        for peer in peers.iter().filter(|peer| **peer != self.rank) {
            self.transport.send(*peer, Channel::FileId, &frame)?;
        }
        Ok(())
    }

    pub fn await_file_id(&self, captain: Rank) -> Result<Reply, SapError> {
        let reply = Reply::decode(&self.transport.recv_from(captain, Channel::FileId)?)?;
        Ok(reply)
    }

    /// Acquires every lock in `group` or none of them.
    pub fn lock(&mut self, file_id: FileId, group: &[LockRequest]) -> Result<(), SapError> {
        let Some((last, members)) = group.split_last() else {
            return Ok(());
        };
        for member in members {
            self.send_lock_member(RequestKind::Lock, file_id, member)?;
        }
        let key = self.send_lock_member(RequestKind::LockEnd, file_id, last)?;
        let reply = self.await_reply(key, file_id, None)?;
        expect(RequestKind::LockEnd, file_id, reply.status, Status::LockAcquired)
    }

    /// Drops one reference on each object, all or nothing.
    pub fn release(&mut self, file_id: FileId, objects: &[ObjectId]) -> Result<(), SapError> {
        let Some((last, members)) = objects.split_last() else {
            return Ok(());
        };
        for object_id in members {
            self.send_release_member(RequestKind::Release, file_id, *object_id)?;
        }
        let key = self.send_release_member(RequestKind::ReleaseEnd, file_id, *last)?;
        let reply = self.await_reply(key, file_id, None)?;
        expect(RequestKind::ReleaseEnd, file_id, reply.status, Status::LockReleased)
    }

    pub fn write(
        &mut self,
        file_id: FileId,
        mem_kind: MemKind,
        address: u64,
        payload: &[u8],
        sink: &mut dyn DumpSink,
    ) -> Result<(), SapError> {
        let key = self.next_key();
        let mut request = Request::new(RequestKind::Write, key, file_id);
        request.mem_kind = mem_kind;
        request.address = address;
        request.payload_size = payload.len() as u64;
        self.send_request(&request)?;
        self.transport.send(self.server, Channel::Metadata, payload)?;
        let reply = self.await_reply(key, file_id, Some(sink))?;
        expect(RequestKind::Write, file_id, reply.status, Status::Ok)
    }

    /// Reads the cached payload at `address`, or `None` when the server has nothing cached.
    pub fn read(
        &mut self,
        file_id: FileId,
        mem_kind: MemKind,
        address: u64,
        size: u64,
        sink: &mut dyn DumpSink,
    ) -> Result<Option<Vec<u8>>, SapError> {
        let key = self.next_key();
        let mut request = Request::new(RequestKind::Read, key, file_id);
        request.mem_kind = mem_kind;
        request.address = address;
        request.payload_size = size;
        self.send_request(&request)?;
        let reply = loop {
            let reply =
                ReadReply::decode(&self.transport.recv_from(self.server, Channel::ReadReply)?)?;
            check_correlation(key, reply.request_id)?;
            if reply.status != Status::Dumping {
                break reply;
            }
            self.take_dump(key, file_id, sink)?;
        };
        match reply.status {
            Status::Ok => {
                let payload = self.transport.recv_from(self.server, Channel::Metadata)?;
                if payload.len() as u64 != reply.payload_size {
                    return Err(WireError::PayloadLength {
                        announced: reply.payload_size,
                        received: payload.len(),
                    }
                    .into());
                }
                Ok(Some(payload))
            }
            Status::MdataNotCached => Ok(None),
            status => Err(SapError::from_status(RequestKind::Read, file_id, status)),
        }
    }

    /// Blocks until the server has pushed out any cached modifications.
    pub fn flush(&mut self, file_id: FileId, sink: &mut dyn DumpSink) -> Result<(), SapError> {
        self.simple(RequestKind::Flush, file_id, Some(sink))
    }

    pub fn close(&mut self, file_id: FileId, sink: &mut dyn DumpSink) -> Result<(), SapError> {
        self.simple(RequestKind::Close, file_id, Some(sink))
    }

    /// Tells the server this participant is done. Acknowledged before the server exits.
    pub fn stop(&mut self) -> Result<(), SapError> {
        self.simple(RequestKind::Stop, 0, None)
    }

    pub fn alloc(
        &mut self,
        file_id: FileId,
        mem_kind: MemKind,
        size: u64,
    ) -> Result<Allocated, SapError> {
        let key = self.next_key();
        let mut request = Request::new(RequestKind::Alloc, key, file_id);
        request.mem_kind = mem_kind;
        request.payload_size = size;
        self.send_request(&request)?;
        let reply = self.await_alloc_reply(key)?;
        expect(RequestKind::Alloc, file_id, reply.status, Status::Ok)?;
        Ok(Allocated {
            address: reply.address,
            size: reply.payload_size,
            end_of_address: reply.end_of_address,
        })
    }

    /// Returns a range to the server's free list; yields the file's end of address.
    pub fn free(
        &mut self,
        file_id: FileId,
        mem_kind: MemKind,
        address: u64,
        size: u64,
    ) -> Result<u64, SapError> {
        let key = self.next_key();
        let mut request = Request::new(RequestKind::Free, key, file_id);
        request.mem_kind = mem_kind;
        request.address = address;
        request.payload_size = size;
        self.send_request(&request)?;
        let reply = self.await_alloc_reply(key)?;
        expect(RequestKind::Free, file_id, reply.status, Status::Ok)?;
        Ok(reply.end_of_address)
    }

    fn simple(
        &mut self,
        kind: RequestKind,
        file_id: FileId,
        sink: Option<&mut dyn DumpSink>,
    ) -> Result<(), SapError> {
        let key = self.next_key();
        self.send_request(&Request::new(kind, key, file_id))?;
        let reply = self.await_reply(key, file_id, sink)?;
        expect(kind, file_id, reply.status, Status::Ok)
    }

    fn next_key(&mut self) -> RequestKey {
        let key = RequestKey::new(self.rank, self.next_request_id);
        self.next_request_id += 1;
        key
    }

    fn send_request(&self, request: &Request) -> Result<(), SapError> {
        debug!(
            "event=client_request key={} kind={} file_id={}",
            request.key(),
            request.kind,
            request.file_id
        );
        self.transport
            .send(self.server, Channel::Request, &request.encode())?;
        Ok(())
    }

    fn send_lock_member(
        &mut self,
        kind: RequestKind,
        file_id: FileId,
        member: &LockRequest,
    ) -> Result<RequestKey, SapError> {
        let key = self.next_key();
        let mut request = Request::new(kind, key, file_id);
        request.object_id = member.object_id;
        request.object_kind = member.object_kind;
        request.lock_kind = member.lock_kind;
        self.send_request(&request)?;
        Ok(key)
    }

    fn send_release_member(
        &mut self,
        kind: RequestKind,
        file_id: FileId,
        object_id: ObjectId,
    ) -> Result<RequestKey, SapError> {
        let key = self.next_key();
        let mut request = Request::new(kind, key, file_id);
        request.object_id = object_id;
        self.send_request(&request)?;
        Ok(key)
    }

    /// Waits for the REPLY to `key`, serving any dump announced in between.
    fn await_reply(
        &mut self,
        key: RequestKey,
        file_id: FileId,
        mut sink: Option<&mut dyn DumpSink>,
    ) -> Result<Reply, SapError> {
        loop {
            let reply = Reply::decode(&self.transport.recv_from(self.server, Channel::Reply)?)?;
            check_correlation(key, reply.request_id)?;
            if reply.status != Status::Dumping {
                return Ok(reply);
            }
            let Some(sink) = sink.as_deref_mut() else {
                return Err(SapError::Protocol(format!(
                    "server started a dump in reply to {key}, which cannot receive one"
                )));
            };
            self.take_dump(key, file_id, sink)?;
        }
    }

    fn await_alloc_reply(&self, key: RequestKey) -> Result<AllocReply, SapError> {
        let reply =
            AllocReply::decode(&self.transport.recv_from(self.server, Channel::AllocReply)?)?;
        check_correlation(key, reply.request_id)?;
        Ok(reply)
    }

    fn take_dump(
        &mut self,
        key: RequestKey,
        file_id: FileId,
        sink: &mut dyn DumpSink,
    ) -> Result<(), SapError> {
        let summary = receive_dump(&self.transport, self.server, key, file_id, sink)?;
        self.last_dump = Some(summary);
        self.dumps_received += 1;
        Ok(())
    }
}

fn check_correlation(key: RequestKey, request_id: u64) -> Result<(), SapError> {
    if request_id == key.request_id {
        Ok(())
    } else {
        Err(SapError::Protocol(format!(
            "reply for request {request_id} while waiting on {key}"
        )))
    }
}

fn expect(op: RequestKind, file_id: FileId, status: Status, wanted: Status) -> Result<(), SapError> {
    if status == wanted {
        Ok(())
    } else {
        Err(SapError::from_status(op, file_id, status))
    }
}
