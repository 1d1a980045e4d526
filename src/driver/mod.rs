//! Storage-driver surface over the set-aside process.
//!
//! Metadata reads and writes go through the server's cache; raw data goes straight to the
//! real file. Open and close are coordinated by the captain client.

pub mod real_file;

pub use real_file::{LocalFile, MemoryFile, RealFile};

use crate::client::{DumpSink, SapClient};
use crate::config::{FileAccessConfig, Session};
use crate::server::LockRequest;
use crate::transport::{barrier, Transport};
use crate::util::{SapError, StorageError};
use crate::wire::{FileId, MemKind, ObjectId, RequestKind, Status};
use log::{debug, error, info, warn};

/// Writes dumped cache entries directly to the real file, growing its end of address
/// when another rank allocated the space.
struct DirectWrite<'a, F: RealFile>(&'a mut F);

impl<F: RealFile> DumpSink for DirectWrite<'_, F> {
    fn persist(
        &mut self,
        _mem_kind: MemKind,
        address: u64,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let end = address.saturating_add(payload.len() as u64);
        if end > self.0.get_eoa() {
            self.0.set_eoa(end)?;
        }
        self.0.write(address, payload)
    }
}

pub struct FlexParallelDriver<T: Transport, F: RealFile> {
    client: SapClient<T>,
    session: Session,
    file: F,
    file_id: FileId,
    access: FileAccessConfig,
    eof: Option<u64>,
    poisoned: bool,
}

impl<T: Transport, F: RealFile> FlexParallelDriver<T, F> {
    /// Opens `file` on every client. Collective: every client rank must call it.
    ///
    /// The captain asks the server for a file id and forwards the outcome to the other
    /// clients, which wait for it.
    pub fn open(
        transport: T,
        session: Session,
        file: F,
        access: FileAccessConfig,
    ) -> Result<Self, SapError> {
        let client = SapClient::new(transport, &session)?;
        Self::open_with(client, session, file, access)
    }

    /// Like [`open`](Self::open) but reuses a client left over from a previous file.
    pub fn open_with(
        mut client: SapClient<T>,
        session: Session,
        file: F,
        access: FileAccessConfig,
    ) -> Result<Self, SapError> {
        access.validate()?;
        let reply = if session.is_captain() {
            let reply = client.open(access.open_params(), file.get_eoa())?;
            client.announce_file_id(&reply, &session.config.clients())?;
            reply
        } else {
            client.await_file_id(session.config.captain_rank)?
        };
        if reply.status != Status::Ok {
            return Err(SapError::from_status(
                RequestKind::Open,
                reply.file_id,
                reply.status,
            ));
        }
        info!(
            "event=driver_open rank={} file_id={} captain={}",
            session.rank, reply.file_id, session.config.captain_rank
        );
        Ok(Self {
            client,
            session,
            file,
            file_id: reply.file_id,
            access,
            eof: None,
            poisoned: false,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn access(&self) -> &FileAccessConfig {
        &self.access
    }

    pub fn client(&self) -> &SapClient<T> {
        &self.client
    }

    pub fn real_file(&self) -> &F {
        &self.file
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn read(&mut self, mem_kind: MemKind, address: u64, size: usize) -> Result<Vec<u8>, SapError> {
        self.guard()?;
        if mem_kind.is_raw() {
            return Ok(self.file.read(address, size)?);
        }
        let dumps = self.client.dumps_received();
        let mut sink = DirectWrite(&mut self.file);
        let result = self
            .client
            .read(self.file_id, mem_kind, address, size as u64, &mut sink);
        self.note_dumps(dumps);
        match self.track(result)? {
            Some(cached) if cached.len() == size => Ok(cached),
            Some(cached) => {
                let mut bytes = self.read_through(address, size)?;
                let overlap = cached.len().min(size);
                bytes[..overlap].copy_from_slice(&cached[..overlap]);
                Ok(bytes)
            }
            None => {
                debug!(
                    "event=driver_read_fallback file_id={} address={} size={}",
                    self.file_id, address, size
                );
                self.read_through(address, size)
            }
        }
    }

    pub fn write(&mut self, mem_kind: MemKind, address: u64, bytes: &[u8]) -> Result<(), SapError> {
        self.guard()?;
        self.eof = None;
        if mem_kind.is_raw() {
            return Ok(self.file.write(address, bytes)?);
        }
        let mut sink = DirectWrite(&mut self.file);
        let result = self
            .client
            .write(self.file_id, mem_kind, address, bytes, &mut sink);
        self.track(result)
    }

    /// Pushes every cached modification to disk and flushes the real file.
    pub fn flush(&mut self) -> Result<(), SapError> {
        self.guard()?;
        let mut sink = DirectWrite(&mut self.file);
        let result = self.client.flush(self.file_id, &mut sink);
        self.eof = None;
        self.track(result)?;
        Ok(self.file.flush()?)
    }

    /// Collective close: flush, wait for every client, then vote CLOSE.
    ///
    /// Hands back the client, for further files or STOP, and the real file.
    pub fn close(mut self) -> Result<(SapClient<T>, F), SapError> {
        // A failed flush must not keep this rank out of the barrier or the vote.
        let flushed = if self.poisoned { Ok(()) } else { self.flush() };
        if let Err(err) = &flushed {
            warn!(
                "event=driver_close_flush_failed rank={} file_id={} error={}",
                self.session.rank, self.file_id, err
            );
        }
        barrier(self.client.transport(), &self.session.config.clients())?;
        let mut sink = DirectWrite(&mut self.file);
        match self.client.close(self.file_id, &mut sink) {
            Ok(()) => {}
            Err(err) if err.is_catastrophic() => {
                error!(
                    "event=driver_close_poisoned rank={} file_id={}",
                    self.session.rank, self.file_id
                );
            }
            Err(err) => {
                flushed?;
                return Err(err);
            }
        }
        flushed?;
        self.file.flush()?;
        info!(
            "event=driver_close rank={} file_id={}",
            self.session.rank, self.file_id
        );
        Ok((self.client, self.file))
    }

    pub fn get_eoa(&self) -> u64 {
        self.file.get_eoa()
    }

    pub fn set_eoa(&mut self, eoa: u64) -> Result<(), SapError> {
        self.guard()?;
        Ok(self.file.set_eoa(eoa)?)
    }

    /// Physical end of file, cached until the next write or dump.
    pub fn get_eof(&mut self) -> Result<u64, SapError> {
        if let Some(eof) = self.eof {
            return Ok(eof);
        }
        let eof = self.file.get_eof()?;
        self.eof = Some(eof);
        Ok(eof)
    }

    /// Asks the server for `size` bytes of address space.
    pub fn alloc(&mut self, mem_kind: MemKind, size: u64) -> Result<u64, SapError> {
        self.guard()?;
        let result = self.client.alloc(self.file_id, mem_kind, size);
        let allocated = self.track(result)?;
        self.raise_eoa(allocated.end_of_address)?;
        Ok(allocated.address)
    }

    pub fn free(&mut self, mem_kind: MemKind, address: u64, size: u64) -> Result<(), SapError> {
        self.guard()?;
        let result = self.client.free(self.file_id, mem_kind, address, size);
        let eoa = self.track(result)?;
        self.raise_eoa(eoa)
    }

    pub fn lock(&mut self, group: &[LockRequest]) -> Result<(), SapError> {
        self.guard()?;
        let result = self.client.lock(self.file_id, group);
        self.track(result)
    }

    pub fn release(&mut self, objects: &[ObjectId]) -> Result<(), SapError> {
        self.guard()?;
        let result = self.client.release(self.file_id, objects);
        self.track(result)
    }

    /// Reads from the real file. The range may sit in space another rank allocated, which
    /// this rank's end of address has not caught up with yet.
    fn read_through(&mut self, address: u64, size: usize) -> Result<Vec<u8>, SapError> {
        self.raise_eoa(address.saturating_add(size as u64))?;
        Ok(self.file.read(address, size)?)
    }

    fn raise_eoa(&mut self, eoa: u64) -> Result<(), SapError> {
        if eoa > self.file.get_eoa() {
            self.file.set_eoa(eoa)?;
        }
        Ok(())
    }

    fn note_dumps(&mut self, before: u64) {
        if self.client.dumps_received() != before {
            self.eof = None;
        }
    }

    fn guard(&self) -> Result<(), SapError> {
        if self.poisoned {
            Err(SapError::Catastrophic {
                file_id: self.file_id,
            })
        } else {
            Ok(())
        }
    }

    fn track<R>(&mut self, result: Result<R, SapError>) -> Result<R, SapError> {
        if let Err(err) = &result {
            if err.is_catastrophic() && !self.poisoned {
                error!(
                    "event=driver_file_poisoned rank={} file_id={}",
                    self.session.rank, self.file_id
                );
                self.poisoned = true;
            }
        }
        result
    }
}
