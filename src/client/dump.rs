use crate::transport::{Channel, Transport};
use crate::util::{SapError, StorageError};
use crate::wire::{FileId, MemKind, Rank, ReadReply, Reply, RequestKey, Status, WireError};
use log::{debug, warn};

/// Destination for cache entries the server pushes out during a dump.
///
/// Implementations write straight to the real file, bypassing the metadata cache.
pub trait DumpSink {
    fn persist(&mut self, mem_kind: MemKind, address: u64, payload: &[u8])
        -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpSummary {
    pub entries: u64,
    pub bytes: u64,
    /// Every entry reached the sink and the server was told to drop its cache.
    pub persisted: bool,
}

/// Receives one dump stream for the request `key` and acknowledges it on DUMP.
///
/// After the first sink failure the remaining entries are still drained so the stream
/// stays aligned, and the acknowledgement reports DUMPING_FAILED.
pub fn receive_dump<T: Transport + ?Sized>(
    transport: &T,
    server: Rank,
    key: RequestKey,
    file_id: FileId,
    sink: &mut dyn DumpSink,
) -> Result<DumpSummary, SapError> {
    let mut summary = DumpSummary::default();
    let mut failure: Option<StorageError> = None;
    loop {
        let header = ReadReply::decode(&transport.recv_from(server, Channel::Dump)?)?;
        if header.request_id != key.request_id {
            return Err(SapError::Protocol(format!(
                "dump entry for request {} while waiting on {}",
                header.request_id, key
            )));
        }
        match header.status {
            Status::Dumping => {
                let payload = transport.recv_from(server, Channel::Dump)?;
                if payload.len() as u64 != header.payload_size {
                    return Err(WireError::PayloadLength {
                        announced: header.payload_size,
                        received: payload.len(),
                    }
                    .into());
                }
                if failure.is_none() {
                    if let Err(err) = sink.persist(header.mem_kind, header.address, &payload) {
                        warn!(
                            "event=dump_persist_failed file_id={} address={} error={}",
                            file_id, header.address, err
                        );
                        failure = Some(err);
                    }
                }
                summary.entries += 1;
                summary.bytes += payload.len() as u64;
            }
            Status::DumpingFinished => break,
            other => {
                return Err(SapError::Protocol(format!(
                    "unexpected status {other} inside dump for {key}"
                )))
            }
        }
    }
    summary.persisted = failure.is_none();
    let status = if summary.persisted {
        Status::DumpingFinished
    } else {
        Status::DumpingFailed
    };
    let ack = Reply::new(key.request_id, file_id, status);
    transport.send(server, Channel::Dump, &ack.encode())?;
    debug!(
        "event=dump_received key={} file_id={} entries={} bytes={} persisted={}",
        key, file_id, summary.entries, summary.bytes, summary.persisted
    );
    Ok(summary)
}
