#![cfg(feature = "net")]

use super::{Channel, Envelope, Mailbox, Source, Transport, TransportError};
use crate::timeouts::{
    MESH_ACCEPT_POLL, MESH_ACCEPT_TIMEOUT, MESH_CONNECT_ATTEMPTS, MESH_CONNECT_BACKOFF,
    MESH_CONNECT_MAX_BACKOFF, MESH_SHUTDOWN_GRACE,
};
use crate::util::RetryPolicy;
use crate::wire::Rank;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const HANDSHAKE_MAGIC: u32 = 0x5341_5031;
const FRAME_HEADER_LEN: usize = 5;

/// Static membership of the mesh: one listen address per rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshConfig {
    pub peers: Vec<MeshPeer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPeer {
    pub rank: Rank,
    pub addr: String,
}

impl MeshConfig {
    /// Checks that ranks are exactly `0..n`, each listed once.
    pub fn validate(&self) -> Result<(), TransportError> {
        let mut seen = vec![false; self.peers.len()];
        for peer in &self.peers {
            let slot = seen
                .get_mut(peer.rank as usize)
                .ok_or(TransportError::UnknownRank {
                    rank: peer.rank,
                    size: self.peers.len() as u32,
                })?;
            if *slot {
                return Err(TransportError::Setup(format!(
                    "rank {} listed twice",
                    peer.rank
                )));
            }
            *slot = true;
        }
        Ok(())
    }

    pub fn size(&self) -> u32 {
        self.peers.len() as u32
    }

    fn addr_of(&self, rank: Rank) -> Result<&str, TransportError> {
        self.peers
            .iter()
            .find(|peer| peer.rank == rank)
            .map(|peer| peer.addr.as_str())
            .ok_or(TransportError::UnknownRank {
                rank,
                size: self.size(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct TcpTransportOptions {
    pub connect_retry: RetryPolicy,
    pub accept_timeout: Duration,
    pub recv_timeout: Option<Duration>,
    pub max_frame_len: usize,
}

impl Default for TcpTransportOptions {
    fn default() -> Self {
        Self {
            connect_retry: RetryPolicy::exponential(MESH_CONNECT_ATTEMPTS, MESH_CONNECT_BACKOFF)
                .with_max_delay(MESH_CONNECT_MAX_BACKOFF)
                .with_jitter(0.2),
            accept_timeout: MESH_ACCEPT_TIMEOUT,
            recv_timeout: None,
            max_frame_len: 64 * 1024 * 1024,
        }
    }
}

/// Full TCP mesh. Each rank dials every lower rank and accepts every higher rank; one
/// reader thread per peer feeds the local mailbox.
pub struct TcpTransport {
    rank: Rank,
    size: u32,
    mailbox: Arc<Mailbox>,
    writers: BTreeMap<Rank, Mutex<TcpStream>>,
    readers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl TcpTransport {
    pub fn connect(
        config: &MeshConfig,
        rank: Rank,
        options: TcpTransportOptions,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let size = config.size();
        let own_addr = config.addr_of(rank)?;
        let listener = TcpListener::bind(own_addr)?;
        info!("event=mesh_listen rank={} addr={}", rank, own_addr);

        let mut streams: BTreeMap<Rank, TcpStream> = BTreeMap::new();
        for peer in 0..rank {
            let stream = dial(config.addr_of(peer)?, rank, &options.connect_retry)?;
            info!("event=mesh_dialed rank={} peer={}", rank, peer);
            streams.insert(peer, stream);
        }
        let expected = size - rank - 1;
        if expected > 0 {
            accept_peers(&listener, rank, size, expected, options.accept_timeout, &mut streams)?;
        }

        let mailbox = Arc::new(Mailbox::new(rank, size, options.recv_timeout));
        let mut writers = BTreeMap::new();
        let mut readers = Vec::with_capacity(streams.len());
        for (peer, stream) in streams {
            stream.set_nodelay(true)?;
            let reader = stream.try_clone()?;
            let mailbox = mailbox.clone();
            let max_frame_len = options.max_frame_len;
            readers.push(thread::spawn(move || {
                read_loop(reader, peer, mailbox, max_frame_len);
            }));
            writers.insert(peer, Mutex::new(stream));
        }
        info!("event=mesh_ready rank={} size={}", rank, size);
        Ok(Self {
            rank,
            size,
            mailbox,
            writers,
            readers: Mutex::new(readers),
        })
    }

    /// Closes every connection and waits briefly for reader threads to exit.
    pub fn shutdown(&self) {
        for writer in self.writers.values() {
            let stream = writer.lock();
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.mailbox.close();
        let deadline = Instant::now() + MESH_SHUTDOWN_GRACE;
        let mut readers = self.readers.lock();
        for handle in readers.drain(..) {
            if Instant::now() >= deadline {
                warn!("event=mesh_shutdown_slow rank={}", self.rank);
                break;
            }
            if handle.join().is_err() {
                warn!("event=mesh_reader_panic rank={}", self.rank);
            }
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, dest: Rank, channel: Channel, payload: &[u8]) -> Result<(), TransportError> {
        if dest == self.rank {
            self.mailbox.deliver(Envelope {
                source: self.rank,
                channel,
                payload: payload.to_vec(),
            });
            return Ok(());
        }
        let writer = self.writers.get(&dest).ok_or(TransportError::UnknownRank {
            rank: dest,
            size: self.size,
        })?;
        let mut stream = writer.lock();
        write_frame(&mut *stream, channel, payload)?;
        Ok(())
    }

    fn recv(&self, source: Source, channel: Channel) -> Result<Envelope, TransportError> {
        if let Source::Rank(rank) = source {
            if rank >= self.size {
                return Err(TransportError::UnknownRank {
                    rank,
                    size: self.size,
                });
            }
        }
        self.mailbox.take(source, channel)
    }
}

fn dial(addr: &str, rank: Rank, policy: &RetryPolicy) -> Result<TcpStream, TransportError> {
    let mut retry = policy.handle();
    loop {
        match connect_once(addr) {
            Ok(mut stream) => {
                let mut hello = [0u8; 8];
                hello[..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
                hello[4..].copy_from_slice(&rank.to_le_bytes());
                stream.write_all(&hello)?;
                return Ok(stream);
            }
            Err(err) => match retry.next_delay() {
                Some(delay) => {
                    debug!(
                        "event=mesh_dial_retry rank={} peer_addr={} attempt={} error={}",
                        rank,
                        addr,
                        retry.attempts(),
                        err
                    );
                    thread::sleep(delay);
                }
                None => {
                    warn!(
                        "event=mesh_dial_failed rank={} peer_addr={} error={}",
                        rank, addr, err
                    );
                    return Err(TransportError::Io(err));
                }
            },
        }
    }
}

fn connect_once(addr: &str) -> io::Result<TcpStream> {
    let mut last_err = None;
    for resolved in addr.to_socket_addrs()? {
        match TcpStream::connect(resolved) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::other(format!("{addr} resolved to nothing"))))
}

fn accept_peers(
    listener: &TcpListener,
    rank: Rank,
    size: u32,
    expected: u32,
    timeout: Duration,
    streams: &mut BTreeMap<Rank, TcpStream>,
) -> Result<(), TransportError> {
    listener.set_nonblocking(true)?;
    let deadline = Instant::now() + timeout;
    let mut accepted = 0;
    while accepted < expected {
        match listener.accept() {
            Ok((mut stream, addr)) => {
                stream.set_nonblocking(false)?;
                let peer = read_handshake(&mut stream, &addr)?;
                if peer <= rank || peer >= size || streams.contains_key(&peer) {
                    return Err(TransportError::Setup(format!(
                        "unexpected handshake from rank {peer} at {addr}"
                    )));
                }
                info!("event=mesh_accepted rank={} peer={} addr={}", rank, peer, addr);
                streams.insert(peer, stream);
                accepted += 1;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(TransportError::Setup(format!(
                        "rank {rank} accepted {accepted} of {expected} peers before timeout"
                    )));
                }
                thread::sleep(MESH_ACCEPT_POLL);
            }
            Err(err) => return Err(TransportError::Io(err)),
        }
    }
    Ok(())
}

fn read_handshake(stream: &mut TcpStream, addr: &SocketAddr) -> Result<Rank, TransportError> {
    let mut hello = [0u8; 8];
    stream.read_exact(&mut hello)?;
    let magic = u32::from_le_bytes(hello[..4].try_into().map_err(|_| malformed(addr, "hello"))?);
    if magic != HANDSHAKE_MAGIC {
        return Err(malformed(addr, "bad handshake magic"));
    }
    Ok(u32::from_le_bytes(
        hello[4..].try_into().map_err(|_| malformed(addr, "hello"))?,
    ))
}

fn malformed(addr: &SocketAddr, reason: &str) -> TransportError {
    TransportError::MalformedFrame {
        peer: addr.to_string(),
        reason: reason.to_string(),
    }
}

fn write_frame(stream: &mut impl Write, channel: Channel, payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u32 length"))?;
    let mut header = [0u8; FRAME_HEADER_LEN];
    header[0] = channel.code();
    header[1..].copy_from_slice(&len.to_le_bytes());
    stream.write_all(&header)?;
    stream.write_all(payload)?;
    stream.flush()
}

fn read_frame(
    stream: &mut impl Read,
    max_frame_len: usize,
) -> io::Result<Option<(Channel, Vec<u8>)>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let channel = Channel::from_code(header[0]).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown channel {}", header[0]),
        )
    })?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[1..]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_frame_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit {max_frame_len}"),
        ));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(Some((channel, payload)))
}

fn read_loop(mut stream: TcpStream, peer: Rank, mailbox: Arc<Mailbox>, max_frame_len: usize) {
    loop {
        match read_frame(&mut stream, max_frame_len) {
            Ok(Some((channel, payload))) => mailbox.deliver(Envelope {
                source: peer,
                channel,
                payload,
            }),
            Ok(None) => {
                debug!("event=mesh_peer_closed peer={}", peer);
                break;
            }
            Err(err) => {
                warn!("event=mesh_read_error peer={} error={}", peer, err);
                break;
            }
        }
    }
    mailbox.mark_disconnected(peer);
}
