#![allow(dead_code)]

use flexpar::client::{DumpSink, SapClient};
use flexpar::config::{ServiceConfig, Session};
use flexpar::server::SapServer;
use flexpar::telemetry::MetricsSnapshot;
use flexpar::transport::{LocalFabric, LocalTransport};
use flexpar::util::{SapError, StorageError};
use flexpar::wire::{MemKind, Rank};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Receives that take longer than this fail the test instead of hanging it.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// An in-process service: the server runs on its own thread over a [`LocalFabric`].
pub struct Cluster {
    pub config: ServiceConfig,
    fabric: LocalFabric,
    server: Option<JoinHandle<Result<MetricsSnapshot, SapError>>>,
}

impl Cluster {
    pub fn start(participants: u32) -> Self {
        Self::start_with(participants, |_| {})
    }

    pub fn start_with(participants: u32, tweak: impl FnOnce(&mut ServiceConfig)) -> Self {
        let mut config = ServiceConfig::with_participants(participants);
        tweak(&mut config);
        let fabric = LocalFabric::with_recv_timeout(participants, Some(RECV_TIMEOUT));
        let session = Session::new(config.clone(), config.server_rank).unwrap();
        let endpoint = fabric.endpoint(config.server_rank).unwrap();
        let server = thread::spawn(move || {
            let mut server = SapServer::new(endpoint, &session)?;
            server.run()
        });
        Self {
            config,
            fabric,
            server: Some(server),
        }
    }

    pub fn session(&self, rank: Rank) -> Session {
        Session::new(self.config.clone(), rank).unwrap()
    }

    pub fn endpoint(&self, rank: Rank) -> LocalTransport {
        self.fabric.endpoint(rank).unwrap()
    }

    pub fn client(&self, rank: Rank) -> SapClient<LocalTransport> {
        SapClient::new(self.endpoint(rank), &self.session(rank)).unwrap()
    }

    pub fn clients(&self) -> Vec<Rank> {
        self.config.clients()
    }

    /// Waits for the server to exit after every client sent STOP.
    pub fn join(mut self) -> MetricsSnapshot {
        let handle = self.server.take().expect("server already joined");
        handle
            .join()
            .expect("server thread panicked")
            .expect("server loop failed")
    }

    /// Sends STOP from every client that has not been handed out to a thread.
    pub fn stop_all(self) -> MetricsSnapshot {
        for rank in self.clients() {
            self.client(rank).stop().unwrap();
        }
        self.join()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.server.is_some() {
            self.fabric.shutdown();
        }
    }
}

/// Records every dumped entry, optionally refusing them all.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub entries: Vec<(MemKind, u64, Vec<u8>)>,
    pub refuse: bool,
}

impl RecordingSink {
    pub fn refusing() -> Self {
        Self {
            entries: Vec::new(),
            refuse: true,
        }
    }

    pub fn addresses(&self) -> Vec<u64> {
        self.entries.iter().map(|(_, address, _)| *address).collect()
    }
}

impl DumpSink for RecordingSink {
    fn persist(
        &mut self,
        mem_kind: MemKind,
        address: u64,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        if self.refuse {
            return Err(StorageError::Other("sink refuses writes".into()));
        }
        self.entries.push((mem_kind, address, payload.to_vec()));
        Ok(())
    }
}
