use super::{Channel, Envelope, Mailbox, Source, Transport, TransportError};
use crate::wire::Rank;
use std::sync::Arc;
use std::time::Duration;

/// In-process message fabric: one mailbox per rank, shared by every endpoint.
#[derive(Debug, Clone)]
pub struct LocalFabric {
    mailboxes: Arc<Vec<Arc<Mailbox>>>,
}

impl LocalFabric {
    pub fn new(size: u32) -> Self {
        Self::with_recv_timeout(size, None)
    }

    /// A receive timeout turns a protocol hang into a `TransportError::Timeout`, which is
    /// what tests want. Production sessions block indefinitely.
    pub fn with_recv_timeout(size: u32, recv_timeout: Option<Duration>) -> Self {
        let mailboxes = (0..size)
            .map(|rank| Arc::new(Mailbox::new(rank, size, recv_timeout)))
            .collect();
        Self {
            mailboxes: Arc::new(mailboxes),
        }
    }

    pub fn endpoint(&self, rank: Rank) -> Result<LocalTransport, TransportError> {
        if rank as usize >= self.mailboxes.len() {
            return Err(TransportError::UnknownRank {
                rank,
                size: self.mailboxes.len() as u32,
            });
        }
        Ok(LocalTransport {
            rank,
            mailboxes: self.mailboxes.clone(),
        })
    }

    /// Every endpoint of the fabric, indexed by rank.
    pub fn endpoints(&self) -> Vec<LocalTransport> {
        (0..self.mailboxes.len() as Rank)
            .map(|rank| LocalTransport {
                rank,
                mailboxes: self.mailboxes.clone(),
            })
            .collect()
    }

    /// Unblocks every pending receive with `TransportError::Closed`.
    pub fn shutdown(&self) {
        for mailbox in self.mailboxes.iter() {
            mailbox.close();
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    rank: Rank,
    mailboxes: Arc<Vec<Arc<Mailbox>>>,
}

impl LocalTransport {
    fn mailbox(&self, rank: Rank) -> Result<&Mailbox, TransportError> {
        self.mailboxes
            .get(rank as usize)
            .map(|mailbox| mailbox.as_ref())
            .ok_or(TransportError::UnknownRank {
                rank,
                size: self.mailboxes.len() as u32,
            })
    }
}

impl Transport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> u32 {
        self.mailboxes
            .first()
            .map(|mailbox| mailbox.group_size())
            .unwrap_or(0)
    }

    fn send(&self, dest: Rank, channel: Channel, payload: &[u8]) -> Result<(), TransportError> {
        self.mailbox(dest)?.deliver(Envelope {
            source: self.rank,
            channel,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn recv(&self, source: Source, channel: Channel) -> Result<Envelope, TransportError> {
        if let Source::Rank(rank) = source {
            self.mailbox(rank)?;
        }
        self.mailbox(self.rank)?.take(source, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn endpoints_exchange_messages_across_threads() {
        let fabric = LocalFabric::with_recv_timeout(2, Some(Duration::from_secs(5)));
        let a = fabric.endpoint(0).unwrap();
        let b = fabric.endpoint(1).unwrap();
        let echo = thread::spawn(move || {
            let envelope = b.recv(Source::Any, Channel::Request).unwrap();
            b.send(envelope.source, Channel::Reply, &envelope.payload)
                .unwrap();
        });
        a.send(1, Channel::Request, b"ping").unwrap();
        assert_eq!(a.recv_from(1, Channel::Reply).unwrap(), b"ping".to_vec());
        echo.join().unwrap();
        assert_eq!(a.size(), 2);
    }

    #[test]
    fn unknown_ranks_are_rejected() {
        let fabric = LocalFabric::new(2);
        assert!(fabric.endpoint(2).is_err());
        let a = fabric.endpoint(0).unwrap();
        assert!(matches!(
            a.send(5, Channel::Request, &[]),
            Err(TransportError::UnknownRank { rank: 5, size: 2 })
        ));
    }

    #[test]
    fn shutdown_unblocks_receivers() {
        let fabric = LocalFabric::new(2);
        let a = fabric.endpoint(0).unwrap();
        let waiter = thread::spawn(move || a.recv(Source::Any, Channel::Request));
        fabric.shutdown();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(TransportError::Closed)
        ));
    }
}
