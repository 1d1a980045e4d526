use super::{Channel, Transport, TransportError};
use crate::wire::Rank;
use log::debug;

const BARRIER_ARRIVE: u8 = 0xA1;
const BARRIER_RELEASE: u8 = 0xA2;

/// Blocks until every rank in `group` has entered the barrier.
///
/// The first rank of the group gathers one arrival token per member and then releases
/// them. Ranks outside `group` must not call this. Consecutive barriers over the same
/// group are safe because tokens from one sender stay ordered.
pub fn barrier<T: Transport + ?Sized>(transport: &T, group: &[Rank]) -> Result<(), TransportError> {
    let me = transport.rank();
    let Some(&root) = group.first() else {
        return Ok(());
    };
    if !group.contains(&me) {
        return Err(TransportError::Setup(format!(
            "rank {me} is not a member of barrier group {group:?}"
        )));
    }
    if me == root {
        for &member in group.iter().skip(1) {
            let token = transport.recv_from(member, Channel::Barrier)?;
            expect_token(&token, BARRIER_ARRIVE, member)?;
        }
        for &member in group.iter().skip(1) {
            transport.send(member, Channel::Barrier, &[BARRIER_RELEASE])?;
        }
    } else {
        transport.send(root, Channel::Barrier, &[BARRIER_ARRIVE])?;
        let token = transport.recv_from(root, Channel::Barrier)?;
        expect_token(&token, BARRIER_RELEASE, root)?;
    }
    debug!("event=barrier_passed rank={} group_len={}", me, group.len());
    Ok(())
}

fn expect_token(token: &[u8], expected: u8, peer: Rank) -> Result<(), TransportError> {
    if token == [expected] {
        Ok(())
    } else {
        Err(TransportError::MalformedFrame {
            peer: format!("rank {peer}"),
            reason: format!("unexpected barrier token {token:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalFabric;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn nobody_leaves_before_everyone_arrives() {
        let fabric = LocalFabric::with_recv_timeout(4, Some(Duration::from_secs(5)));
        let arrived = Arc::new(AtomicUsize::new(0));
        let group: Vec<Rank> = vec![1, 2, 3];
        let handles: Vec<_> = group
            .iter()
            .map(|&rank| {
                let endpoint = fabric.endpoint(rank).unwrap();
                let arrived = arrived.clone();
                let group = group.clone();
                thread::spawn(move || {
                    for round in 1..=2 {
                        arrived.fetch_add(1, Ordering::SeqCst);
                        barrier(&endpoint, &group).unwrap();
                        assert!(arrived.load(Ordering::SeqCst) >= round * 3);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn outsiders_are_refused() {
        let fabric = LocalFabric::new(3);
        let outsider = fabric.endpoint(0).unwrap();
        assert!(barrier(&outsider, &[1, 2]).is_err());
        assert!(barrier(&outsider, &[]).is_ok());
    }
}
