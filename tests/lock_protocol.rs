#[path = "support/cluster.rs"]
mod cluster;

use cluster::{Cluster, RecordingSink};
use flexpar::server::LockRequest;
use flexpar::transport::{Channel, Transport};
use flexpar::wire::{
    LockKind, MemKind, ObjectId, ObjectKind, OpenParams, Reply, Request, RequestKey, RequestKind,
    Status,
};

fn oid(n: u64) -> ObjectId {
    ObjectId::from_address(0x1000 + n)
}

fn want(n: u64, lock_kind: LockKind) -> LockRequest {
    LockRequest {
        object_id: oid(n),
        object_kind: ObjectKind::Dataset,
        lock_kind,
    }
}

#[test]
fn write_lock_excludes_other_ranks_until_released() {
    let cluster = Cluster::start(3);
    let mut a = cluster.client(0);
    let mut b = cluster.client(1);
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    a.lock(file_id, &[want(1, LockKind::Write)]).unwrap();
    let err = b.lock(file_id, &[want(1, LockKind::Read)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::LockFailed));

    // Re-entrant for the holder.
    a.lock(file_id, &[want(1, LockKind::Write)]).unwrap();
    a.release(file_id, &[oid(1)]).unwrap();
    assert!(b.lock(file_id, &[want(1, LockKind::Read)]).is_err());
    a.release(file_id, &[oid(1)]).unwrap();
    b.lock(file_id, &[want(1, LockKind::Read)]).unwrap();

    // Readers share.
    a.lock(file_id, &[want(1, LockKind::Read)]).unwrap();
    let err = a.lock(file_id, &[want(1, LockKind::Write)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::LockFailed));

    drop((a, b));
    cluster.stop_all();
}

#[test]
fn failed_group_leaves_nothing_held() {
    let cluster = Cluster::start(3);
    let mut a = cluster.client(0);
    let mut b = cluster.client(1);
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    b.lock(file_id, &[want(2, LockKind::Write)]).unwrap();
    let group = [
        want(1, LockKind::Write),
        want(2, LockKind::Write),
        want(3, LockKind::Write),
    ];
    let err = a.lock(file_id, &group).unwrap_err();
    assert_eq!(err.status(), Some(Status::LockFailed));

    // Neither A nor C stayed locked by the failed group.
    b.lock(file_id, &[want(1, LockKind::Write), want(3, LockKind::Write)])
        .unwrap();
    b.release(file_id, &[oid(1), oid(2), oid(3)]).unwrap();
    a.lock(file_id, &group).unwrap();

    drop((a, b));
    cluster.stop_all();
}

#[test]
fn release_checks_existence_then_ownership() {
    let cluster = Cluster::start(3);
    let mut a = cluster.client(0);
    let mut b = cluster.client(1);
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    let err = a.release(file_id, &[oid(7)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::NoLock));

    a.lock(file_id, &[want(7, LockKind::Write), want(8, LockKind::Read)])
        .unwrap();
    let err = b.release(file_id, &[oid(8), oid(7)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::BadLock));

    // The failed release group did not touch a's references.
    a.release(file_id, &[oid(7), oid(8)]).unwrap();
    let err = a.release(file_id, &[oid(7)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::NoLock));

    drop((a, b));
    cluster.stop_all();
}

#[test]
fn oversized_groups_and_lock_capacity_fail_cleanly() {
    let cluster = Cluster::start_with(2, |config| {
        config.max_group_len = 4;
        config.max_locks_per_file = 6;
    });
    let mut a = cluster.client(0);
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    let too_long: Vec<_> = (0..5).map(|n| want(n, LockKind::Read)).collect();
    let err = a.lock(file_id, &too_long).unwrap_err();
    assert_eq!(err.status(), Some(Status::LockFailed));

    a.lock(file_id, &(0..4).map(|n| want(n, LockKind::Read)).collect::<Vec<_>>())
        .unwrap();
    let err = a
        .lock(file_id, &(4..7).map(|n| want(n, LockKind::Read)).collect::<Vec<_>>())
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::Oom));
    a.lock(file_id, &[want(4, LockKind::Read), want(5, LockKind::Read)])
        .unwrap();

    drop(a);
    cluster.stop_all();
}

#[test]
fn lock_on_closing_file_is_refused() {
    let cluster = Cluster::start(3);
    let mut a = cluster.client(0);
    let mut b = cluster.client(1);
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    a.close(file_id, &mut RecordingSink::default()).unwrap();
    let err = b.lock(file_id, &[want(1, LockKind::Read)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::FileClosing));
    b.close(file_id, &mut RecordingSink::default()).unwrap();

    let err = b.lock(file_id, &[want(1, LockKind::Read)]).unwrap_err();
    assert_eq!(err.status(), Some(Status::BadFileId));

    drop((a, b));
    let snapshot = cluster.stop_all();
    assert!(snapshot.counters["flexpar.sap.groups.refused"] >= 2);
}

#[test]
fn non_group_request_abandons_the_open_group_and_is_served() {
    let cluster = Cluster::start(3);
    let server = cluster.config.server_rank;
    let mut a = cluster.client(0);
    let mut b = cluster.client(1);
    let mut sink = RecordingSink::default();
    let file_id = a.open(OpenParams::default(), 0).unwrap().file_id;

    // Rank 0 starts a lock group by hand, then interrupts it with a WRITE.
    let raw = cluster.endpoint(0);
    let mut member = Request::new(RequestKind::Lock, RequestKey::new(0, 1000), file_id);
    member.object_id = oid(1);
    member.object_kind = ObjectKind::Dataset;
    member.lock_kind = LockKind::Write;
    raw.send(server, Channel::Request, &member.encode()).unwrap();

    let mut write = Request::new(RequestKind::Write, RequestKey::new(0, 1001), file_id);
    write.mem_kind = MemKind::Ohdr;
    write.address = 64;
    write.payload_size = 3;
    raw.send(server, Channel::Request, &write.encode()).unwrap();
    raw.send(server, Channel::Metadata, b"hdr").unwrap();

    let reply = Reply::decode(&raw.recv_from(server, Channel::Reply).unwrap()).unwrap();
    assert_eq!(reply.request_id, 1001);
    assert_eq!(reply.status, Status::Ok);

    // The abandoned member took no lock, and the server accepts other senders again.
    b.lock(file_id, &[want(1, LockKind::Write)]).unwrap();
    assert_eq!(
        a.read(file_id, MemKind::Ohdr, 64, 3, &mut sink)
            .unwrap()
            .as_deref(),
        Some(&b"hdr"[..])
    );

    drop((a, b));
    cluster.stop_all();
}
