#[path = "support/cluster.rs"]
mod cluster;

use cluster::{Cluster, RecordingSink};
use flexpar::config::FileAccessConfig;
use flexpar::driver::{FlexParallelDriver, MemoryFile, RealFile};
use flexpar::wire::{MemKind, OpenParams, Status};
use std::thread;

#[test]
fn file_info_survives_until_every_client_closes() {
    let cluster = Cluster::start(4);
    let mut clients: Vec<_> = cluster.clients().into_iter().map(|rank| cluster.client(rank)).collect();
    let mut sink = RecordingSink::default();
    let file_id = clients[0].open(OpenParams::default(), 0).unwrap().file_id;

    clients[0].close(file_id, &mut sink).unwrap();
    clients[1].close(file_id, &mut sink).unwrap();
    // N-1 closes: the file is still known to the server.
    assert_eq!(
        clients[2].read(file_id, MemKind::Ohdr, 0, 8, &mut sink).unwrap(),
        None
    );

    clients[2].close(file_id, &mut sink).unwrap();
    let err = clients[2].close(file_id, &mut sink).unwrap_err();
    assert_eq!(err.status(), Some(Status::BadFileId));
    let err = clients[0]
        .read(file_id, MemKind::Ohdr, 0, 8, &mut sink)
        .unwrap_err();
    assert_eq!(err.status(), Some(Status::BadFileId));

    drop(clients);
    cluster.stop_all();
}

#[test]
fn each_open_gets_a_fresh_file_id() {
    let cluster = Cluster::start(2);
    let mut client = cluster.client(0);
    let first = client.open(OpenParams::default(), 0).unwrap();
    let second = client.open(OpenParams::default(), 0).unwrap();
    assert_eq!(first.status, Status::Ok);
    assert_ne!(first.file_id, second.file_id);
    drop(client);
    cluster.stop_all();
}

#[test]
fn drivers_open_write_and_close_collectively() {
    let cluster = Cluster::start(4);
    let handles: Vec<_> = cluster
        .clients()
        .into_iter()
        .map(|rank| {
            let transport = cluster.endpoint(rank);
            let session = cluster.session(rank);
            thread::spawn(move || {
                let mut file = MemoryFile::new();
                file.set_eoa(4096).unwrap();
                let mut driver =
                    FlexParallelDriver::open(transport, session, file, FileAccessConfig::default())
                        .unwrap();
                let address = 1024 * u64::from(rank);
                driver
                    .write(MemKind::Ohdr, address, &[rank as u8 + 1; 16])
                    .unwrap();
                let file_id = driver.file_id();
                let (mut client, file) = driver.close().unwrap();
                client.stop().unwrap();
                (file_id, file)
            })
        })
        .collect();

    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    let file_id = results[0].0;
    assert!(results.iter().all(|(id, _)| *id == file_id));

    // Every cached write reached exactly one rank's real file.
    for rank in 0..3u64 {
        let address = (1024 * rank) as usize;
        let holders = results
            .iter()
            .filter(|(_, file)| {
                file.as_bytes()
                    .get(address..address + 16)
                    .map_or(false, |bytes| bytes == [rank as u8 + 1; 16])
            })
            .count();
        assert_eq!(holders, 1, "write from rank {rank}");
    }

    let snapshot = cluster.join();
    assert_eq!(snapshot.gauges["flexpar.sap.files.open"], 0);
}
