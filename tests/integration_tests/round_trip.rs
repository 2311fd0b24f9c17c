// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use exa_nbd::client::slot::BlockIo;
use tokio::sync::mpsc;

use super::common::{SERVER_NODE, make_disk_file, spawn_client, spawn_server, until};

/// Scenario 1 / R1: WRITE then READ against a freshly exported disk
/// round-trips the written bytes with `result = 0`.
#[tokio::test]
async fn happy_path_write_then_read() {
    let disk_file = make_disk_file(1024);
    let (_server, port, disk_id, sector_count, _uuid) = spawn_server(&disk_file, 128, 16).await.expect("server");
    assert_eq!(sector_count, 1024);

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    client.bind(ndev, disk_id, sector_count).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    let write = BlockIo {
        is_write: true,
        start_sector: 8,
        sector_count: 2,
        buf: Bytes::from(vec![0xAAu8; 1024]),
        bypass_lock: false,
        flush_cache: true,
    };
    client.submit(ndev, write).await.expect("submit write");
    let (io, result) = rx.recv().await.expect("write completion");
    assert_eq!(result, 0);
    assert!(io.is_write);

    let read = BlockIo {
        is_write: false,
        start_sector: 8,
        sector_count: 2,
        buf: Bytes::new(),
        bypass_lock: false,
        flush_cache: false,
    };
    client.submit(ndev, read).await.expect("submit read");
    let (io, result) = rx.recv().await.expect("read completion");
    assert_eq!(result, 0);
    assert_eq!(io.buf.as_ref(), &[0xAAu8; 1024][..]);
}

/// Back-pressure (scenario 5): K+4 writes against a ring of capacity K
/// all eventually complete, none lost.
#[tokio::test]
async fn ring_backpressure_drains_every_request() {
    let disk_file = make_disk_file(256);
    let ring_capacity = 8;
    let (_server, port, disk_id, sector_count, _uuid) =
        spawn_server(&disk_file, ring_capacity, 64).await.expect("server");

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    client.bind(ndev, disk_id, sector_count).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    let total = ring_capacity + 4;
    for i in 0..total {
        let write = BlockIo {
            is_write: true,
            start_sector: i as u64,
            sector_count: 1,
            buf: Bytes::from(vec![i as u8; 512]),
            bypass_lock: false,
            flush_cache: false,
        };
        client.submit(ndev, write).await.expect("submit");
    }

    let mut completed = 0;
    let ok = until(Duration::from_secs(10), || {
        while rx.try_recv().is_ok() {
            completed += 1;
        }
        completed >= total
    })
    .await;
    assert!(ok, "only {completed}/{total} writes completed");
}
