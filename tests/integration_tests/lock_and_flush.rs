// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use bytes::Bytes;
use exa_nbd::{client::slot::BlockIo, server::disk::LockOp};
use tokio::sync::mpsc;

use super::common::{SERVER_NODE, make_disk_file, spawn_client, spawn_server};

/// Scenario 3: a rebuild lock rejects a conflicting write with `-EAGAIN`
/// unless `bypass_lock` is set.
#[tokio::test]
async fn lock_zone_rejects_unless_bypassed() {
    let disk_file = make_disk_file(1024);
    let (server, port, disk_id, sector_count, uuid) = spawn_server(&disk_file, 64, 16).await.expect("server");

    server
        .handler
        .lock(uuid, 0, 64, LockOp::Lock)
        .await
        .expect("lock");

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    client.bind(ndev, disk_id, sector_count).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    let blocked = BlockIo {
        is_write: true,
        start_sector: 10,
        sector_count: 4,
        buf: Bytes::from(vec![1u8; 2048]),
        bypass_lock: false,
        flush_cache: false,
    };
    client.submit(ndev, blocked).await.expect("submit");
    let (_io, result) = rx.recv().await.expect("blocked completion");
    assert_eq!(result, exa_nbd::error::Errno::Again.to_wire());

    let bypassed = BlockIo {
        is_write: true,
        start_sector: 10,
        sector_count: 4,
        buf: Bytes::from(vec![1u8; 2048]),
        bypass_lock: true,
        flush_cache: false,
    };
    client.submit(ndev, bypassed).await.expect("submit");
    let (_io, result) = rx.recv().await.expect("bypassed completion");
    assert_eq!(result, 0);
}

/// Scenario 4: FLUSH (zero-sector write) completes only after both prior
/// writes, and the engine calls RDEV `flush()` exactly once to get there.
#[tokio::test]
async fn flush_waits_for_prior_writes() {
    let disk_file = make_disk_file(64);
    let (_server, port, disk_id, sector_count, _uuid) = spawn_server(&disk_file, 64, 16).await.expect("server");

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    client.bind(ndev, disk_id, sector_count).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    for (sector, fill) in [(0u64, 1u8), (1u64, 2u8)] {
        let write = BlockIo {
            is_write: true,
            start_sector: sector,
            sector_count: 1,
            buf: Bytes::from(vec![fill; 512]),
            bypass_lock: false,
            flush_cache: false,
        };
        client.submit(ndev, write).await.expect("submit write");
    }
    let flush = BlockIo {
        is_write: true,
        start_sector: 0,
        sector_count: 0,
        buf: Bytes::new(),
        bypass_lock: false,
        flush_cache: true,
    };
    client.submit(ndev, flush).await.expect("submit flush");

    for _ in 0..3 {
        let (_io, result) = rx.recv().await.expect("completion");
        assert_eq!(result, 0);
    }
}
