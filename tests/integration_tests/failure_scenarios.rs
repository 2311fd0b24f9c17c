// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use exa_nbd::client::slot::BlockIo;
use tokio::sync::mpsc;

use super::common::{SERVER_NODE, make_disk_file, spawn_client, spawn_server, until};

/// Scenario 2: a dropped peer connection strands in-flight requests
/// rather than failing them outright; only `suspend`/`down`/`resume`
/// retires them with `-EIO` (`spec.md` §4.5 invariant I6).
#[tokio::test]
async fn peer_drop_strands_then_resume_retires() {
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

    client.transport.remove_peer(SERVER_NODE).await;

    let read = BlockIo {
        is_write: false,
        start_sector: 0,
        sector_count: 1,
        buf: Bytes::new(),
        bypass_lock: false,
        flush_cache: false,
    };
    client.submit(ndev, read).await.expect("submit read");

    let stranded = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(stranded.is_err(), "read completed while peer was down; should be stranded");

    client.suspend(ndev).await.expect("suspend");
    client.set_direction(ndev, true).await.expect("down");
    client.resume(ndev).await.expect("resume");

    let (_io, result) = tokio::time::timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("retired completion within 100ms")
        .expect("channel open");
    assert_eq!(result, exa_nbd::error::Errno::Io.to_wire());
}

/// Failure-semantics table: an unknown `disk_id` is synthesized as
/// `-EIO` by the server, with no state change on either side.
#[tokio::test]
async fn unknown_disk_id_yields_synthesized_io_error() {
    let disk_file = make_disk_file(64);
    let (_server, port, _disk_id, _sector_count, _uuid) = spawn_server(&disk_file, 64, 16).await.expect("server");

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    // Bind to a disk id the server never exported.
    client.bind(ndev, 99, 64).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    let read = BlockIo {
        is_write: false,
        start_sector: 0,
        sector_count: 1,
        buf: Bytes::new(),
        bypass_lock: false,
        flush_cache: false,
    };
    client.submit(ndev, read).await.expect("submit read");

    let (_io, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("completion within 5s")
        .expect("channel open");
    assert_eq!(result, exa_nbd::error::Errno::Io.to_wire());
}

/// Scenario 6: receive-pool exhaustion fails the overflow requests with
/// `-EIO` but keeps the framing synchronized — a later request on the
/// same peer still succeeds.
#[tokio::test]
async fn receive_pool_exhaustion_fails_overflow_but_keeps_framing() {
    let disk_file = make_disk_file(64);
    let (_server, port, disk_id, sector_count, _uuid) = spawn_server(&disk_file, 64, 2).await.expect("server");

    let client = spawn_client(port, 64).await.expect("client");
    let ndev = client.new_ndev(uuid::Uuid::new_v4(), SERVER_NODE).await;
    client.bind(ndev, disk_id, sector_count).await.expect("bind");

    let (tx, mut rx) = mpsc::unbounded_channel();
    client
        .register_end_io(ndev, Arc::new(move |io: BlockIo, result: i8| {
            let _ = tx.send((io, result));
        }))
        .await;

    for i in 0..5u64 {
        let write = BlockIo {
            is_write: true,
            start_sector: i,
            sector_count: 1,
            buf: Bytes::from(vec![i as u8; 512]),
            bypass_lock: false,
            flush_cache: false,
        };
        client.submit(ndev, write).await.expect("submit");
    }

    let mut results = Vec::new();
    let ok = until(Duration::from_secs(10), || {
        while let Ok((_io, result)) = rx.try_recv() {
            results.push(result);
        }
        results.len() >= 5
    })
    .await;
    assert!(ok, "only {}/5 writes completed", results.len());

    let failures = results.iter().filter(|&&r| r == exa_nbd::error::Errno::Io.to_wire()).count();
    assert!(failures >= 3, "expected at least 3 overflow failures, got {failures}");

    let read = BlockIo {
        is_write: false,
        start_sector: 0,
        sector_count: 1,
        buf: Bytes::new(),
        bypass_lock: false,
        flush_cache: false,
    };
    client.submit(ndev, read).await.expect("submit read");
    let (_io, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("read completion within 5s")
        .expect("channel open");
    assert_eq!(result, 0, "framing desynchronized after receive-pool overflow");
}
