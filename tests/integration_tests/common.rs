// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use exa_nbd::{client::ClientEngine, rdev::SECTOR_BYTES, server::Server};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const SERVER_NODE: u32 = 1;
pub const CLIENT_NODE: u32 = 2;
pub const LOOPBACK: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// A real file standing in for a raw device, sized to hold `sectors`
/// logical sectors plus the reserved metadata prefix (`spec.md` §4.1).
/// In-memory state would need `Rdev` to be generic over its backing
/// store; using a tempfile keeps this test double grounded in the same
/// `handle_alloc` path production disks take.
pub fn make_disk_file(sectors: u64) -> NamedTempFile {
    let f = NamedTempFile::new().expect("tmp file");
    f.as_file()
        .set_len((sectors + exa_nbd::rdev::RDEV_RESERVED_SECTORS) * SECTOR_BYTES)
        .expect("truncate");
    f
}

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind((LOOPBACK, 0)).await.expect("bind ephemeral");
    listener.local_addr().expect("local_addr").port()
}

/// Boots a `Server` on a loopback port and exports one disk. Returns the
/// running server (control loop + accept loop spawned), the data port,
/// the exported disk's server-side id, and its sector count.
pub async fn spawn_server(
    disk_file: &NamedTempFile,
    ring_capacity: usize,
    num_receive_headers: usize,
) -> Result<(Arc<Server>, u16, i8, u64, Uuid)> {
    let data_port = free_port().await;
    let cfg = exa_nbd::cfg::config::ServerConfig {
        node_id: SERVER_NODE,
        bind_ip: LOOPBACK,
        data_port,
        bd_buffer_size: 131_072,
        max_requests: 300,
        net_type: "TCP=64".to_string(),
        barrier_enable: true,
        num_receive_headers,
        ring_capacity,
        node_table: vec![],
        send_buf_bytes: 64 * 1024,
        recv_buf_bytes: 64 * 1024,
    };
    let cancel = CancellationToken::new();
    let server = Arc::new(Server::new(cfg, cancel));
    server.transport.add_peer(CLIENT_NODE, LOOPBACK).await;

    let accept = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = accept.run_accept_loop().await;
    });

    let uuid = Uuid::new_v4();
    let path = disk_file.path().to_str().context("utf8 path")?.to_owned();
    let info = server.export(uuid, &path, ring_capacity).await?;

    Ok((server, data_port, info.disk_id, info.sector_count, uuid))
}

/// Spins up a bare `ClientEngine` (no control-plane daemon wrapper),
/// connected to `server_data_port` as `SERVER_NODE`.
pub async fn spawn_client(server_data_port: u16, max_requests: usize) -> Result<Arc<ClientEngine>> {
    let cancel = CancellationToken::new();
    let engine = ClientEngine::new(LOOPBACK, max_requests, 64 * 1024, 64 * 1024, cancel);
    engine.transport.add_peer(SERVER_NODE, LOOPBACK).await;
    engine.transport.connect_to_peer(SERVER_NODE, server_data_port).await?;
    Ok(engine)
}

pub async fn until(timeout: Duration, mut poll: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if poll() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
