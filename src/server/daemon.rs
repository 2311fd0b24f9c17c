// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Server daemon (`spec.md` §4.4): owns the disk table, routes inbound
//! requests to the right disk engine, and serializes lifecycle control
//! messages.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cfg::config::ServerConfig,
    control::{DiskStats, NdevInfo, ServerControl},
    error::Errno,
    rdev::Rdev,
    server::{
        disk::{DiskWorkItem, ExportedDisk, LockCommand, PendingIo},
        disk_engine,
    },
    transport::{NodeId, Transport, TransportHandler},
    wire::{IoDescriptor, IoOp},
};

type ServerTransport = Transport<(), ServerHandler>;

/// Routes inbound headers to the right `ExportedDisk` and decides whether
/// a WRITE payload buffer can be admitted (`spec.md` §4.4 receive
/// callback, `num_receive_headers` back-pressure).
///
/// `disks_by_id` is a `DashMap` rather than an `RwLock<HashMap<_>>` so
/// `deliver` can look the disk up and push onto its `incoming_queue`
/// synchronously, with no `.await` between them — otherwise two messages
/// delivered back-to-back on the same peer connection could race onto the
/// queue out of order, which would break the per-peer FIFO contract
/// (`spec.md` §5).
pub struct ServerHandler {
    disks_by_id: DashMap<i8, Arc<ExportedDisk>>,
    transport: OnceCell<Arc<ServerTransport>>,
    num_receive_headers: usize,
    admitted_buffers: AtomicUsize,
}

impl ServerHandler {
    fn new(num_receive_headers: usize) -> Arc<Self> {
        Arc::new(Self {
            disks_by_id: DashMap::new(),
            transport: OnceCell::new(),
            num_receive_headers,
            admitted_buffers: AtomicUsize::new(0),
        })
    }

    fn bind_transport(&self, t: Arc<ServerTransport>) {
        let _ = self.transport.set(t);
    }

    fn transport(&self) -> Arc<ServerTransport> {
        self.transport.get().expect("transport bound before use").clone()
    }
}

impl TransportHandler<()> for ServerHandler {
    fn payload_len(&self, header: &IoDescriptor) -> usize {
        header.request_payload_len()
    }

    fn keep_receiving(&self, _from: NodeId, header: &IoDescriptor) -> Option<BytesMut> {
        if header.op != IoOp::Write || header.sector_count == 0 {
            return None;
        }
        loop {
            let current = self.admitted_buffers.load(Ordering::SeqCst);
            if current >= self.num_receive_headers {
                return None;
            }
            if self
                .admitted_buffers
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(BytesMut::zeroed(header.request_payload_len()));
            }
        }
    }

    /// Synchronous on purpose (see the struct doc comment): the disk
    /// lookup and the push onto `queue_tx` both happen inline here, in
    /// the exact order the transport's reader task delivers messages.
    /// Only the async reply-send is deferred to a spawned task.
    fn deliver(&self, from: NodeId, header: IoDescriptor, payload: Bytes) {
        let admitted = header.op == IoOp::Write
            && header.sector_count > 0
            && payload.len() == header.request_payload_len();
        if admitted {
            self.admitted_buffers.fetch_sub(1, Ordering::SeqCst);
        }

        let Some(disk) = self.disks_by_id.get(&header.disk_id).map(|d| Arc::clone(&d)) else {
            // Unknown disk_id: synthesize -EIO (`spec.md` §4.4, §4.6
            // failure table), not -ENOENT.
            self.spawn_synthesized_reply(from, header, Errno::Io);
            return;
        };

        if !admitted_or_not_applicable(&header, &payload) {
            // Receive-pool exhaustion (`spec.md` §4.4 step 1 / §8 scenario 6):
            // bytes already drained by the transport, framing intact.
            self.spawn_synthesized_reply(from, header, Errno::Io);
            return;
        }

        let (tx, rx) = oneshot::channel();
        let item = DiskWorkItem::Io(PendingIo {
            header,
            payload,
            from_peer: from,
            finisher: tx,
        });
        if disk.queue_tx.send(item).is_err() {
            self.spawn_synthesized_reply(from, header, Errno::Io);
            return;
        }

        let transport = self.transport();
        tokio::spawn(async move {
            if let Ok((reply_header, reply_payload)) = rx.await {
                send_reply(&transport, from, reply_header, reply_payload).await;
            }
        });
    }

    fn end_sending(&self, _ctx: (), result: std::result::Result<(), Errno>) {
        if let Err(e) = result {
            warn!("reply send failed: {e:?}");
        }
    }
}

impl ServerHandler {
    /// Fires off the async reply-send for a result this handler decided
    /// without ever reaching the disk engine (unknown disk, receive-pool
    /// exhaustion, or a dead engine task).
    fn spawn_synthesized_reply(&self, from: NodeId, mut header: IoDescriptor, errno: Errno) {
        header.result = errno.to_wire();
        header.strip_payload_for_reply();
        let transport = self.transport();
        tokio::spawn(async move {
            send_reply(&transport, from, header, Bytes::new()).await;
        });
    }

    pub async fn export(
        &self,
        uuid: Uuid,
        path: &str,
        ring_capacity: usize,
        next_disk_id: &mut i8,
    ) -> Result<NdevInfo> {
        let rdev = Rdev::handle_alloc(path, ring_capacity)
            .await
            .with_context(|| format!("exporting {uuid} at {path}"))?;
        let sector_count = rdev.sector_count();
        let disk_id = *next_disk_id;
        *next_disk_id += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let disk = Arc::new(ExportedDisk::new(uuid, disk_id, rdev, tx));
        self.disks_by_id.insert(disk_id, Arc::clone(&disk));

        tokio::spawn(disk_engine::run(disk, rx));

        Ok(NdevInfo { disk_id, sector_count })
    }

    pub async fn unexport(&self, uuid: Uuid) -> Result<()> {
        let key = self
            .disks_by_id
            .iter()
            .find(|e| e.value().uuid == uuid)
            .map(|e| *e.key())
            .ok_or_else(|| anyhow!("unknown disk {uuid}"))?;
        let (_, disk) = self.disks_by_id.remove(&key).expect("key just found");
        disk.request_exit();
        Ok(())
    }

    pub async fn lock(
        &self,
        uuid: Uuid,
        start_sector: u64,
        sector_count: u64,
        op: crate::server::disk::LockOp,
    ) -> Result<()> {
        let disk = self
            .disks_by_id
            .iter()
            .find(|e| e.value().uuid == uuid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| anyhow!("unknown disk {uuid}"))?;
        let (tx, rx) = oneshot::channel();
        disk.queue_tx
            .send(DiskWorkItem::Lock(LockCommand {
                op,
                start_sector,
                sector_count,
                reply: tx,
            }))
            .map_err(|_| anyhow!("disk engine for {uuid} is gone"))?;
        rx.await.context("lock reply channel dropped")?
    }

    pub async fn stats(&self, uuid: Uuid, reset: bool) -> Result<DiskStats> {
        let disk = self
            .disks_by_id
            .iter()
            .find(|e| e.value().uuid == uuid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| anyhow!("unknown disk {uuid}"))?;
        let stats = DiskStats {
            submitted: disk.submitted.load(Ordering::Relaxed),
            completed: disk.completed.load(Ordering::Relaxed),
            errors: disk.errors.load(Ordering::Relaxed),
        };
        if reset {
            disk.submitted.store(0, Ordering::Relaxed);
            disk.completed.store(0, Ordering::Relaxed);
            disk.errors.store(0, Ordering::Relaxed);
        }
        Ok(stats)
    }

    pub async fn ndev_info(&self, uuid: Uuid) -> Result<NdevInfo> {
        let disk = self
            .disks_by_id
            .iter()
            .find(|e| e.value().uuid == uuid)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| anyhow!("unknown disk {uuid}"))?;
        Ok(NdevInfo {
            disk_id: disk.server_side_disk_id,
            sector_count: disk.sector_count,
        })
    }
}

fn admitted_or_not_applicable(header: &IoDescriptor, payload: &Bytes) -> bool {
    if header.op != IoOp::Write || header.sector_count == 0 {
        return true;
    }
    payload.len() == header.request_payload_len()
}

async fn send_reply(
    transport: &Arc<ServerTransport>,
    to: NodeId,
    header: IoDescriptor,
    payload: Bytes,
) {
    let payload = if payload.is_empty() { None } else { Some(payload) };
    transport.send(to, header.to_bytes(), payload, ()).await;
}

/// Owns the handler and the transport together; the daemon's single
/// long-lived value, constructed once in `main` (`spec.md` §9: no global
/// singleton).
pub struct Server {
    pub handler: Arc<ServerHandler>,
    pub transport: Arc<ServerTransport>,
    pub cfg: ServerConfig,
    next_disk_id: tokio::sync::Mutex<i8>,
}

impl Server {
    pub fn new(cfg: ServerConfig, cancel: CancellationToken) -> Self {
        let handler = ServerHandler::new(cfg.num_receive_headers);
        let transport = Transport::new(
            Arc::clone(&handler),
            cfg.bind_ip,
            cfg.send_buf_bytes,
            cfg.recv_buf_bytes,
            cancel,
        );
        handler.bind_transport(Arc::clone(&transport));
        Self {
            handler,
            transport,
            cfg,
            next_disk_id: tokio::sync::Mutex::new(1),
        }
    }

    /// Convenience wrapper around `ServerControl::Export` for callers that
    /// already hold a `&Server` directly (tests, embedding binaries) and
    /// don't need to round-trip through the control mailbox.
    pub async fn export(&self, uuid: Uuid, path: &str, ring_capacity: usize) -> Result<NdevInfo> {
        let mut next_id = self.next_disk_id.lock().await;
        self.handler.export(uuid, path, ring_capacity, &mut next_id).await
    }

    pub async fn run_control_loop(&self, mut rx: mpsc::UnboundedReceiver<ServerControl>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ServerControl::Quit => {
                    self.transport.shutdown();
                    break;
                },
                ServerControl::Export { uuid, path, ring_capacity, reply } => {
                    let mut next_id = self.next_disk_id.lock().await;
                    let result = self
                        .handler
                        .export(uuid, &path, ring_capacity, &mut next_id)
                        .await;
                    let _ = reply.send(result);
                },
                ServerControl::Unexport { uuid, reply } => {
                    let _ = reply.send(self.handler.unexport(uuid).await);
                },
                ServerControl::AddClient { node_id, ip, reply } => {
                    self.transport.add_peer(node_id, ip).await;
                    let _ = reply.send(Ok(()));
                },
                ServerControl::RemoveClient { node_id, reply } => {
                    self.transport.remove_peer(node_id).await;
                    let _ = reply.send(Ok(()));
                },
                ServerControl::NdevInfo { uuid, reply } => {
                    let _ = reply.send(self.handler.ndev_info(uuid).await);
                },
                ServerControl::Lock { uuid, start_sector, sector_count, op, reply } => {
                    let _ = reply.send(
                        self.handler.lock(uuid, start_sector, sector_count, op).await,
                    );
                },
                ServerControl::Stats { uuid, reset, reply } => {
                    let _ = reply.send(self.handler.stats(uuid, reset).await);
                },
            }
        }
        info!("server control loop exited");
    }

    pub async fn run_accept_loop(&self) -> Result<()> {
        self.transport.run_accept_loop(self.cfg.data_port).await
    }

    pub fn bind_nodes(&self, node_table: &[(NodeId, IpAddr)]) {
        let transport = Arc::clone(&self.transport);
        let nodes = node_table.to_vec();
        tokio::spawn(async move {
            for (node_id, ip) in nodes {
                transport.add_peer(node_id, ip).await;
            }
        });
    }
}
