// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Control-plane messages (`spec.md` §6.3), carried on a per-daemon
//! `tokio::sync::mpsc` "control mailbox" and serialized by the daemon's
//! own event loop, matching the source's `nbd_request`/`nbd_answer` pair
//! (`original_source/nbd/service/include/nbd_msg.h`) plus the lock
//! message (`ExamsgNbdLock`) and `STATS` the distillation left implicit.

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{rdev::Rdev, server::disk::LockOp};

/// Per-disk submit/completion counters returned by `STATS`
/// (`spec.md` §8's counters; `stats_reset` kept split per §9's note on
/// non-overlapping lock scopes).
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStats {
    pub submitted: u64,
    pub completed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct NdevInfo {
    pub disk_id: i8,
    pub sector_count: u64,
}

/// Server-side control-plane requests.
pub enum ServerControl {
    Quit,
    Stats {
        uuid: Uuid,
        reset: bool,
        reply: oneshot::Sender<anyhow::Result<DiskStats>>,
    },
    Export {
        uuid: Uuid,
        path: String,
        ring_capacity: usize,
        reply: oneshot::Sender<anyhow::Result<NdevInfo>>,
    },
    Unexport {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    AddClient {
        node_id: u32,
        ip: std::net::IpAddr,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    RemoveClient {
        node_id: u32,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    NdevInfo {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<NdevInfo>>,
    },
    Lock {
        uuid: Uuid,
        start_sector: u64,
        sector_count: u64,
        op: LockOp,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Client-side control-plane requests (`DEVICE_*` family of §6.3).
pub enum ClientControl {
    Quit,
    Bind {
        uuid: Uuid,
        server_node_id: u32,
        server_side_disk_id: i8,
        sector_count: u64,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Suspend {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Up {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Down {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Resume {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Remove {
        uuid: Uuid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    SessionOpen {
        node_id: u32,
        ip: std::net::IpAddr,
        data_port: u16,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    SessionClose {
        node_id: u32,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Never constructed directly by control-message handling; named here so
/// call sites that need a fresh `Rdev` (export) and the ones that only
/// need to look one up (lock/ndev_info/unexport) share one import.
pub type RdevHandle = Rdev;
