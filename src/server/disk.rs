// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `ExportedDisk` / `LockZone` / `LockCommand` (`spec.md` §3).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

use crate::{error::Errno, rdev::Rdev, wire::IoDescriptor};

/// A single engine-bound item: either client I/O awaiting transport to
/// deliver its result, or a lifecycle lock command.
pub enum DiskWorkItem {
    Io(PendingIo),
    Lock(LockCommand),
}

/// One request in flight between the transport and the disk engine.
/// `finish()` is the engine's single handoff back to the daemon
/// (`spec.md` §4.3 `finish(req, result)`).
pub struct PendingIo {
    pub header: IoDescriptor,
    pub payload: bytes::Bytes,
    pub from_peer: u32,
    pub finisher: oneshot::Sender<(IoDescriptor, bytes::Bytes)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Lock,
    Unlock,
}

pub struct LockCommand {
    pub op: LockOp,
    pub start_sector: u64,
    pub sector_count: u64,
    pub reply: oneshot::Sender<anyhow::Result<()>>,
}

/// Half-open sector interval. Overlaps with an I/O extent iff the
/// ranges intersect and the I/O's `bypass_lock` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockZone {
    pub start: u64,
    pub count: u64,
}

impl LockZone {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    #[inline]
    pub fn overlaps(&self, start: u64, count: u64) -> bool {
        let other_end = start + count;
        self.start < other_end && start < self.end()
    }
}

/// Maximum simultaneous lock zones a disk may carry; overflow is the
/// programmer-error assertion of `spec.md` §7.
pub const N_LOCKED_ZONES: usize = 64;

/// An exported disk's static identity plus its live engine-facing queue.
/// The engine task owns `locked_zones` exclusively (`spec.md` invariant
/// 4); everything else here is `Send + Sync` so the daemon can look it up
/// from the transport's receive path without touching engine internals.
pub struct ExportedDisk {
    pub uuid: Uuid,
    pub server_side_disk_id: i8,
    pub rdev: Rdev,
    pub sector_count: u64,
    pub queue_tx: mpsc::UnboundedSender<DiskWorkItem>,
    pub exit: AtomicBool,
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub errors: AtomicU64,
    locked_zones: Mutex<Vec<LockZone>>,
}

impl ExportedDisk {
    pub fn new(
        uuid: Uuid,
        server_side_disk_id: i8,
        rdev: Rdev,
        queue_tx: mpsc::UnboundedSender<DiskWorkItem>,
    ) -> Self {
        let sector_count = rdev.sector_count();
        Self {
            uuid,
            server_side_disk_id,
            rdev,
            sector_count,
            queue_tx,
            exit: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            locked_zones: Mutex::new(Vec::new()),
        }
    }

    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    /// Engine-only: apply a lock command to the zone set. Only the
    /// engine task ever calls this, between draining completions and
    /// signalling the waiter (`spec.md` invariant 4).
    pub async fn apply_lock(&self, op: LockOp, zone: LockZone) -> Result<(), Errno> {
        let mut zones = self.locked_zones.lock().await;
        match op {
            LockOp::Lock => {
                assert!(
                    zones.len() < N_LOCKED_ZONES,
                    "lock table overflow on disk {}",
                    self.uuid
                );
                zones.push(zone);
                Ok(())
            },
            LockOp::Unlock => {
                let idx = zones.iter().position(|z| *z == zone).unwrap_or_else(|| {
                    panic!(
                        "unlock of non-held zone {:?} on disk {}",
                        zone, self.uuid
                    )
                });
                zones.swap_remove(idx);
                Ok(())
            },
        }
    }

    pub async fn conflicts(&self, start: u64, count: u64, bypass_lock: bool) -> bool {
        if bypass_lock {
            return false;
        }
        let zones = self.locked_zones.lock().await;
        zones.iter().any(|z| z.overlaps(start, count))
    }
}
